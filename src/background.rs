//! Periodic background sweeps.
//!
//! Each [`PeriodicTask`] owns a named thread that runs its tick every
//! interval until told to stop. Stopping waits for the thread only up to a
//! bound; a thread stuck in a long tick is detached rather than blocking
//! shutdown.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

/// Join bound used when a task is dropped without an explicit stop
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeriodicTask {
    name: String,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start a thread named `name` running `tick` every `interval`.
    /// The first tick happens one interval after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::debug!(task = %thread_name, "periodic_task_started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(task = %thread_name, "periodic_task_stopped");
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            name: name.to_string(),
            stop_tx,
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait up to `timeout` for it to exit.
    ///
    /// Returns false if the thread did not finish in time; it is then left
    /// detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let _ = self.stop_tx.try_send(());
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::error!(task = %self.name, "periodic_task_panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    task = %self.name,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "periodic_task_stop_timeout"
                );
                false
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop(DROP_STOP_TIMEOUT);
    }
}
