//! Resource Monitor
//!
//! Reads memory usage and limit from cgroup accounting files and turns them
//! into a utilization figure and a pressure flag.
//!
//! Either number may be unavailable (no cgroup, unlimited cgroup, unreadable
//! file). Unavailable means "assume there is capacity", never an error.
//!
//! ## Paths
//!
//! | Version | Usage | Limit |
//! |---|---|---|
//! | v2 | `memory.current` | `memory.max` (`max` = unlimited) |
//! | v1 | `memory/memory.usage_in_bytes` | `memory/memory.limit_in_bytes` |

use crate::clock::SharedClock;
use crate::config::MemoryConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// v1 reports "no limit" as a page-aligned value near `i64::MAX`
const CGROUP_V1_UNLIMITED: u64 = 1 << 60;

/// Pressure, once raised, clears only below `threshold - margin`
const PRESSURE_CLEAR_MARGIN: f64 = 0.05;

/// Memory figures in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub current_bytes: Option<u64>,
    pub limit_bytes: Option<u64>,
}

impl MemoryUsage {
    pub fn new(current_bytes: Option<u64>, limit_bytes: Option<u64>) -> Self {
        Self {
            current_bytes,
            limit_bytes,
        }
    }

    /// current / limit, when both are known
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> Option<f64> {
        match (self.current_bytes, self.limit_bytes) {
            (Some(current), Some(limit)) if limit > 0 => Some(current as f64 / limit as f64),
            _ => None,
        }
    }

    /// limit - current, when both are known
    pub fn available_bytes(&self) -> Option<u64> {
        match (self.current_bytes, self.limit_bytes) {
            (Some(current), Some(limit)) => Some(limit.saturating_sub(current)),
            _ => None,
        }
    }
}

/// Where memory figures come from
pub trait MemorySource: Send + Sync {
    fn read(&self) -> MemoryUsage;
}

/// cgroup v2 with v1 fallback
#[derive(Debug, Clone)]
pub struct CgroupMemorySource {
    root: PathBuf,
}

impl CgroupMemorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_v2(&self) -> Option<MemoryUsage> {
        let current = read_u64(&self.root.join("memory.current"))?;
        let limit = match fs::read_to_string(self.root.join("memory.max")) {
            Ok(raw) if raw.trim() == "max" => None,
            Ok(raw) => raw.trim().parse().ok(),
            Err(_) => None,
        };
        Some(MemoryUsage::new(Some(current), limit))
    }

    fn read_v1(&self) -> Option<MemoryUsage> {
        let dir = self.root.join("memory");
        let current = read_u64(&dir.join("memory.usage_in_bytes"));
        let limit = read_u64(&dir.join("memory.limit_in_bytes")).filter(|l| *l < CGROUP_V1_UNLIMITED);
        if current.is_none() && limit.is_none() {
            return None;
        }
        Some(MemoryUsage::new(current, limit))
    }
}

impl MemorySource for CgroupMemorySource {
    fn read(&self) -> MemoryUsage {
        self.read_v2()
            .or_else(|| self.read_v1())
            .unwrap_or_default()
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Source reporting whatever it was last told
#[derive(Debug, Default)]
pub struct FixedMemorySource {
    usage: Mutex<MemoryUsage>,
}

impl FixedMemorySource {
    pub fn new(usage: MemoryUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    pub fn set(&self, usage: MemoryUsage) {
        *self.usage.lock() = usage;
    }
}

impl MemorySource for FixedMemorySource {
    fn read(&self) -> MemoryUsage {
        *self.usage.lock()
    }
}

/// One evaluation of the monitor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureReading {
    pub usage: MemoryUsage,
    pub utilization: Option<f64>,
    pub under_pressure: bool,
}

struct PressureState {
    under_pressure: bool,
    last_warning: Option<Instant>,
}

pub struct ResourceMonitor {
    source: Box<dyn MemorySource>,
    threshold: f64,
    cooldown: Duration,
    clock: SharedClock,
    state: Mutex<PressureState>,
}

impl ResourceMonitor {
    pub fn new(
        source: Box<dyn MemorySource>,
        threshold: f64,
        cooldown: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            threshold,
            cooldown,
            clock,
            state: Mutex::new(PressureState {
                under_pressure: false,
                last_warning: None,
            }),
        }
    }

    /// Monitor reading the cgroup files under `config.cgroup_root`
    pub fn from_config(config: &MemoryConfig, clock: SharedClock) -> Self {
        Self::new(
            Box::new(CgroupMemorySource::new(&config.cgroup_root)),
            config.pressure_threshold,
            Duration::from_secs(config.pressure_cooldown_secs),
            clock,
        )
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn usage(&self) -> MemoryUsage {
        self.source.read()
    }

    pub fn utilization(&self) -> Option<f64> {
        self.usage().utilization()
    }

    pub fn available_bytes(&self) -> Option<u64> {
        self.usage().available_bytes()
    }

    /// Read the source and update the pressure flag
    pub fn check_pressure(&self) -> PressureReading {
        let usage = self.source.read();
        let utilization = usage.utilization();
        let now = self.clock.now();

        let mut state = self.state.lock();
        let under_pressure = match utilization {
            None => false,
            Some(u) if state.under_pressure => u >= self.threshold - PRESSURE_CLEAR_MARGIN,
            Some(u) => u >= self.threshold,
        };

        if under_pressure {
            let due = state
                .last_warning
                .is_none_or(|t| now.saturating_duration_since(t) >= self.cooldown);
            if !state.under_pressure || due {
                tracing::warn!(
                    utilization = utilization.unwrap_or_default(),
                    threshold = self.threshold,
                    current_bytes = usage.current_bytes,
                    limit_bytes = usage.limit_bytes,
                    "memory_pressure"
                );
                state.last_warning = Some(now);
            }
        } else if state.under_pressure {
            tracing::info!(
                utilization = utilization.unwrap_or_default(),
                "memory_pressure_cleared"
            );
        }
        state.under_pressure = under_pressure;

        PressureReading {
            usage,
            utilization,
            under_pressure,
        }
    }

    pub fn is_under_pressure(&self) -> bool {
        self.check_pressure().under_pressure
    }
}
