//! # Tabkeeper
//!
//! Session state and resource control for conversational ordering agents.
//! Each session keeps a conversation phase, an order with its history, and a
//! payment tab; the core keeps those consistent under concurrent request
//! workers and decides which requests and sessions it can afford to serve.
//!
//! ## Architecture
//!
//! ```text
//! inbound turn
//!     ↓
//! [RateLimiter]           burst window → app bucket → session bucket
//!     ↓
//! [AdmissionController]   session cap, memory headroom, pressure
//!     ↓
//! [RequestScope]          cached record, one flush per request
//!     ↓
//! [SessionStore]          per-session lock, deep copies, versioned payments
//!     ↓
//! [BackingStore]          memory | JSON files
//! ```
//!
//! Background sweeps expire idle sessions and drop stale rate-limiter state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tabkeeper::session::{LineItem, SessionState};
//! use tabkeeper::{Config, SessionCore};
//!
//! # fn main() -> anyhow::Result<()> {
//! let core = SessionCore::from_config(Config::load()?)?;
//! core.start_background()?;
//!
//! let mut scope = core.begin_request("guest-42", None)?;
//! scope.advance_turn(false)?;
//! scope.add_item(LineItem::new("Martini", 12.0))?;
//! let placed = scope.place_order()?;
//! scope.advance_turn(placed)?;
//! let outcome = scope.atomic_payment_complete();
//! scope.finish()?;
//! println!("{outcome:?}");
//! core.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod background;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod resource;
pub mod service;
pub mod session;
pub mod store;

pub use admission::{AdmissionController, AdmissionRejected, AdmissionStats, EvictionListener, EvictionReason};
pub use config::{Config, ConfigError};
pub use error::{PaymentValidationError, StateError, StateResult, StoreError, StoreResult};
pub use ratelimit::{LimitKind, RateLimited, RateLimiter, TokenBucket};
pub use resource::{MemoryUsage, ResourceMonitor};
pub use service::{CoreError, CoreStats, RequestRejected, SessionCore};
pub use session::{PaymentOutcome, RequestScope, SessionStore, UpdateOutcome};
pub use store::{BackingStore, FileStore, MemoryStore};
