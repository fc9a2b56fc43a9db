//! Per-session state: the record model, the phase machine, per-session
//! locking, the state store, optimistic transactions and request scopes.

pub mod atomic;
pub mod locks;
pub mod model;
pub mod ops;
pub mod phase;
pub mod scope;
pub mod store;

pub use atomic::{
    is_valid_status_transition, validate_payment_state, OrderSnapshot, PaymentOutcome,
    UpdateOutcome,
};
pub use locks::{LockRegistry, SessionGuard};
pub use model::{
    ConversationState, CredentialState, LineItem, OrderHistory, OrderState, PaymentState,
    PaymentStatus, Phase, Section, SessionId, SessionRecord,
};
pub use ops::SessionState;
pub use phase::{PhaseChange, SMALL_TALK_THRESHOLD};
pub use scope::{RequestScope, ScopeSummary};
pub use store::{SessionHandle, SessionStore, StoreStats};
