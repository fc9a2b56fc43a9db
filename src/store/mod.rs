//! Backing Store
//!
//! Pluggable session-id → record persistence. The core only relies on
//! get/set semantics; everything above this layer treats the store as an
//! opaque associative map.
//!
//! ## Implementations
//!
//! | Store | Use |
//! |-------|-----|
//! | [`MemoryStore`] | Single instance, records live in process memory |
//! | [`FileStore`] | One JSON document per session under a data directory |
//!
//! Under a store shared by several processes the guarantee is "last write
//! per flush wins", not linearizability across instances.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreResult;
use crate::session::model::SessionRecord;
use std::sync::Arc;

/// Trait for session persistence backends
pub trait BackingStore: Send + Sync {
    /// Load a record, `None` if the session was never written
    fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Replace the stored record
    fn set(&self, session_id: &str, record: &SessionRecord) -> StoreResult<()>;

    /// Remove a record. Returns true if one existed.
    fn delete(&self, session_id: &str) -> StoreResult<bool>;

    /// Ids of every stored session
    fn session_ids(&self) -> StoreResult<Vec<String>>;
}

/// Open the backend selected by configuration
pub fn open(config: &StoreConfig) -> StoreResult<Arc<dyn BackingStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::File => Ok(Arc::new(FileStore::open(&config.data_dir)?)),
    }
}
