//! In-process backing store.

use super::BackingStore;
use crate::error::StoreResult;
use crate::session::model::SessionRecord;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Records held in a process-local map. Reads hand out clones.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl BackingStore for MemoryStore {
    fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.records.read().get(session_id).cloned())
    }

    fn set(&self, session_id: &str, record: &SessionRecord) -> StoreResult<()> {
        self.records
            .write()
            .insert(session_id.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, session_id: &str) -> StoreResult<bool> {
        Ok(self.records.write().remove(session_id).is_some())
    }

    fn session_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_set_get_delete() {
        let store = MemoryStore::new();
        let record = SessionRecord::new(40.0);
        store.set("s1", &record).unwrap();
        assert_eq!(store.get("s1").unwrap(), Some(record));
        assert!(store.delete("s1").unwrap());
        assert!(!store.delete("s1").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_returned_record_is_a_copy() {
        let store = MemoryStore::new();
        store.set("s1", &SessionRecord::new(40.0)).unwrap();
        let mut copy = store.get("s1").unwrap().unwrap();
        copy.payment.balance = 0.0;
        assert_eq!(store.get("s1").unwrap().unwrap().payment.balance, 40.0);
    }

    #[test]
    fn test_session_ids_sorted() {
        let store = MemoryStore::new();
        for id in ["c", "a", "b"] {
            store.set(id, &SessionRecord::new(1.0)).unwrap();
        }
        assert_eq!(store.session_ids().unwrap(), vec!["a", "b", "c"]);
    }
}
