use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::StateStore;
use crate::error::StorageResult;
use crate::types::ChatStateRecord;

/// In-process store for tests and QA runs; counts saves so write-through
/// persistence can be asserted.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<ChatStateRecord>>,
    save_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ChatStateRecord) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            save_count: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> StorageResult<Option<ChatStateRecord>> {
        let guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(guard.clone())
    }

    fn save(&self, state: &ChatStateRecord) -> StorageResult<()> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(state.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatStateRecord;

    #[test]
    fn starts_empty_and_counts_saves() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.save_count(), 0);

        let state = ChatStateRecord {
            sessions: Vec::new(),
            current_index: 0,
        };
        store.save(&state).unwrap();
        store.save(&state).unwrap();

        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn with_state_seeds_the_initial_snapshot() {
        let state = ChatStateRecord {
            sessions: Vec::new(),
            current_index: 3,
        };
        let store = MemoryStore::with_state(state.clone());
        assert_eq!(store.load().unwrap(), Some(state));
        assert_eq!(store.save_count(), 0);
    }
}
