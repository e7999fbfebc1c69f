//! Most recent update per key.

use crate::types::{Key, Update};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Latest update per key. A key is uninitialized until its first update.
pub struct LastValueStore {
    values: RwLock<HashMap<Key, Arc<Update>>>,
}

impl LastValueStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Store `update` unless a newer one is already held for its key.
    pub fn put(&self, update: Arc<Update>) {
        let mut values = self.values.write();
        match values.get(&update.key) {
            Some(existing) if existing.timestamp > update.timestamp => {}
            _ => {
                values.insert(update.key, update);
            }
        }
    }

    pub fn get(&self, key: &Key) -> Option<Arc<Update>> {
        self.values.read().get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LastValueStore {
    fn default() -> Self {
        Self::new()
    }
}
