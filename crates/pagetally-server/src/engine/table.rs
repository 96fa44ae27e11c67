use std::collections::HashMap;

use tokio::sync::Mutex;

use pagetally_core::model::Absorb;

/// In-memory accumulation of deltas waiting to be flushed.
///
/// Lock, merge or drain, release. The lock is never held across a store
/// round trip.
pub struct AggregationTable<T: Absorb> {
    entries: Mutex<HashMap<T::Key, T>>,
}

impl<T: Absorb> Default for AggregationTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Absorb> AggregationTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb `delta` into the entry with the same identity, or insert it.
    /// Returns the table size after the merge.
    pub async fn merge(&self, delta: T) -> usize {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&delta.key()) {
            Some(existing) => existing.absorb(&delta),
            None => {
                entries.insert(delta.key(), delta);
            }
        }
        entries.len()
    }

    /// Remove and return up to `max` entries.
    pub async fn drain(&self, max: usize) -> Vec<T> {
        let mut entries = self.entries.lock().await;
        let keys: Vec<T::Key> = entries.keys().take(max).cloned().collect();
        keys.iter().filter_map(|k| entries.remove(k)).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
