//! Dead-letter storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use fluxora_core::{EntryId, ResilienceError, ResilienceResult};

use super::types::{DeadLetterEntry, DeadLetterFilter};

/// Durable storage for dead-lettered work items.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store an entry. Returns `false` if an entry with the same id exists;
    /// the existing entry is left untouched.
    async fn insert(&self, entry: DeadLetterEntry) -> ResilienceResult<bool>;

    async fn get(&self, id: EntryId) -> ResilienceResult<Option<DeadLetterEntry>>;

    /// Filtered listing, newest first.
    async fn list(&self, filter: &DeadLetterFilter) -> ResilienceResult<Vec<DeadLetterEntry>>;

    /// Overwrite an existing entry.
    async fn update(&self, entry: &DeadLetterEntry) -> ResilienceResult<()>;

    /// Delete an entry. Returns `false` if it did not exist.
    async fn remove(&self, id: EntryId) -> ResilienceResult<bool>;
}

#[async_trait]
impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    async fn insert(&self, entry: DeadLetterEntry) -> ResilienceResult<bool> {
        (**self).insert(entry).await
    }

    async fn get(&self, id: EntryId) -> ResilienceResult<Option<DeadLetterEntry>> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &DeadLetterFilter) -> ResilienceResult<Vec<DeadLetterEntry>> {
        (**self).list(filter).await
    }

    async fn update(&self, entry: &DeadLetterEntry) -> ResilienceResult<()> {
        (**self).update(entry).await
    }

    async fn remove(&self, id: EntryId) -> ResilienceResult<bool> {
        (**self).remove(id).await
    }
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<HashMap<EntryId, DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> ResilienceError {
    ResilienceError::storage("dead-letter store lock poisoned")
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, entry: DeadLetterEntry) -> ResilienceResult<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if entries.contains_key(&entry.id) {
            return Ok(false);
        }
        entries.insert(entry.id, entry);
        Ok(true)
    }

    async fn get(&self, id: EntryId) -> ResilienceResult<Option<DeadLetterEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(&id).cloned())
    }

    async fn list(&self, filter: &DeadLetterFilter) -> ResilienceResult<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(filter.apply(entries.values()))
    }

    async fn update(&self, entry: &DeadLetterEntry) -> ResilienceResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        match entries.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(ResilienceError::not_found(format!("dead-letter entry {}", entry.id))),
        }
    }

    async fn remove(&self, id: EntryId) -> ResilienceResult<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::types::DeadLetterOrigin;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn insert_is_idempotent_on_id() {
        let store = InMemoryDeadLetterStore::new();
        let entry = DeadLetterEntry::new(EntryId::new(), "q", DeadLetterOrigin::Job, json!(1), Utc::now())
            .with_failure("first", 3);
        assert!(store.insert(entry.clone()).await.unwrap());

        let dup = entry.clone().with_failure("second", 5);
        assert!(!store.insert(dup).await.unwrap());

        let stored = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.error, "first");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_of_missing_entry_is_not_found() {
        let store = InMemoryDeadLetterStore::new();
        let entry = DeadLetterEntry::new(EntryId::new(), "q", DeadLetterOrigin::Job, json!(1), Utc::now());
        let err = store.update(&entry).await.unwrap_err();
        assert!(matches!(err, ResilienceError::NotFound(_)));
        assert!(!store.remove(entry.id).await.unwrap());
    }
}
