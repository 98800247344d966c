//! Outbox storage.
//!
//! Durability comes from the backing store: the relay only reads what a
//! committed unit of work wrote.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use fluxora_core::{EntryId, ResilienceError, ResilienceResult};

use super::types::{OutboxEntry, OutboxStatus};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert an entry in its own unit of work (autocommit).
    ///
    /// Use a store-specific transactional API (`InMemoryOutboxStore::begin`,
    /// `PostgresOutboxStore::enqueue_in_tx`) to commit with a business change.
    async fn enqueue(&self, entry: OutboxEntry) -> ResilienceResult<EntryId>;

    /// Up to `limit` pending entries in creation order.
    async fn fetch_pending(&self, limit: usize) -> ResilienceResult<Vec<OutboxEntry>>;

    async fn get(&self, id: EntryId) -> ResilienceResult<Option<OutboxEntry>>;

    /// Record confirmed delivery after `attempts` publish attempts in total.
    async fn mark_dispatched(&self, id: EntryId, attempts: u32, at: DateTime<Utc>) -> ResilienceResult<()>;

    /// Persist the attempt count and last error of an entry that stays pending.
    async fn record_attempts(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()>;

    async fn mark_failed(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()>;

    /// Delete dispatched entries older than `before`. Returns how many were removed.
    async fn purge_dispatched(&self, before: DateTime<Utc>) -> ResilienceResult<usize>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn enqueue(&self, entry: OutboxEntry) -> ResilienceResult<EntryId> {
        (**self).enqueue(entry).await
    }

    async fn fetch_pending(&self, limit: usize) -> ResilienceResult<Vec<OutboxEntry>> {
        (**self).fetch_pending(limit).await
    }

    async fn get(&self, id: EntryId) -> ResilienceResult<Option<OutboxEntry>> {
        (**self).get(id).await
    }

    async fn mark_dispatched(&self, id: EntryId, attempts: u32, at: DateTime<Utc>) -> ResilienceResult<()> {
        (**self).mark_dispatched(id, attempts, at).await
    }

    async fn record_attempts(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()> {
        (**self).record_attempts(id, attempts, error).await
    }

    async fn mark_failed(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()> {
        (**self).mark_failed(id, attempts, error).await
    }

    async fn purge_dispatched(&self, before: DateTime<Utc>) -> ResilienceResult<usize> {
        (**self).purge_dispatched(before).await
    }
}

#[derive(Debug, Default)]
struct OutboxTable {
    /// sequence -> entry
    rows: BTreeMap<u64, OutboxEntry>,
    by_id: HashMap<EntryId, u64>,
    next_sequence: u64,
}

impl OutboxTable {
    fn insert(&mut self, mut entry: OutboxEntry) -> ResilienceResult<EntryId> {
        if self.by_id.contains_key(&entry.id) {
            return Err(ResilienceError::invalid_state(format!(
                "outbox entry {} already exists",
                entry.id
            )));
        }
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        entry.status = OutboxStatus::Pending;
        let id = entry.id;
        self.by_id.insert(id, entry.sequence);
        self.rows.insert(entry.sequence, entry);
        Ok(id)
    }

    fn row_mut(&mut self, id: EntryId) -> ResilienceResult<&mut OutboxEntry> {
        self.by_id
            .get(&id)
            .and_then(|seq| self.rows.get_mut(seq))
            .ok_or_else(|| ResilienceError::not_found(format!("outbox entry {id}")))
    }
}

/// In-memory outbox for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    table: Mutex<OutboxTable>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a unit of work. Entries become visible to the relay on `commit`;
    /// dropping the transaction discards them.
    pub fn begin(&self) -> OutboxTransaction<'_> {
        OutboxTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Every row regardless of status, in sequence order.
    pub fn all(&self) -> Vec<OutboxEntry> {
        self.lock()
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> ResilienceResult<std::sync::MutexGuard<'_, OutboxTable>> {
        self.table
            .lock()
            .map_err(|_| ResilienceError::storage("outbox lock poisoned"))
    }
}

/// Staged outbox writes that commit or roll back together.
#[derive(Debug)]
#[must_use = "an outbox transaction rolls back unless committed"]
pub struct OutboxTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxEntry>,
}

impl OutboxTransaction<'_> {
    pub fn enqueue(&mut self, entry: OutboxEntry) -> EntryId {
        let id = entry.id;
        self.staged.push(entry);
        id
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Make every staged entry visible at once.
    pub fn commit(self) -> ResilienceResult<Vec<EntryId>> {
        let store = self.store;
        let mut table = store.lock()?;
        // Validate everything first so a rejected commit inserts nothing.
        let mut seen = HashSet::with_capacity(self.staged.len());
        if let Some(dup) = self
            .staged
            .iter()
            .find(|e| !seen.insert(e.id) || table.by_id.contains_key(&e.id))
        {
            return Err(ResilienceError::invalid_state(format!(
                "outbox entry {} already exists",
                dup.id
            )));
        }
        let mut ids = Vec::with_capacity(self.staged.len());
        for entry in self.staged {
            ids.push(table.insert(entry)?);
        }
        debug!(entries = ids.len(), "outbox transaction committed");
        Ok(ids)
    }

    pub fn rollback(self) {
        debug!(entries = self.staged.len(), "outbox transaction rolled back");
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, entry: OutboxEntry) -> ResilienceResult<EntryId> {
        self.lock()?.insert(entry)
    }

    async fn fetch_pending(&self, limit: usize) -> ResilienceResult<Vec<OutboxEntry>> {
        let table = self.lock()?;
        Ok(table
            .rows
            .values()
            .filter(|e| e.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: EntryId) -> ResilienceResult<Option<OutboxEntry>> {
        let table = self.lock()?;
        Ok(table
            .by_id
            .get(&id)
            .and_then(|seq| table.rows.get(seq))
            .cloned())
    }

    async fn mark_dispatched(&self, id: EntryId, attempts: u32, at: DateTime<Utc>) -> ResilienceResult<()> {
        let mut table = self.lock()?;
        let row = table.row_mut(id)?;
        row.status = OutboxStatus::Dispatched;
        row.attempts = attempts;
        row.dispatched_at = Some(at);
        Ok(())
    }

    async fn record_attempts(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()> {
        let mut table = self.lock()?;
        let row = table.row_mut(id)?;
        row.attempts = attempts;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn mark_failed(&self, id: EntryId, attempts: u32, error: &str) -> ResilienceResult<()> {
        let mut table = self.lock()?;
        let row = table.row_mut(id)?;
        row.status = OutboxStatus::Failed;
        row.attempts = attempts;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn purge_dispatched(&self, before: DateTime<Utc>) -> ResilienceResult<usize> {
        let mut table = self.lock()?;
        let expired: Vec<(u64, EntryId)> = table
            .rows
            .values()
            .filter(|e| {
                e.status == OutboxStatus::Dispatched && e.dispatched_at.is_some_and(|at| at < before)
            })
            .map(|e| (e.sequence, e.id))
            .collect();
        for (seq, id) in &expired {
            table.rows.remove(seq);
            table.by_id.remove(id);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn rolled_back_entries_are_never_visible() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin();
            tx.enqueue(OutboxEntry::new("forecast.published", json!({"site": 1}), Utc::now()));
            // Business change fails: transaction dropped without commit.
        }
        let mut tx = store.begin();
        tx.enqueue(OutboxEntry::new("forecast.published", json!({"site": 2}), Utc::now()));
        tx.rollback();

        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_entries_come_back_in_creation_order() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        let a = tx.enqueue(OutboxEntry::new("t", json!(1), Utc::now()));
        let b = tx.enqueue(OutboxEntry::new("t", json!(2), Utc::now()));
        tx.commit().unwrap();
        let c = store.enqueue(OutboxEntry::new("t", json!(3), Utc::now())).await.unwrap();

        store.mark_dispatched(a, 1, Utc::now()).await.unwrap();
        let pending: Vec<_> = store
            .fetch_pending(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(pending, vec![b, c]);
        assert_eq!(store.fetch_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_only_removes_old_dispatched_entries() {
        let store = InMemoryOutboxStore::new();
        let old = store.enqueue(OutboxEntry::new("t", json!(1), Utc::now())).await.unwrap();
        let fresh = store.enqueue(OutboxEntry::new("t", json!(2), Utc::now())).await.unwrap();
        let pending = store.enqueue(OutboxEntry::new("t", json!(3), Utc::now())).await.unwrap();

        let now = Utc::now();
        store
            .mark_dispatched(old, 1, now - chrono::Duration::days(8))
            .await
            .unwrap();
        store.mark_dispatched(fresh, 1, now).await.unwrap();

        let purged = store
            .purge_dispatched(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(old).await.unwrap().is_none());
        assert!(store.get(fresh).await.unwrap().is_some());
        assert!(store.get(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_atomically() {
        let store = InMemoryOutboxStore::new();
        let entry = OutboxEntry::new("t", json!(1), Utc::now());
        store.enqueue(entry.clone()).await.unwrap();

        let mut tx = store.begin();
        tx.enqueue(OutboxEntry::new("t", json!(2), Utc::now()));
        tx.enqueue(entry);
        assert!(tx.commit().is_err());
        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn id_staged_twice_in_one_transaction_commits_nothing() {
        let store = InMemoryOutboxStore::new();
        let repeated = OutboxEntry::new("t", json!(2), Utc::now());

        let mut tx = store.begin();
        tx.enqueue(OutboxEntry::new("t", json!(1), Utc::now()));
        tx.enqueue(repeated.clone());
        tx.enqueue(repeated);
        let err = tx.commit().unwrap_err();

        assert!(matches!(err, ResilienceError::InvalidState(_)));
        assert!(store.all().is_empty());
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }
}
