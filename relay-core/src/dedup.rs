use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::StoreError;
use crate::feed::AnnouncementRecord;
use crate::storage::PersistentStore;

/// Bounded recency index of identifiers. Evicts the least recently
/// inserted entry once full. Only a lookup shortcut: the store decides
/// duplicates.
#[derive(Debug, Clone)]
pub struct SeenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.members.contains(identifier)
    }

    /// Returns false when the identifier was already present.
    pub fn insert(&mut self, identifier: String) -> bool {
        if self.capacity == 0 || self.members.contains(&identifier) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.members.insert(identifier.clone());
        self.order.push_back(identifier);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Answers "is this new?" and commits new records.
///
/// Admissions are serialised with each other; readers of the store see a
/// cycle's batch entirely or not at all.
pub struct DedupEngine {
    store: Arc<dyn PersistentStore>,
    seen: Mutex<SeenSet>,
    admit_lock: tokio::sync::Mutex<()>,
}

impl DedupEngine {
    /// Builds the engine, warming the SeenSet from the store's most recent
    /// records.
    pub async fn load(store: Arc<dyn PersistentStore>, seen_capacity: usize) -> Result<Self, StoreError> {
        let recent = store.recent(seen_capacity).await?;
        let mut seen = SeenSet::with_capacity(seen_capacity);
        // Oldest first so the newest identifiers are the last to be evicted.
        for record in recent.into_iter().rev() {
            seen.insert(record.identifier);
        }
        info!(seen = seen.len(), "dedup engine ready");
        Ok(Self {
            store,
            seen: Mutex::new(seen),
            admit_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn seen(&self) -> MutexGuard<'_, SeenSet> {
        // Critical sections never panic; recover the data if one ever did.
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn is_known(&self, identifier: &str) -> Result<bool, StoreError> {
        if self.seen().contains(identifier) {
            return Ok(true);
        }
        if self.store.contains(identifier).await? {
            self.seen().insert(identifier.to_owned());
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn admit(&self, record: AnnouncementRecord) -> Result<bool, StoreError> {
        Ok(!self.admit_all(vec![record]).await?.is_empty())
    }

    /// Admits the unknown records of `records` as a single store
    /// transaction and returns them in input order. On error nothing is
    /// admitted.
    pub async fn admit_all(
        &self,
        records: Vec<AnnouncementRecord>,
    ) -> Result<Vec<AnnouncementRecord>, StoreError> {
        let _admitting = self.admit_lock.lock().await;

        let mut batch_ids = HashSet::new();
        let mut fresh = Vec::new();
        for record in records {
            if !batch_ids.insert(record.identifier.clone()) {
                continue;
            }
            if !self.is_known(&record.identifier).await? {
                fresh.push(record);
            }
        }
        if fresh.is_empty() {
            return Ok(fresh);
        }

        self.store.insert_batch(&fresh).await?;
        let mut seen = self.seen();
        for record in &fresh {
            seen.insert(record.identifier.clone());
        }
        drop(seen);
        debug!(admitted = fresh.len(), "committed new records");
        Ok(fresh)
    }

    /// Current store contents, newest first.
    pub async fn snapshot(&self, limit: usize) -> Result<Vec<AnnouncementRecord>, StoreError> {
        self.store.recent(limit).await
    }

    pub async fn stored_len(&self) -> Result<usize, StoreError> {
        self.store.len().await
    }

    pub fn seen_len(&self) -> usize {
        self.seen().len()
    }
}

impl std::fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("seen", &self.seen_len())
            .finish_non_exhaustive()
    }
}
