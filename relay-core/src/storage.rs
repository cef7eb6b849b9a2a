use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::feed::AnnouncementRecord;

/// Durable collection of records keyed by identifier.
///
/// Implementations enforce identifier uniqueness themselves: inserting a
/// known identifier is a no-op. A batch becomes visible to readers all at
/// once or not at all.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn contains(&self, identifier: &str) -> Result<bool, StoreError>;

    /// Commits `records` as one transaction and returns how many were new.
    async fn insert_batch(&self, records: &[AnnouncementRecord]) -> Result<usize, StoreError>;

    /// Most recent records, newest `observed_at` first.
    async fn recent(&self, limit: usize) -> Result<Vec<AnnouncementRecord>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

/// Records are kept in insertion order, which is also the on-disk order and
/// the pruning order. `ranked` is the newest-first view served to readers.
#[derive(Debug, Clone, Default)]
struct StoreData {
    records: Vec<AnnouncementRecord>,
    ranked: Vec<AnnouncementRecord>,
    index: HashSet<String>,
}

impl StoreData {
    fn from_records(mut records: Vec<AnnouncementRecord>, cap: usize) -> Self {
        let mut index = HashSet::with_capacity(records.len());
        records.retain(|r| index.insert(r.identifier.clone()));
        let mut data = Self {
            records,
            ranked: Vec::new(),
            index,
        };
        data.prune(cap);
        data.rerank();
        data
    }

    /// Drops the least recently inserted records beyond `cap`. A record
    /// admitted by the current batch is never the one pruned unless the
    /// batch alone exceeds the cap.
    fn prune(&mut self, cap: usize) -> usize {
        let excess = self.records.len().saturating_sub(cap);
        if excess > 0 {
            for record in self.records.drain(..excess) {
                self.index.remove(&record.identifier);
            }
        }
        excess
    }

    fn rerank(&mut self) {
        let mut ranked = self.records.clone();
        ranked.sort_by(AnnouncementRecord::cmp_newest_first);
        self.ranked = ranked;
    }
}

/// JSON-file backed store (or purely in-memory when created with
/// [`JsonStore::in_memory`]). Writes go to `<path>.tmp` and are renamed over
/// the main file so a crash never leaves a half-written batch behind.
#[derive(Debug, Clone)]
pub struct JsonStore {
    inner: Arc<RwLock<StoreData>>,
    commit: Arc<Mutex<()>>,
    path: Option<PathBuf>,
    max_records: usize,
}

impl JsonStore {
    pub fn in_memory(max_records: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreData::default())),
            commit: Arc::new(Mutex::new(())),
            path: None,
            max_records,
        }
    }

    /// Charge le store depuis le disque; un fichier corrompu retombe sur le
    /// `.tmp`, puis sur un store vide.
    pub async fn load_from(path: impl AsRef<Path>, max_records: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = read_records_with_tmp_fallback(&path).await;
        info!(path = %path.display(), records = records.len(), "loaded announcement store");
        Self {
            inner: Arc::new(RwLock::new(StoreData::from_records(records, max_records))),
            commit: Arc::new(Mutex::new(())),
            path: Some(path),
            max_records,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, records: &[AnnouncementRecord]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            debug!("store is in-memory only; skipping persist");
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(records)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for JsonStore {
    async fn contains(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.index.contains(identifier))
    }

    async fn insert_batch(&self, records: &[AnnouncementRecord]) -> Result<usize, StoreError> {
        let _commit = self.commit.lock().await;

        let mut next = self.inner.read().await.clone();
        let mut inserted = 0;
        for record in records {
            if next.index.insert(record.identifier.clone()) {
                next.records.push(record.clone());
                inserted += 1;
            }
        }
        if inserted == 0 {
            return Ok(0);
        }

        let pruned = next.prune(self.max_records);
        if pruned > 0 {
            debug!(pruned, "pruned records beyond retention cap");
        }
        next.rerank();

        // Nothing becomes visible until the file is durably replaced.
        self.persist(&next.records).await?;
        *self.inner.write().await = next;
        Ok(inserted)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AnnouncementRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.ranked.iter().take(limit).cloned().collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.records.len())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn read_records_with_tmp_fallback(path: &Path) -> Vec<AnnouncementRecord> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to parse store, trying tmp fallback");
                read_tmp(path).await
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let records = read_tmp(path).await;
            if !records.is_empty() {
                warn!(path = %path.display(), records = records.len(), "store file missing, recovered from tmp file");
            }
            records
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to read store, trying tmp fallback");
            read_tmp(path).await
        }
    }
}

async fn read_tmp(path: &Path) -> Vec<AnnouncementRecord> {
    let tmp = tmp_path(path);
    let Ok(bytes) = tokio::fs::read(&tmp).await else {
        return Vec::new();
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(error = %e, path = %tmp.display(), "tmp store unreadable, starting empty");
        Vec::new()
    })
}
