//! Pluggable snapshot persistence for [`CacheStore`](super::CacheStore).

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// One entry as written to a snapshot. Monotonic instants do not survive a
/// restart, so the entry's age at save time is recorded instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry<V> {
    pub key: String,
    pub value: V,
    pub age_ms: u64,
    pub ttl_ms: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// All live entries of a store at `saved_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot<V> {
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry<V>>,
}

/// Where snapshots go. Implementations must be cheap to call from a timer
/// and must never panic; failures are reported and the store carries on.
pub trait CachePersistence<V>: Send + Sync {
    /// Writes `snapshot`, replacing the previous one.
    fn save(&self, snapshot: &CacheSnapshot<V>) -> Result<(), CacheError>;

    /// Reads the latest snapshot, `Ok(None)` if there is none yet.
    fn load(&self) -> Result<Option<CacheSnapshot<V>>, CacheError>;
}

/// Stores the snapshot as a single JSON document.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a crash mid-write never leaves a truncated snapshot behind.
pub struct JsonFilePersistence<V> {
    path: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonFilePersistence<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V> CachePersistence<V> for JsonFilePersistence<V>
where
    V: Serialize + DeserializeOwned,
{
    fn save(&self, snapshot: &CacheSnapshot<V>) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<CacheSnapshot<V>>, CacheError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}
