// src/store.rs
//! Snapshot history: append-only, read-latest.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub watch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub content_hash: String,
    #[serde(default)]
    pub extracted_data: BTreeMap<String, Value>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest(&self, watch_id: Uuid) -> Result<Option<Snapshot>>;

    /// Snapshots are write-once; appending never touches older entries.
    async fn append(&self, snapshot: &Snapshot) -> Result<()>;

    async fn save_screenshot(&self, _watch_id: Uuid, _jpeg: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<Uuid, Vec<Snapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, watch_id: Uuid) -> Vec<Snapshot> {
        self.inner.read().get(&watch_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest(&self, watch_id: Uuid) -> Result<Option<Snapshot>> {
        Ok(self
            .inner
            .read()
            .get(&watch_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn append(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner
            .write()
            .entry(snapshot.watch_id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }
}

/// One directory per watch, one JSON file per snapshot named by its
/// timestamp in microseconds (lexical order == time order).
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn watch_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn file_name(ts: DateTime<Utc>) -> String {
        format!("{:020}.json", ts.timestamp_micros().max(0))
    }

    async fn newest_file(dir: &Path) -> Result<Option<PathBuf>> {
        let mut rd = match fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };
        let mut best: Option<String> = None;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && best.as_ref().map_or(true, |b| name > *b) {
                best = Some(name);
            }
        }
        Ok(best.map(|n| dir.join(n)))
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn latest(&self, watch_id: Uuid) -> Result<Option<Snapshot>> {
        let Some(path) = Self::newest_file(&self.watch_dir(watch_id)).await? else {
            return Ok(None);
        };
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snap = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(snap))
    }

    async fn append(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.watch_dir(snapshot.watch_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let mut ts = snapshot.timestamp;
        // Never overwrite: bump by a microsecond on collision.
        let path = loop {
            let p = dir.join(Self::file_name(ts));
            if !fs::try_exists(&p).await.unwrap_or(false) {
                break p;
            }
            ts += chrono::Duration::microseconds(1);
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    async fn save_screenshot(&self, watch_id: Uuid, jpeg: &[u8]) -> Result<()> {
        let dir = self.watch_dir(watch_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join("last-screenshot.jpg");
        let tmp = dir.join("last-screenshot.jpg.tmp");
        fs::write(&tmp, jpeg).await?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: Uuid, content: &str, ts: DateTime<Utc>) -> Snapshot {
        Snapshot {
            watch_id: id,
            timestamp: ts,
            content: content.into(),
            content_hash: crate::process::content_hash(content),
            extracted_data: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn file_store_returns_newest_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let id = Uuid::new_v4();
        assert!(store.latest(id).await.unwrap().is_none());

        let t0 = Utc::now();
        store.append(&snap(id, "one", t0)).await.unwrap();
        store.append(&snap(id, "two", t0)).await.unwrap();
        let latest = store.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.content, "two");
        let files = std::fs::read_dir(dir.path().join(id.to_string())).unwrap().count();
        assert_eq!(files, 2);
    }

    #[tokio::test]
    async fn memory_store_latest() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.append(&snap(id, "a", Utc::now())).await.unwrap();
        store.append(&snap(id, "b", Utc::now())).await.unwrap();
        assert_eq!(store.latest(id).await.unwrap().unwrap().content, "b");
        assert_eq!(store.history(id).len(), 2);
    }
}
