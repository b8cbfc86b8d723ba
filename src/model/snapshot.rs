//! Last known converged state of a mirrored collection, and its on-disk store

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::types::{PendingOperation, TrackRef};
use crate::error::{Result, SyncError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    /// Listing endpoint of the mirrored source
    #[serde(default)]
    pub source: String,
    /// Playlist the tracks were observed in
    #[serde(default)]
    pub target: String,
    pub taken_at: DateTime<Utc>,
    pub tracks: Vec<TrackRef>,
    /// Operations that failed or were never attempted in the cycle that
    /// produced this snapshot; the next cycle tries them again.
    #[serde(default)]
    pub unapplied: Vec<PendingOperation>,
}

impl Snapshot {
    /// The state before any successful cycle mirroring `source` into `target`.
    pub fn initial(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            version: 0,
            source: source.into(),
            target: target.into(),
            taken_at: DateTime::<Utc>::UNIX_EPOCH,
            tracks: Vec::new(),
            unapplied: Vec::new(),
        }
    }

    /// A new snapshot replacing this one.
    pub fn supersede(
        &self,
        tracks: Vec<TrackRef>,
        unapplied: Vec<PendingOperation>,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: self.version + 1,
            source: self.source.clone(),
            target: self.target.clone(),
            taken_at,
            tracks,
            unapplied,
        }
    }

    /// Whether this snapshot was taken for the same source and target. Files
    /// written before both were recorded describe nothing.
    pub fn describes(&self, source: &str, target: &str) -> bool {
        self.source == source && self.target == target
    }
}

/// Stores one snapshot as a JSON file, replaced atomically on every save.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub async fn load(&self) -> Result<Option<Snapshot>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::storage(format!("reading {}: {}", self.path.display(), e)));
            }
        };
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| SyncError::storage(format!("corrupt snapshot {}: {}", self.path.display(), e)))?;
        Ok(Some(snapshot))
    }

    /// Write to a sibling temp file, flush it to disk, then rename over the
    /// old snapshot.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let write = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_vec_pretty(snapshot)?;
            let temp = self.temp_path();
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &self.path).await?;
            Ok::<_, std::io::Error>(())
        };
        write
            .await
            .map_err(|e| SyncError::storage(format!("writing {}: {}", self.path.display(), e)))?;
        tracing::debug!(path = %self.path.display(), version = snapshot.version, tracks = snapshot.tracks.len(), "Snapshot saved");
        Ok(())
    }

    /// Forget the snapshot; the next cycle starts from scratch.
    pub async fn delete(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::storage(format!("deleting {}: {}", self.path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot::initial("/v1/me/tracks", "p").supersede(
            vec![TrackRef::new("a", "A"), TrackRef::new("b", "B")],
            vec![PendingOperation::add("p", TrackRef::new("c", "C"))],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("job.json"));
        assert_eq!(store.load().await.unwrap(), None);
        assert!(!store.delete().await.unwrap());
    }

    #[tokio::test]
    async fn saves_atomically_and_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots").join("job.json"));
        let snapshot = snapshot();

        store.save(&snapshot).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(snapshot));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = SnapshotStore::new(path).load().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn superseding_bumps_the_version() {
        let first = snapshot();
        let second = first.supersede(Vec::new(), Vec::new(), Utc::now());
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(first.tracks.len(), 2);
        assert!(second.describes("/v1/me/tracks", "p"));
        assert!(!second.describes("/v1/me/tracks", "other"));
    }

    #[test]
    fn snapshots_without_scope_describe_nothing() {
        let legacy: Snapshot = serde_json::from_str(
            r#"{ "version": 3, "taken_at": "2024-01-01T00:00:00Z", "tracks": [] }"#,
        )
        .unwrap();
        assert!(!legacy.describes("/v1/me/tracks", "p"));
    }
}
