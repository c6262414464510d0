//! Versioned master dataset with an atomically swapped `CURRENT.json` pointer.
//!
//! Layout under the master root:
//!
//! ```text
//! master/
//! ├── CURRENT.json                      # pointer to the live version
//! ├── .commit.lock                      # present only while a commit runs
//! ├── v000001/AlphaPoliceEvent_master.{csv,parquet}
//! └── v000002/AlphaPoliceEvent_master.{csv,parquet}
//! ```
//!
//! Readers resolve `CURRENT.json` first, so they always see one complete version.

use std::path::{Path, PathBuf};

use anyhow::Context;
use apev_core::{MasterDataset, DATASET_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::codec::{decode_parquet_file, encode_csv, encode_parquet};
use crate::{install_dir, replace_file_atomically, sha256_hex, ArtifactFile};

const POINTER_FILE: &str = "CURRENT.json";
const LOCK_FILE: &str = ".commit.lock";

pub fn master_file_name(extension: &str) -> String {
    format!("{DATASET_NAME}_master.{extension}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("master write conflict: {reason}")]
pub struct WriteConflictError {
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum MasterWriteError {
    #[error(transparent)]
    Conflict(#[from] WriteConflictError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerEntry {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterPointer {
    pub version: u64,
    pub record_count: usize,
    pub committed_at: DateTime<Utc>,
    pub csv: PointerEntry,
    pub parquet: PointerEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteHandle {
    pub version: u64,
    pub record_count: usize,
    pub committed_at: DateTime<Utc>,
    pub csv: ArtifactFile,
    pub parquet: ArtifactFile,
}

impl WriteHandle {
    fn from_pointer(root: &Path, pointer: &MasterPointer) -> Self {
        let artifact = |entry: &PointerEntry| ArtifactFile {
            relative_path: PathBuf::from(&entry.path),
            absolute_path: root.join(&entry.path),
            sha256: entry.sha256.clone(),
            byte_size: entry.bytes as usize,
        };
        Self {
            version: pointer.version,
            record_count: pointer.record_count,
            committed_at: pointer.committed_at,
            csv: artifact(&pointer.csv),
            parquet: artifact(&pointer.parquet),
        }
    }
}

/// Exclusive commit lock; removed when dropped.
struct CommitLock {
    path: PathBuf,
}

impl CommitLock {
    async fn acquire(path: PathBuf) -> Result<Self, MasterWriteError> {
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                let owner = format!("pid={} at={}\n", std::process::id(), Utc::now().to_rfc3339());
                file.write_all(owner.as_bytes())
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(WriteConflictError {
                    reason: format!(
                        "another commit holds {} (remove it only if no run is active)",
                        path.display()
                    ),
                }
                .into())
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("creating {}", path.display()))
                .into()),
        }
    }
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct MasterStore {
    root: PathBuf,
}

impl MasterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn read_pointer(&self) -> anyhow::Result<Option<MasterPointer>> {
        let path = self.root.join(POINTER_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let pointer = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(pointer))
    }

    /// Handle of the live version, if any has been committed.
    pub async fn current(&self) -> anyhow::Result<Option<WriteHandle>> {
        Ok(self
            .read_pointer()
            .await?
            .map(|pointer| WriteHandle::from_pointer(&self.root, &pointer)))
    }

    /// Load the live master. Returns an empty dataset at version 0 before the first commit.
    pub async fn load(&self) -> anyhow::Result<MasterDataset> {
        let Some(pointer) = self.read_pointer().await? else {
            return Ok(MasterDataset::empty());
        };

        let parquet_path = self.root.join(&pointer.parquet.path);
        let bytes = fs::read(&parquet_path)
            .await
            .with_context(|| format!("reading {}", parquet_path.display()))?;
        let digest = sha256_hex(&bytes);
        if digest != pointer.parquet.sha256 {
            anyhow::bail!(
                "master artifact {} checksum mismatch: pointer says {}, file has {}",
                parquet_path.display(),
                pointer.parquet.sha256,
                digest
            );
        }

        let records = decode_parquet_file(&parquet_path)?;
        let master = MasterDataset::from_records(pointer.version, records)?;
        Ok(master)
    }

    /// Persist `master` as the next version.
    ///
    /// Fails with [`WriteConflictError`] when another commit is running or when
    /// the live version is no longer `master.base_version`.
    pub async fn commit(&self, master: &MasterDataset) -> Result<WriteHandle, MasterWriteError> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        let _lock = CommitLock::acquire(self.root.join(LOCK_FILE)).await?;

        let live_version = self.read_pointer().await?.map(|p| p.version).unwrap_or(0);
        if live_version != master.base_version {
            return Err(WriteConflictError {
                reason: format!(
                    "expected live version {}, found {}",
                    master.base_version, live_version
                ),
            }
            .into());
        }

        let version = live_version + 1;
        let records = master.to_ordered_vec();
        let csv_bytes = encode_csv(&records)?;
        let parquet_bytes = encode_parquet(&records)?;

        let version_dir = format!("v{version:06}");
        let final_dir = self.root.join(&version_dir);
        // The pointer never references a version above the live one, so a
        // directory here is the remnant of a commit that failed before its swap.
        if fs::try_exists(&final_dir)
            .await
            .with_context(|| format!("checking {}", final_dir.display()))?
        {
            warn!(dir = %final_dir.display(), "removing unreferenced master version");
            fs::remove_dir_all(&final_dir)
                .await
                .with_context(|| format!("removing {}", final_dir.display()))?;
        }

        let files = [
            (master_file_name("csv"), csv_bytes.as_slice()),
            (master_file_name("parquet"), parquet_bytes.as_slice()),
        ];
        install_dir(&self.root, &final_dir, &files).await?;

        let pointer = MasterPointer {
            version,
            record_count: records.len(),
            committed_at: Utc::now(),
            csv: PointerEntry {
                path: format!("{version_dir}/{}", master_file_name("csv")),
                sha256: sha256_hex(&csv_bytes),
                bytes: csv_bytes.len() as u64,
            },
            parquet: PointerEntry {
                path: format!("{version_dir}/{}", master_file_name("parquet")),
                sha256: sha256_hex(&parquet_bytes),
                bytes: parquet_bytes.len() as u64,
            },
        };
        let pointer_bytes =
            serde_json::to_vec_pretty(&pointer).context("serializing master pointer")?;
        if let Err(err) = replace_file_atomically(&self.root.join(POINTER_FILE), &pointer_bytes).await {
            let _ = fs::remove_dir_all(&final_dir).await;
            return Err(err.into());
        }

        info!(
            version,
            records = pointer.record_count,
            "committed master dataset"
        );
        Ok(WriteHandle::from_pointer(&self.root, &pointer))
    }

    /// Remove version directories older than the newest `retain` versions.
    /// The live version is always kept. Returns the removed version numbers.
    pub async fn prune(&self, retain: usize) -> Result<Vec<u64>, MasterWriteError> {
        if self.read_pointer().await?.is_none() {
            return Ok(Vec::new());
        }
        let _lock = CommitLock::acquire(self.root.join(LOCK_FILE)).await?;
        let live_version = self.read_pointer().await?.map(|p| p.version).unwrap_or(0);
        let keep_from = live_version.saturating_sub(retain.max(1) as u64 - 1);

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(version) = name
                .strip_prefix('v')
                .filter(|digits| digits.len() == 6)
                .and_then(|digits| digits.parse::<u64>().ok())
            else {
                continue;
            };
            if version < keep_from {
                fs::remove_dir_all(entry.path())
                    .await
                    .with_context(|| format!("removing {}", entry.path().display()))?;
                removed.push(version);
            }
        }
        removed.sort_unstable();
        if !removed.is_empty() {
            info!(?removed, live_version, "pruned old master versions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apev_core::Record;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(id: &str, status: &str) -> Record {
        Record {
            id: id.to_string(),
            last_updated: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap(),
            category: None,
            location: None,
            occurred_at: None,
            status: Some(status.to_string()),
            geometry: None,
            fetched_at: Utc.with_ymd_and_hms(2026, 2, 2, 6, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn first_load_is_empty_version_zero() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());
        let master = store.load().await.expect("load");
        assert_eq!(master.base_version, 0);
        assert!(master.is_empty());
        assert!(store.current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_advances_version_and_load_sees_new_content() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());

        let first = MasterDataset::from_records(0, vec![record("1", "open")]).unwrap();
        let handle = store.commit(&first).await.expect("commit v1");
        assert_eq!(handle.version, 1);
        assert_eq!(
            handle.parquet.relative_path,
            PathBuf::from("v000001/AlphaPoliceEvent_master.parquet")
        );

        let loaded = store.load().await.expect("load v1");
        assert_eq!(loaded.base_version, 1);
        assert_eq!(loaded.records, first.records);

        let mut second = loaded.clone();
        second.records.insert("2".into(), record("2", "closed"));
        store.commit(&second).await.expect("commit v2");

        let loaded = store.load().await.expect("load v2");
        assert_eq!(loaded.base_version, 2);
        assert_eq!(loaded.len(), 2);
        assert!(dir.path().join("v000001").exists());
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn stale_base_version_is_a_write_conflict() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());
        let base = store.load().await.unwrap();

        let mut run_a = base.clone();
        run_a.records.insert("a".into(), record("a", "open"));
        let mut run_b = base;
        run_b.records.insert("b".into(), record("b", "open"));

        store.commit(&run_a).await.expect("first writer wins");
        let err = store.commit(&run_b).await.unwrap_err();
        assert!(matches!(err, MasterWriteError::Conflict(_)));

        let live = store.load().await.unwrap();
        assert!(live.get("a").is_some());
        assert!(live.get("b").is_none());
    }

    #[tokio::test]
    async fn held_lock_is_a_write_conflict() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());
        std::fs::write(dir.path().join(LOCK_FILE), "pid=1").unwrap();

        let err = store.commit(&MasterDataset::empty()).await.unwrap_err();
        assert!(matches!(err, MasterWriteError::Conflict(_)));
        assert!(store.read_pointer().await.unwrap().is_none());
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn unreferenced_version_directory_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());
        std::fs::create_dir(dir.path().join("v000001")).unwrap();
        std::fs::write(dir.path().join("v000001").join("partial.tmp"), b"x").unwrap();

        let handle = store
            .commit(&MasterDataset::from_records(0, vec![record("1", "open")]).unwrap())
            .await
            .expect("commit over leftover");
        assert_eq!(handle.version, 1);
        assert!(!dir.path().join("v000001/partial.tmp").exists());
        assert!(handle.csv.absolute_path.exists());
        assert_eq!(store.load().await.unwrap().len(), 1);

        std::fs::create_dir(dir.path().join("v000002")).unwrap();
        let mut next = store.load().await.unwrap();
        next.records.insert("2".into(), record("2", "open"));
        assert_eq!(store.commit(&next).await.expect("retry succeeds").version, 2);
    }

    #[tokio::test]
    async fn prune_keeps_the_newest_versions() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());
        assert!(store.prune(1).await.unwrap().is_empty());

        for i in 0..4 {
            let mut next = store.load().await.unwrap();
            next.records.insert(format!("{i}"), record(&format!("{i}"), "open"));
            store.commit(&next).await.expect("commit");
        }

        assert_eq!(store.prune(2).await.unwrap(), vec![1, 2]);
        assert!(!dir.path().join("v000002").exists());
        assert!(dir.path().join("v000003").exists());
        assert_eq!(store.load().await.unwrap().len(), 4);

        assert_eq!(store.prune(0).await.unwrap(), vec![3]);
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert_eq!(store.load().await.unwrap().base_version, 4);
    }

    #[tokio::test]
    async fn tampered_master_fails_checksum() {
        let dir = tempdir().expect("tempdir");
        let store = MasterStore::new(dir.path());
        let handle = store
            .commit(&MasterDataset::from_records(0, vec![record("1", "open")]).unwrap())
            .await
            .unwrap();
        std::fs::write(&handle.parquet.absolute_path, b"not parquet").unwrap();
        assert!(store.load().await.is_err());
    }
}
