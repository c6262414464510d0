//! Write-once, dated snapshot artifacts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use apev_core::{Record, DATASET_NAME};
use chrono::NaiveDate;
use thiserror::Error;
use tokio::fs;

use crate::codec::{decode_parquet_file, encode_csv, encode_parquet, parquet_row_count};
use crate::{install_dir, ArtifactFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("snapshot for {snapshot_date} already exists")]
pub struct DuplicateSnapshotError {
    pub snapshot_date: NaiveDate,
}

#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateSnapshotError),
    #[error("snapshot for {0} not found")]
    NotFound(NaiveDate),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub snapshot_date: NaiveDate,
    pub record_count: usize,
    pub csv: ArtifactFile,
    pub parquet: ArtifactFile,
}

pub fn snapshot_stamp(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn snapshot_file_name(date: NaiveDate, extension: &str) -> String {
    format!("{DATASET_NAME}_{}.{extension}", snapshot_stamp(date))
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, date: NaiveDate) -> PathBuf {
        self.root.join(snapshot_stamp(date))
    }

    /// Persist a snapshot. Both files are written into a private staging
    /// directory which is renamed into place only once complete.
    pub async fn save(
        &self,
        snapshot_date: NaiveDate,
        records: &[Record],
    ) -> Result<SnapshotHandle, SnapshotStoreError> {
        let final_dir = self.dir_for(snapshot_date);
        if self.exists(snapshot_date).await? {
            return Err(DuplicateSnapshotError { snapshot_date }.into());
        }

        let csv_bytes = encode_csv(records)?;
        let parquet_bytes = encode_parquet(records)?;
        let csv_name = snapshot_file_name(snapshot_date, "csv");
        let parquet_name = snapshot_file_name(snapshot_date, "parquet");

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        let files = [
            (csv_name.clone(), csv_bytes.as_slice()),
            (parquet_name.clone(), parquet_bytes.as_slice()),
        ];
        if let Err(err) = install_dir(&self.root, &final_dir, &files).await {
            // Lost a race with a concurrent save for the same date.
            if fs::try_exists(&final_dir).await.unwrap_or(false) {
                return Err(DuplicateSnapshotError { snapshot_date }.into());
            }
            return Err(err
                .context(format!("committing snapshot {}", final_dir.display()))
                .into());
        }

        let relative_dir = PathBuf::from(snapshot_stamp(snapshot_date));
        Ok(SnapshotHandle {
            snapshot_date,
            record_count: records.len(),
            csv: ArtifactFile::describe(&self.root, relative_dir.join(csv_name), &csv_bytes),
            parquet: ArtifactFile::describe(
                &self.root,
                relative_dir.join(parquet_name),
                &parquet_bytes,
            ),
        })
    }

    pub async fn exists(&self, snapshot_date: NaiveDate) -> anyhow::Result<bool> {
        let dir = self.dir_for(snapshot_date);
        fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))
    }

    pub async fn load(&self, snapshot_date: NaiveDate) -> Result<Vec<Record>, SnapshotStoreError> {
        if !self.exists(snapshot_date).await? {
            return Err(SnapshotStoreError::NotFound(snapshot_date));
        }
        let path = self
            .dir_for(snapshot_date)
            .join(snapshot_file_name(snapshot_date, "parquet"));
        Ok(decode_parquet_file(&path)?)
    }

    /// Rebuild the handle of a committed snapshot, e.g. for re-publishing.
    pub async fn handle(&self, snapshot_date: NaiveDate) -> Result<SnapshotHandle, SnapshotStoreError> {
        if !self.exists(snapshot_date).await? {
            return Err(SnapshotStoreError::NotFound(snapshot_date));
        }
        let relative_dir = PathBuf::from(snapshot_stamp(snapshot_date));
        let csv_rel = relative_dir.join(snapshot_file_name(snapshot_date, "csv"));
        let parquet_rel = relative_dir.join(snapshot_file_name(snapshot_date, "parquet"));

        let csv_bytes = fs::read(self.root.join(&csv_rel))
            .await
            .with_context(|| format!("reading {}", csv_rel.display()))?;
        let parquet_path = self.root.join(&parquet_rel);
        let parquet_bytes = fs::read(&parquet_path)
            .await
            .with_context(|| format!("reading {}", parquet_rel.display()))?;
        let record_count = parquet_row_count(&parquet_path)?;

        Ok(SnapshotHandle {
            snapshot_date,
            record_count,
            csv: ArtifactFile::describe(&self.root, csv_rel, &csv_bytes),
            parquet: ArtifactFile::describe(&self.root, parquet_rel, &parquet_bytes),
        })
    }

    /// Dates of all committed snapshots, oldest first. Staging leftovers are skipped.
    pub async fn list_dates(&self) -> anyhow::Result<Vec<NaiveDate>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        let mut dates = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(date) = NaiveDate::parse_from_str(&name, "%Y%m%d") {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }
}
