//! Replication of snapshot and master artifacts to two independent destinations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use apev_storage::master::master_file_name;
use apev_storage::snapshot::snapshot_file_name;
use apev_storage::{
    replace_file_atomically, sha256_hex, ArtifactFile, Destination, PutMode, PutOutcome,
    SnapshotHandle, WriteHandle,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

pub const LEDGER_FILE: &str = "publish_ledger.json";

const CSV: &str = "text/csv";
const PARQUET: &str = "application/vnd.apache.parquet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishArtifact {
    pub key: String,
    pub local_path: PathBuf,
    pub sha256: String,
    pub content_type: &'static str,
    pub mode: PutMode,
}

impl PublishArtifact {
    fn from_file(key: String, file: &ArtifactFile, content_type: &'static str, mode: PutMode) -> Self {
        Self {
            key,
            local_path: file.absolute_path.clone(),
            sha256: file.sha256.clone(),
            content_type,
            mode,
        }
    }

    pub fn for_snapshot(handle: &SnapshotHandle) -> Vec<Self> {
        let date = handle.snapshot_date;
        vec![
            Self::from_file(
                format!("snapshots/{}", snapshot_file_name(date, "csv")),
                &handle.csv,
                CSV,
                PutMode::CreateOnce,
            ),
            Self::from_file(
                format!("snapshots/{}", snapshot_file_name(date, "parquet")),
                &handle.parquet,
                PARQUET,
                PutMode::CreateOnce,
            ),
        ]
    }

    pub fn for_master(handle: &WriteHandle) -> Vec<Self> {
        vec![
            Self::from_file(
                format!("master/{}", master_file_name("csv")),
                &handle.csv,
                CSV,
                PutMode::Overwrite,
            ),
            Self::from_file(
                format!("master/{}", master_file_name("parquet")),
                &handle.parquet,
                PARQUET,
                PutMode::Overwrite,
            ),
        ]
    }

    async fn read_verified(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = fs::read(&self.local_path)
            .await
            .with_context(|| format!("reading {}", self.local_path.display()))?;
        let digest = sha256_hex(&bytes);
        if digest != self.sha256 {
            anyhow::bail!(
                "{} changed on disk: expected sha256 {}, found {}",
                self.local_path.display(),
                self.sha256,
                digest
            );
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub key: String,
    pub sha256: String,
    pub outcome: PutOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationReport {
    pub destination: String,
    pub published: Vec<ArtifactStatus>,
    /// Artifacts skipped because the ledger already records them.
    pub already_recorded: usize,
    pub failed_key: Option<String>,
    pub error: Option<String>,
}

impl DestinationReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub destination_a: DestinationReport,
    pub destination_b: DestinationReport,
}

impl PublishReport {
    pub fn failures(&self) -> usize {
        [&self.destination_a, &self.destination_b]
            .iter()
            .filter(|d| !d.succeeded())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.failures() == 0
    }

    /// Both destinations failed before any artifact was attempted.
    pub fn unavailable(names: [&str; 2], error: &str) -> Self {
        let failed = |name: &str| DestinationReport {
            destination: name.to_string(),
            published: Vec::new(),
            already_recorded: 0,
            failed_key: None,
            error: Some(error.to_string()),
        };
        Self {
            destination_a: failed(names[0]),
            destination_b: failed(names[1]),
        }
    }
}

/// Per-destination record of `key -> sha256` for every confirmed upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishLedger {
    #[serde(default)]
    pub destinations: BTreeMap<String, BTreeMap<String, String>>,
}

impl PublishLedger {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing publish ledger")?;
        replace_file_atomically(path, &bytes).await
    }

    pub fn is_recorded(&self, destination: &str, key: &str, sha256: &str) -> bool {
        self.destinations
            .get(destination)
            .and_then(|keys| keys.get(key))
            .is_some_and(|recorded| recorded == sha256)
    }

    pub fn absorb(&mut self, report: &DestinationReport) {
        let keys = self
            .destinations
            .entry(report.destination.clone())
            .or_default();
        for status in &report.published {
            keys.insert(status.key.clone(), status.sha256.clone());
        }
    }

    /// Artifacts from `artifacts` that `destination` has not confirmed yet.
    pub fn pending<'a>(
        &self,
        destination: &str,
        artifacts: &'a [PublishArtifact],
    ) -> Vec<&'a PublishArtifact> {
        artifacts
            .iter()
            .filter(|a| !self.is_recorded(destination, &a.key, &a.sha256))
            .collect()
    }
}

/// Two replicas of identical content; neither is primary.
pub struct DualPublisher {
    destination_a: Box<dyn Destination>,
    destination_b: Box<dyn Destination>,
}

impl DualPublisher {
    pub fn new(destination_a: Box<dyn Destination>, destination_b: Box<dyn Destination>) -> Self {
        Self {
            destination_a,
            destination_b,
        }
    }

    pub fn destination_names(&self) -> [&str; 2] {
        [self.destination_a.name(), self.destination_b.name()]
    }

    /// Push every artifact the ledger does not already record to both
    /// destinations concurrently. A failure on one side never stops the other.
    pub async fn publish(&self, artifacts: &[PublishArtifact], ledger: &PublishLedger) -> PublishReport {
        let (destination_a, destination_b) = tokio::join!(
            publish_to(self.destination_a.as_ref(), artifacts, ledger),
            publish_to(self.destination_b.as_ref(), artifacts, ledger),
        );
        PublishReport {
            destination_a,
            destination_b,
        }
    }
}

async fn publish_to(
    destination: &dyn Destination,
    artifacts: &[PublishArtifact],
    ledger: &PublishLedger,
) -> DestinationReport {
    let name = destination.name();
    let pending = ledger.pending(name, artifacts);
    let mut report = DestinationReport {
        destination: name.to_string(),
        published: Vec::new(),
        already_recorded: artifacts.len() - pending.len(),
        failed_key: None,
        error: None,
    };

    for artifact in pending {
        let result = match artifact.read_verified().await {
            Ok(bytes) => destination
                .put(&artifact.key, &bytes, artifact.content_type, artifact.mode)
                .await
                .map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        match result {
            Ok(outcome) => {
                info!(destination = name, key = %artifact.key, ?outcome, "published artifact");
                report.published.push(ArtifactStatus {
                    key: artifact.key.clone(),
                    sha256: artifact.sha256.clone(),
                    outcome,
                });
            }
            Err(err) => {
                warn!(destination = name, key = %artifact.key, error = %format!("{err:#}"), "publish failed");
                report.failed_key = Some(artifact.key.clone());
                report.error = Some(format!("{err:#}"));
                break;
            }
        }
    }

    report
}
