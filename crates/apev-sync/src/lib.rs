//! Weekly accumulation run: fetch, snapshot, merge into the master and replicate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apev_adapters::{FeatureServiceSource, FetchContext, FixtureSource, RecordSource, DEFAULT_LAYER_URL};
use apev_core::{truncate_to_millis, FieldMapping, MasterDataset, MergeReport, Record, RecordNormalizer};
use apev_storage::{
    join_key, parse_s3_target, ArtifactStore, Destination, HttpClientConfig, HttpFetcher,
    HttpPutDestination, LocalDirDestination, MasterStore, SnapshotStore,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;
pub mod publish;

pub use merge::{collapse_snapshot, merge};
pub use publish::{
    DestinationReport, DualPublisher, PublishArtifact, PublishLedger, PublishReport, LEDGER_FILE,
};

pub const CRATE_NAME: &str = "apev-sync";

const FIELD_MAPPING_FILE: &str = "field_mapping.yaml";

/// Mondays at 06:00, seconds-first as the scheduler expects.
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * Mon";

/// Master versions kept on disk; 0 keeps every version.
pub const DEFAULT_MASTER_RETAIN: usize = 8;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub source_url: String,
    pub source_where: String,
    pub page_size: usize,
    pub fixture_path: Option<PathBuf>,
    pub destination_a: String,
    pub destination_b: String,
    pub destination_a_token: Option<String>,
    pub destination_b_token: Option<String>,
    pub destination_prefix: String,
    pub s3_endpoint: Option<String>,
    pub master_retain: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("APEV_DATA_DIR", "./data")),
            source_url: env_or("APEV_SOURCE_URL", DEFAULT_LAYER_URL),
            source_where: env_or("APEV_SOURCE_WHERE", "1=1"),
            page_size: std::env::var("APEV_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
            fixture_path: env_opt("APEV_FIXTURE_PATH").map(PathBuf::from),
            destination_a: env_or("APEV_DEST_A", "./replica-a"),
            destination_b: env_or("APEV_DEST_B", "./replica-b"),
            destination_a_token: env_opt("APEV_DEST_A_TOKEN"),
            destination_b_token: env_opt("APEV_DEST_B_TOKEN"),
            destination_prefix: env_or("APEV_DEST_PREFIX", ""),
            s3_endpoint: env_opt("APEV_S3_ENDPOINT"),
            master_retain: std::env::var("APEV_MASTER_RETAIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MASTER_RETAIN),
            scheduler_enabled: std::env::var("APEV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_or("APEV_SYNC_CRON", DEFAULT_SYNC_CRON),
            user_agent: env_or("APEV_USER_AGENT", "apev-bot/0.1"),
            http_timeout_secs: std::env::var("APEV_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            workspace_root: PathBuf::from(env_or("APEV_WORKSPACE_ROOT", ".")),
        }
    }

    /// Local-only configuration rooted at `data_dir`, reading `fixture` instead of the network.
    pub fn for_fixture(data_dir: impl Into<PathBuf>, fixture: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            destination_a: data_dir.join("replica-a").display().to_string(),
            destination_b: data_dir.join("replica-b").display().to_string(),
            workspace_root: data_dir.clone(),
            data_dir,
            source_url: DEFAULT_LAYER_URL.to_string(),
            source_where: "1=1".to_string(),
            page_size: 2000,
            fixture_path: Some(fixture.into()),
            destination_a_token: None,
            destination_b_token: None,
            destination_prefix: String::new(),
            s3_endpoint: None,
            master_retain: DEFAULT_MASTER_RETAIN,
            scheduler_enabled: false,
            sync_cron: DEFAULT_SYNC_CRON.to_string(),
            user_agent: "apev-bot/0.1".to_string(),
            http_timeout_secs: 60,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// `field_mapping.yaml` under the workspace root, or the built-in mapping when absent.
    pub fn load_field_mapping(&self) -> Result<FieldMapping> {
        let path = self.workspace_root.join(FIELD_MAPPING_FILE);
        if !path.exists() {
            return Ok(FieldMapping::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn master_dir(&self) -> PathBuf {
        self.data_dir.join("master")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }
}

/// Where one destination lives and how to reach it.
#[derive(Debug, Clone, Default)]
pub struct DestinationTarget<'a> {
    /// A directory path, an `http(s)://` base URL for PUT uploads, or `s3://bucket/prefix`.
    pub target: &'a str,
    pub prefix: &'a str,
    pub bearer_token: Option<String>,
    pub s3_endpoint: Option<String>,
}

pub fn build_destination(
    name: &str,
    destination: DestinationTarget<'_>,
    http: &HttpClientConfig,
) -> Result<Box<dyn Destination>> {
    let DestinationTarget {
        target,
        prefix,
        bearer_token,
        s3_endpoint,
    } = destination;
    if let Some((bucket, bucket_prefix)) = parse_s3_target(target) {
        return s3_destination(name, bucket, join_key(&bucket_prefix, prefix), s3_endpoint);
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        let destination = HttpPutDestination::new(name, target, prefix, bearer_token, http)
            .with_context(|| format!("configuring destination {name} ({target})"))?;
        Ok(Box::new(destination))
    } else {
        Ok(Box::new(LocalDirDestination::new(name, target, prefix)))
    }
}

#[cfg(feature = "s3")]
fn s3_destination(
    name: &str,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
) -> Result<Box<dyn Destination>> {
    Ok(Box::new(apev_storage::s3::S3Destination::new(name, bucket, prefix, endpoint)))
}

#[cfg(not(feature = "s3"))]
fn s3_destination(
    name: &str,
    bucket: String,
    _prefix: String,
    _endpoint: Option<String>,
) -> Result<Box<dyn Destination>> {
    anyhow::bail!("destination {name} targets s3://{bucket} but apev was built without the `s3` feature")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Sync,
    Remerge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    PartialPublish,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_date: NaiveDate,
    pub source_id: String,
    pub fetched_records: usize,
    pub normalized_records: usize,
    pub malformed_records: usize,
    pub merge: MergeReport,
    pub master_version: u64,
    pub master_committed: bool,
    pub publish: PublishReport,
    pub outcome: RunOutcome,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub data_dir: String,
    pub master_version: u64,
    pub master_records: usize,
    pub master_committed_at: Option<DateTime<Utc>>,
    pub snapshot_dates: Vec<NaiveDate>,
    /// Artifacts each destination has not confirmed yet.
    pub pending: BTreeMap<String, usize>,
}

struct Committed {
    report: MergeReport,
    version: u64,
    committed: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    source: Box<dyn RecordSource>,
    normalizer: RecordNormalizer,
    raw_store: ArtifactStore,
    snapshots: SnapshotStore,
    master: MasterStore,
    publisher: DualPublisher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http_config = config.http_client_config();
        let http = HttpFetcher::new(http_config.clone())?;

        let source: Box<dyn RecordSource> = match &config.fixture_path {
            Some(path) => Box::new(FixtureSource::new(path.clone())),
            None => {
                let mut source = FeatureServiceSource::new(config.source_url.clone());
                source.where_clause = config.source_where.clone();
                source.page_size = config.page_size;
                Box::new(source)
            }
        };

        let publisher = DualPublisher::new(
            build_destination(
                "destination-a",
                DestinationTarget {
                    target: &config.destination_a,
                    prefix: &config.destination_prefix,
                    bearer_token: config.destination_a_token.clone(),
                    s3_endpoint: config.s3_endpoint.clone(),
                },
                &http_config,
            )?,
            build_destination(
                "destination-b",
                DestinationTarget {
                    target: &config.destination_b,
                    prefix: &config.destination_prefix,
                    bearer_token: config.destination_b_token.clone(),
                    s3_endpoint: config.s3_endpoint.clone(),
                },
                &http_config,
            )?,
        );

        Ok(Self {
            normalizer: RecordNormalizer::new(config.load_field_mapping()?),
            raw_store: ArtifactStore::new(config.raw_dir()),
            snapshots: SnapshotStore::new(config.snapshots_dir()),
            master: MasterStore::new(config.master_dir()),
            config,
            http,
            source,
            publisher,
        })
    }

    pub fn with_source(mut self, source: Box<dyn RecordSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_publisher(mut self, publisher: DualPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_normalizer(mut self, normalizer: RecordNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    /// One full run as if fetched at `fetched_at`; the snapshot is dated by its UTC day.
    pub async fn run_at(&self, fetched_at: DateTime<Utc>) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source_id = self.source.source_id());
        self.run_inner(run_id, truncate_to_millis(fetched_at))
            .instrument(span)
            .await
    }

    async fn run_inner(&self, run_id: Uuid, fetched_at: DateTime<Utc>) -> Result<RunReport> {
        let started_at = Utc::now();
        let snapshot_date = fetched_at.date_naive();

        let ctx = FetchContext { run_id, fetched_at };
        let batch = self
            .source
            .fetch(&self.http, &ctx)
            .await
            .with_context(|| format!("fetching from {}", self.source.source_id()))?;

        let stored = self
            .raw_store
            .store_payload(fetched_at, &batch.source_id, "json", &batch.raw_payload)
            .await
            .context("archiving raw payload")?;
        info!(
            records = batch.records.len(),
            payload = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "fetched source records"
        );

        let normalized = self.normalizer.normalize_batch(&batch.records, fetched_at);
        for rejected in &normalized.rejected {
            warn!(index = rejected.index, error = %rejected.error, "dropping malformed record");
        }

        let handle = self
            .snapshots
            .save(snapshot_date, &normalized.records)
            .await
            .with_context(|| format!("saving snapshot {snapshot_date}"))?;
        info!(
            %snapshot_date,
            records = handle.record_count,
            csv_sha256 = %handle.csv.sha256,
            "snapshot saved"
        );

        let committed = self.merge_and_commit(&normalized.records).await?;
        let publish = self.publish_after_commit().await;

        self.finish(RunReport {
            run_id,
            kind: RunKind::Sync,
            started_at,
            finished_at: Utc::now(),
            snapshot_date,
            source_id: batch.source_id,
            fetched_records: batch.records.len(),
            normalized_records: normalized.records.len(),
            malformed_records: normalized.rejected.len(),
            merge: committed.report,
            master_version: committed.version,
            master_committed: committed.committed,
            outcome: outcome_of(&publish),
            publish,
            reports_dir: String::new(),
        })
        .await
    }

    /// Merge an already stored snapshot into the live master and publish.
    /// Snapshots may be merged in any order.
    pub async fn merge_stored_snapshot(&self, snapshot_date: NaiveDate) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("remerge_run", %run_id, %snapshot_date);
        async {
            let started_at = Utc::now();
            let records = self
                .snapshots
                .load(snapshot_date)
                .await
                .with_context(|| format!("loading snapshot {snapshot_date}"))?;
            let committed = self.merge_and_commit(&records).await?;
            let publish = self.publish_after_commit().await;

            self.finish(RunReport {
                run_id,
                kind: RunKind::Remerge,
                started_at,
                finished_at: Utc::now(),
                snapshot_date,
                source_id: self.source.source_id().to_string(),
                fetched_records: records.len(),
                normalized_records: records.len(),
                malformed_records: 0,
                merge: committed.report,
                master_version: committed.version,
                master_committed: committed.committed,
                outcome: outcome_of(&publish),
                publish,
                reports_dir: String::new(),
            })
            .await
        }
        .instrument(span)
        .await
    }

    async fn merge_and_commit(&self, snapshot: &[Record]) -> Result<Committed> {
        let prior = self.master.load().await.context("loading master dataset")?;
        let (merged, report) = merge(&prior, snapshot).context("merging snapshot into master")?;
        info!(
            added = report.added,
            updated = report.updated,
            reconciled = report.reconciled,
            ignored_stale = report.ignored_stale,
            collapsed = report.collapsed_duplicates,
            total = report.total_master_size,
            "merge complete"
        );

        if unchanged(&prior, &merged) {
            info!(version = prior.base_version, "master unchanged; commit skipped");
            return Ok(Committed {
                report,
                version: prior.base_version,
                committed: false,
            });
        }

        let handle = self
            .master
            .commit(&merged)
            .await
            .context("committing master dataset")?;
        if self.config.master_retain > 0 {
            if let Err(err) = self.master.prune(self.config.master_retain).await {
                warn!(error = %err, "pruning old master versions failed");
            }
        }
        Ok(Committed {
            report,
            version: handle.version,
            committed: true,
        })
    }

    /// The master is already committed here, so a publish step that cannot even
    /// start is reported as a failure on both destinations rather than failing the run.
    async fn publish_after_commit(&self) -> PublishReport {
        match self.publish_pending().await {
            Ok(report) => report,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(error = %error, "publish step failed; artifacts stay pending");
                PublishReport::unavailable(self.publisher.destination_names(), &error)
            }
        }
    }

    async fn publishable_artifacts(&self) -> Result<Vec<PublishArtifact>> {
        let mut artifacts = Vec::new();
        for date in self.snapshots.list_dates().await? {
            let handle = self
                .snapshots
                .handle(date)
                .await
                .with_context(|| format!("describing snapshot {date}"))?;
            artifacts.extend(PublishArtifact::for_snapshot(&handle));
        }
        if let Some(current) = self.master.current().await? {
            artifacts.extend(PublishArtifact::for_master(&current));
        }
        Ok(artifacts)
    }

    /// Upload every local artifact a destination has not confirmed, then record
    /// what succeeded in the ledger.
    pub async fn publish_pending(&self) -> Result<PublishReport> {
        let artifacts = self.publishable_artifacts().await?;
        let ledger_path = self.config.ledger_path();
        let mut ledger = PublishLedger::load(&ledger_path).await?;

        let report = self.publisher.publish(&artifacts, &ledger).await;
        ledger.absorb(&report.destination_a);
        ledger.absorb(&report.destination_b);
        ledger
            .save(&ledger_path)
            .await
            .context("saving publish ledger")?;

        if !report.is_complete() {
            warn!(failures = report.failures(), "publish incomplete; pending artifacts retry next run");
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let pointer = self.master.read_pointer().await?;
        let artifacts = self.publishable_artifacts().await?;
        let ledger = PublishLedger::load(&self.config.ledger_path()).await?;
        let pending = self
            .publisher
            .destination_names()
            .into_iter()
            .map(|name| (name.to_string(), ledger.pending(name, &artifacts).len()))
            .collect();

        Ok(StatusReport {
            data_dir: self.config.data_dir.display().to_string(),
            master_version: pointer.as_ref().map(|p| p.version).unwrap_or(0),
            master_records: pointer.as_ref().map(|p| p.record_count).unwrap_or(0),
            master_committed_at: pointer.map(|p| p.committed_at),
            snapshot_dates: self.snapshots.list_dates().await?,
            pending,
        })
    }

    async fn finish(&self, mut report: RunReport) -> Result<RunReport> {
        let reports_dir = self.write_reports(&report).await?;
        report.reports_dir = reports_dir.display().to_string();
        info!(outcome = ?report.outcome, master_version = report.master_version, "run finished");
        Ok(report)
    }

    async fn write_reports(&self, report: &RunReport) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir().join(report.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(reports_dir.join("run_report.json"), json)
            .await
            .context("writing run_report.json")?;
        fs::write(reports_dir.join("summary.md"), summary_markdown(report))
            .await
            .context("writing summary.md")?;

        Ok(reports_dir)
    }
}

fn unchanged(prior: &MasterDataset, merged: &MasterDataset) -> bool {
    prior.base_version > 0 && prior.records == merged.records
}

fn outcome_of(publish: &PublishReport) -> RunOutcome {
    if publish.is_complete() {
        RunOutcome::Complete
    } else {
        RunOutcome::PartialPublish
    }
}

fn destination_lines(report: &DestinationReport) -> Vec<String> {
    let mut lines = vec![format!("### {}", report.destination)];
    if report.published.is_empty() && report.succeeded() {
        lines.push(format!(
            "- nothing new ({} already recorded)",
            report.already_recorded
        ));
    }
    for status in &report.published {
        lines.push(format!("- `{}`: {:?}", status.key, status.outcome));
    }
    match (&report.failed_key, &report.error) {
        (Some(key), Some(error)) => lines.push(format!("- FAILED at `{key}`: {error}")),
        (None, Some(error)) => lines.push(format!("- FAILED: {error}")),
        _ => {}
    }
    lines
}

pub fn summary_markdown(report: &RunReport) -> String {
    let merge = &report.merge;
    let mut lines = vec![
        "# APEV Run Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Kind: {:?}", report.kind),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Snapshot date: {}", report.snapshot_date),
        format!(
            "- Records: {} fetched, {} normalized, {} malformed",
            report.fetched_records, report.normalized_records, report.malformed_records
        ),
        format!(
            "- Master: v{} ({})",
            report.master_version,
            if report.master_committed { "committed" } else { "unchanged" }
        ),
        format!("- Outcome: {:?}", report.outcome),
        String::new(),
        "## Merge".to_string(),
        format!("- added: {}", merge.added),
        format!("- updated: {}", merge.updated),
        format!("- reconciled: {}", merge.reconciled),
        format!("- ignored stale: {}", merge.ignored_stale),
        format!("- collapsed duplicates: {}", merge.collapsed_duplicates),
        format!("- total master size: {}", merge.total_master_size),
        String::new(),
        "## Publish".to_string(),
    ];
    lines.extend(destination_lines(&report.publish.destination_a));
    lines.extend(destination_lines(&report.publish.destination_b));
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the most recent `runs` run reports under `data_dir/reports`.
pub fn recent_runs_markdown(data_dir: &Path, runs: usize) -> Result<String> {
    let reports_root = data_dir.join("reports");
    let mut lines = vec!["# APEV Recent Runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("No runs recorded yet.".to_string());
        lines.push(String::new());
        return Ok(lines.join("\n"));
    }
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("run_report.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let field = |path: &[&str]| {
            path.iter()
                .try_fold(&value, |v, key| v.get(*key))
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "?".to_string())
        };

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- snapshot: {}", field(&["snapshot_date"])));
        lines.push(format!("- outcome: {}", field(&["outcome"])));
        lines.push(format!(
            "- merge: +{} added, {} updated, {} reconciled, {} stale",
            field(&["merge", "added"]),
            field(&["merge", "updated"]),
            field(&["merge", "reconciled"]),
            field(&["merge", "ignored_stale"]),
        ));
        lines.push(format!(
            "- master: v{} ({} records)",
            field(&["master_version"]),
            field(&["merge", "total_master_size"]),
        ));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

/// Cron-driven runs of `pipeline`. A trigger that fires while the previous run
/// is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping scheduled trigger");
                return;
            };
            match pipeline.run_once().await {
                Ok(report) => info!(run_id = %report.run_id, outcome = ?report.outcome, "scheduled sync finished"),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// [`build_scheduler`] on the configured cron, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    let cron = pipeline.config().sync_cron.clone();
    build_scheduler(pipeline, &cron).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn target(target: &str) -> DestinationTarget<'_> {
        DestinationTarget {
            target,
            ..Default::default()
        }
    }

    #[test]
    fn destination_target_selects_http_or_directory() {
        let http = HttpClientConfig::default();
        let remote = build_destination("a", target("https://replica.example.test/bucket"), &http).unwrap();
        let local = build_destination("b", target("/tmp/replica-b"), &http).unwrap();
        assert_eq!(remote.name(), "a");
        assert_eq!(local.name(), "b");
    }

    #[cfg(not(feature = "s3"))]
    #[test]
    fn s3_target_needs_the_s3_feature() {
        let http = HttpClientConfig::default();
        let err = build_destination("a", target("s3://apev-replica/weekly"), &http)
            .err()
            .expect("s3 target without the feature");
        assert!(err.to_string().contains("`s3` feature"));
    }

    #[cfg(feature = "s3")]
    #[test]
    fn s3_target_builds_an_s3_destination() {
        let http = HttpClientConfig::default();
        let s3 = build_destination("a", target("s3://apev-replica/weekly"), &http).unwrap();
        assert_eq!(s3.name(), "a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_cron_builds_a_scheduler() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::for_fixture(dir.path(), dir.path().join("none.geojson"));
        let cron = config.sync_cron.clone();
        assert_eq!(cron, DEFAULT_SYNC_CRON);
        let pipeline = Arc::new(SyncPipeline::new(config).unwrap());

        build_scheduler(pipeline, &cron).await.expect("default cron is accepted");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_scheduler_is_not_built() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::for_fixture(dir.path(), dir.path().join("none.geojson"));
        let pipeline = Arc::new(SyncPipeline::new(config).unwrap());
        assert!(maybe_build_scheduler(pipeline).await.unwrap().is_none());
    }

    #[test]
    fn recent_runs_digest_is_empty_before_the_first_run() {
        let dir = tempdir().unwrap();
        let digest = recent_runs_markdown(dir.path(), 5).unwrap();
        assert!(digest.starts_with("# APEV Recent Runs"));
        assert!(digest.contains("No runs recorded yet."));
    }

    #[test]
    fn field_mapping_yaml_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(FIELD_MAPPING_FILE),
            "identifier: [IncidentID]\ncontent_hash_identity: true\n",
        )
        .unwrap();
        let config = SyncConfig::for_fixture(dir.path(), dir.path().join("none.geojson"));

        let mapping = config.load_field_mapping().unwrap();
        assert_eq!(mapping.identifier, vec!["IncidentID".to_string()]);
        assert!(mapping.content_hash_identity);
        assert_eq!(mapping.last_updated, FieldMapping::default().last_updated);
    }

    #[test]
    fn missing_field_mapping_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::for_fixture(dir.path(), dir.path().join("none.geojson"));
        assert_eq!(config.load_field_mapping().unwrap(), FieldMapping::default());
    }

    #[test]
    fn first_commit_is_never_skipped() {
        let empty = MasterDataset::empty();
        assert!(!unchanged(&empty, &empty.clone()));
        let committed = MasterDataset {
            base_version: 3,
            ..MasterDataset::empty()
        };
        assert!(unchanged(&committed, &committed.clone()));
    }
}
