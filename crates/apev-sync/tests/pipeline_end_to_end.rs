use std::path::{Path, PathBuf};

use apev_adapters::FixtureSource;
use apev_storage::{
    Destination, LocalDirDestination, MasterStore, PublishError, PutMode, PutOutcome,
    SnapshotStoreError,
};
use apev_sync::{DualPublisher, RunOutcome, SyncConfig, SyncPipeline};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tempfile::tempdir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/alpharetta-police/sample")
        .join(name)
}

fn week1_fetch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).single().unwrap()
}

fn week2_fetch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 6, 0, 0).single().unwrap()
}

fn pipeline(data_dir: &Path, fixture_name: &str) -> SyncPipeline {
    SyncPipeline::new(SyncConfig::for_fixture(data_dir, fixture(fixture_name))).expect("pipeline")
}

struct AlwaysDown {
    name: String,
}

#[async_trait]
impl Destination for AlwaysDown {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        _bytes: &[u8],
        _content_type: &str,
        _mode: PutMode,
    ) -> Result<PutOutcome, PublishError> {
        Err(PublishError::HttpStatus {
            status: 503,
            url: format!("https://replica-b.example.test/{key}"),
        })
    }
}

#[tokio::test]
async fn two_weekly_runs_accumulate_and_replicate() {
    let dir = tempdir().unwrap();

    let first = pipeline(dir.path(), "week1.geojson")
        .run_at(week1_fetch())
        .await
        .expect("week 1");
    assert_eq!(first.fetched_records, 4);
    assert_eq!(first.normalized_records, 3);
    assert_eq!(first.malformed_records, 1);
    assert_eq!(first.merge.added, 3);
    assert_eq!(first.master_version, 1);
    assert_eq!(first.outcome, RunOutcome::Complete);

    let second = pipeline(dir.path(), "week2.geojson")
        .run_at(week2_fetch())
        .await
        .expect("week 2");
    assert_eq!(second.merge.added, 1);
    assert_eq!(second.merge.updated, 1);
    assert_eq!(second.merge.reconciled, 1);
    assert_eq!(second.merge.ignored_stale, 0);
    assert_eq!(second.merge.collapsed_duplicates, 1);
    assert_eq!(second.merge.total_master_size, 4);
    assert_eq!(second.master_version, 2);
    assert!(second.master_committed);
    assert_eq!(second.outcome, RunOutcome::Complete);

    let master = MasterStore::new(dir.path().join("master")).load().await.unwrap();
    assert_eq!(master.base_version, 2);
    let a = master.get("A1B2C3D4-0000-4000-8000-00000000000A").unwrap();
    assert_eq!(a.status.as_deref(), Some("Closed"));
    let c = master.get("A1B2C3D4-0000-4000-8000-00000000000C").unwrap();
    assert_eq!(c.status.as_deref(), Some("Closed"));
    let d = master.get("A1B2C3D4-0000-4000-8000-00000000000D").unwrap();
    assert_eq!(d.status.as_deref(), Some("Report Taken"));

    let local_master = std::fs::read(dir.path().join("master/v000002/AlphaPoliceEvent_master.csv")).unwrap();
    for replica in ["replica-a", "replica-b"] {
        let root = dir.path().join(replica);
        assert!(root.join("snapshots/AlphaPoliceEvent_20260302.csv").exists());
        assert!(root.join("snapshots/AlphaPoliceEvent_20260309.parquet").exists());
        let published = std::fs::read(root.join("master/AlphaPoliceEvent_master.csv")).unwrap();
        assert_eq!(published, local_master);
    }

    let report_json = dir
        .path()
        .join("reports")
        .join(second.run_id.to_string())
        .join("run_report.json");
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_json).unwrap()).unwrap();
    assert_eq!(value["outcome"], "complete");
    assert_eq!(value["merge"]["total_master_size"], 4);

    let digest = apev_sync::recent_runs_markdown(dir.path(), 5).unwrap();
    assert!(digest.contains(&second.run_id.to_string()));
}

#[tokio::test]
async fn rerunning_the_same_snapshot_date_is_fatal() {
    let dir = tempdir().unwrap();
    pipeline(dir.path(), "week1.geojson")
        .run_at(week1_fetch())
        .await
        .expect("first run");

    let err = pipeline(dir.path(), "week1.geojson")
        .run_at(week1_fetch())
        .await
        .expect_err("second run on the same date");
    assert!(matches!(
        err.downcast_ref::<SnapshotStoreError>(),
        Some(SnapshotStoreError::Duplicate(_))
    ));

    let pointer = MasterStore::new(dir.path().join("master")).read_pointer().await.unwrap();
    assert_eq!(pointer.map(|p| p.version), Some(1));
}

#[tokio::test]
async fn failed_destination_catches_up_on_the_next_run() {
    let dir = tempdir().unwrap();
    let replica_a = dir.path().join("replica-a");
    let replica_b = dir.path().join("replica-b");

    let flaky = DualPublisher::new(
        Box::new(LocalDirDestination::new("destination-a", &replica_a, "")),
        Box::new(AlwaysDown {
            name: "destination-b".to_string(),
        }),
    );
    let first = pipeline(dir.path(), "week1.geojson")
        .with_publisher(flaky)
        .run_at(week1_fetch())
        .await
        .expect("partial publish is not fatal");
    assert_eq!(first.outcome, RunOutcome::PartialPublish);
    assert_eq!(first.master_version, 1);
    assert!(first.publish.destination_a.succeeded());
    assert_eq!(first.publish.destination_a.published.len(), 4);
    assert_eq!(
        first.publish.destination_b.failed_key.as_deref(),
        Some("snapshots/AlphaPoliceEvent_20260302.csv")
    );
    assert!(!replica_b.exists());

    let second = pipeline(dir.path(), "week2.geojson")
        .run_at(week2_fetch())
        .await
        .expect("week 2");
    assert_eq!(second.outcome, RunOutcome::Complete);
    assert_eq!(second.publish.destination_a.already_recorded, 2);
    assert_eq!(second.publish.destination_a.published.len(), 4);
    assert_eq!(second.publish.destination_b.published.len(), 6);
    assert!(replica_b.join("snapshots/AlphaPoliceEvent_20260302.csv").exists());
    assert!(replica_b.join("snapshots/AlphaPoliceEvent_20260309.csv").exists());

    let status = pipeline(dir.path(), "week2.geojson").status().await.unwrap();
    assert_eq!(status.master_version, 2);
    assert!(status.pending.values().all(|pending| *pending == 0));
}

#[tokio::test]
async fn snapshot_order_does_not_change_the_master() {
    let in_order = tempdir().unwrap();
    pipeline(in_order.path(), "week1.geojson").run_at(week1_fetch()).await.unwrap();
    pipeline(in_order.path(), "week2.geojson").run_at(week2_fetch()).await.unwrap();

    let reversed = tempdir().unwrap();
    pipeline(reversed.path(), "week2.geojson").run_at(week2_fetch()).await.unwrap();
    let late = pipeline(reversed.path(), "week1.geojson")
        .run_at(week1_fetch())
        .await
        .unwrap();
    assert_eq!(late.merge.added, 1);
    assert_eq!(late.merge.ignored_stale, 2);

    let a = MasterStore::new(in_order.path().join("master")).load().await.unwrap();
    let b = MasterStore::new(reversed.path().join("master")).load().await.unwrap();
    assert_eq!(a.records, b.records);
}

#[tokio::test]
async fn remerging_a_stored_snapshot_leaves_the_master_unchanged() {
    let dir = tempdir().unwrap();
    pipeline(dir.path(), "week1.geojson").run_at(week1_fetch()).await.unwrap();
    pipeline(dir.path(), "week2.geojson").run_at(week2_fetch()).await.unwrap();

    let remerge = pipeline(dir.path(), "week2.geojson")
        .merge_stored_snapshot(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
        .await
        .expect("remerge");
    assert!(!remerge.master_committed);
    assert_eq!(remerge.master_version, 2);
    assert_eq!(remerge.merge.added, 0);
    assert_eq!(remerge.merge.total_master_size, 4);
    assert_eq!(remerge.outcome, RunOutcome::Complete);

    let missing = pipeline(dir.path(), "week2.geojson")
        .merge_stored_snapshot(NaiveDate::from_ymd_opt(2026, 1, 5).unwrap())
        .await
        .expect_err("no snapshot stored for that date");
    assert!(matches!(
        missing.downcast_ref::<SnapshotStoreError>(),
        Some(SnapshotStoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn fixture_source_can_be_swapped_in_after_construction() {
    let dir = tempdir().unwrap();
    let report = pipeline(dir.path(), "missing.geojson")
        .with_source(Box::new(FixtureSource::new(fixture("week1.geojson"))))
        .run_at(week1_fetch())
        .await
        .unwrap();
    assert_eq!(report.normalized_records, 3);
    assert_eq!(report.snapshot_date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
}

#[tokio::test]
async fn unreadable_publish_ledger_does_not_fail_a_committed_run() {
    let dir = tempdir().unwrap();
    pipeline(dir.path(), "week1.geojson").run_at(week1_fetch()).await.unwrap();
    std::fs::write(dir.path().join(apev_sync::LEDGER_FILE), "not json").unwrap();

    let second = pipeline(dir.path(), "week2.geojson")
        .run_at(week2_fetch())
        .await
        .expect("publish trouble after commit is reported, not fatal");
    assert_eq!(second.outcome, RunOutcome::PartialPublish);
    assert_eq!(second.master_version, 2);
    assert!(second.master_committed);
    assert_eq!(second.publish.failures(), 2);
    assert!(second
        .publish
        .destination_a
        .error
        .as_deref()
        .is_some_and(|e| e.contains("publish_ledger.json")));

    let reports = dir.path().join("reports").join(second.run_id.to_string());
    assert!(reports.join("run_report.json").exists());
    let summary = std::fs::read_to_string(reports.join("summary.md")).unwrap();
    assert!(summary.contains("- FAILED: "));
}

#[tokio::test]
async fn old_master_versions_are_pruned_after_commit() {
    let dir = tempdir().unwrap();
    let retaining_one = |fixture_name: &str| {
        let mut config = SyncConfig::for_fixture(dir.path(), fixture(fixture_name));
        config.master_retain = 1;
        SyncPipeline::new(config).expect("pipeline")
    };
    retaining_one("week1.geojson").run_at(week1_fetch()).await.unwrap();
    let second = retaining_one("week2.geojson").run_at(week2_fetch()).await.unwrap();
    assert_eq!(second.master_version, 2);

    let master_dir = dir.path().join("master");
    assert!(!master_dir.join("v000001").exists());
    assert!(master_dir.join("v000002").exists());
    let master = MasterStore::new(&master_dir).load().await.unwrap();
    assert_eq!(master.records.len(), 4);
}
