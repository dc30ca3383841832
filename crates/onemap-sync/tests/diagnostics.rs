use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use onemap_core::ParsedRecord;
use onemap_storage::{sha256_hex, BackoffPolicy, BlobStore, FsBlobStore, MemoryDocumentStore, StoredBlob};
use onemap_sync::{
    batches_in_range, entity_history, export_parquet, find_duplicates, pole_drop_integrity, revert_report,
    status_distribution, ImportProfile, InboxWatcher, OneMapContext, RevertSeverity, SyncConfig, TransitionKind,
    DEFAULT_ADDRESS_THRESHOLD,
};
use tempfile::{tempdir, TempDir};

fn date(s: &str) -> NaiveDate {
    s.parse().expect("date")
}

fn fixture_bytes(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/onemap")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

fn context() -> (Arc<OneMapContext>, TempDir) {
    let dir = tempdir().expect("tempdir");
    let ctx = OneMapContext::with_retry_policy(
        SyncConfig::in_memory(dir.path()),
        ImportProfile::default(),
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(FsBlobStore::new(dir.path().join("blobs"))),
        BackoffPolicy::immediate(0),
    )
    .expect("context");
    (Arc::new(ctx), dir)
}

/// Blob store whose downloads of one path always fail.
struct UnreadableBlob {
    inner: FsBlobStore,
    unreadable: String,
}

#[async_trait]
impl BlobStore for UnreadableBlob {
    async fn download(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        if path == self.unreadable {
            anyhow::bail!("connection reset while reading {path}");
        }
        self.inner.download(path).await
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        self.inner.upload(path, bytes).await
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

fn located(id: &str, status: &str, address: &str, lat: &str, lon: &str, pole: &str) -> ParsedRecord {
    ParsedRecord::new(id, Some(status))
        .with_attribute("address", address)
        .with_attribute("latitude", lat)
        .with_attribute("longitude", lon)
        .with_attribute("pole_number", pole)
}

#[tokio::test]
async fn inbox_imports_new_files_oldest_first_and_only_once() {
    let (ctx, _dir) = context();
    for name in ["Lawley_02072025.csv", "Lawley_01072025.csv"] {
        ctx.blobs
            .upload(&format!("inbox/{name}"), &fixture_bytes(name))
            .await
            .expect("upload");
    }
    ctx.blobs
        .upload("inbox/README.txt", b"drop OneMap exports here")
        .await
        .expect("upload");

    let watcher = InboxWatcher::new(Arc::clone(&ctx));
    let first = watcher.run_once().await.expect("first run");
    assert_eq!(
        first
            .imported
            .iter()
            .map(|b| b.file_name.as_str())
            .collect::<Vec<_>>(),
        vec!["Lawley_01072025.csv", "Lawley_02072025.csv"]
    );
    assert!(first.failed.is_empty(), "{:?}", first.failed);

    let second = watcher.run_once().await.expect("second run");
    assert!(second.imported.is_empty());
    assert_eq!(second.already_imported.len(), 2);
}

#[tokio::test]
async fn an_unreadable_inbox_file_does_not_stop_the_run() {
    let dir = tempdir().expect("tempdir");
    let blobs = UnreadableBlob {
        inner: FsBlobStore::new(dir.path().join("blobs")),
        unreadable: "inbox/Lawley_02072025.csv".to_string(),
    };
    for name in ["Lawley_01072025.csv", "Lawley_02072025.csv", "Lawley_03072025.csv"] {
        blobs
            .upload(&format!("inbox/{name}"), &fixture_bytes(name))
            .await
            .expect("upload");
    }
    let ctx = OneMapContext::with_retry_policy(
        SyncConfig::in_memory(dir.path()),
        ImportProfile::default(),
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(blobs),
        BackoffPolicy::immediate(0),
    )
    .expect("context");

    let summary = InboxWatcher::new(Arc::new(ctx)).run_once().await.expect("run");
    assert_eq!(
        summary
            .imported
            .iter()
            .map(|b| b.file_name.as_str())
            .collect::<Vec<_>>(),
        vec!["Lawley_01072025.csv", "Lawley_03072025.csv"]
    );
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "Lawley_02072025.csv");
    assert!(summary.failed[0].1.contains("connection reset"), "{:?}", summary.failed);
}

#[tokio::test]
async fn status_distribution_counts_entities_without_status() {
    let (ctx, _dir) = context();
    ctx.engine
        .import_bytes(
            &ctx.parser,
            "Lawley_01072025.csv",
            &fixture_bytes("Lawley_01072025.csv"),
            date("2025-07-01"),
            ctx.apply_options(false),
        )
        .await
        .expect("import");

    let distribution = status_distribution(&ctx.entities).await.expect("distribution");
    assert_eq!(distribution.total, 4);
    assert_eq!(distribution.without_status, 1);
    assert_eq!(distribution.statuses.iter().map(|s| s.count).sum::<u64>(), 3);
    assert!(distribution.to_markdown().contains("| Pole Permission: Pending | 1 |"));

    let listing = batches_in_range(&ctx.ledger, Some(date("2025-07-01")), Some(date("2025-07-31")))
        .await
        .expect("batches");
    assert_eq!(listing.batches.len(), 1);
    assert!(listing.to_markdown().contains("Lawley_01072025.csv"));
}

#[tokio::test]
async fn duplicates_are_found_by_pole_and_by_nearby_address() {
    let (ctx, _dir) = context();
    let records = vec![
        located("P1", "Pole Permission: Approved", "12 Mpumalanga Street Lawley", "-26.378112", "27.810455", "LAW.P.B167"),
        located("P2", "Pole Permission: Approved", "12 Mpumalanga St, Lawley", "-26.378114", "27.810451", "LAW.P.B900"),
        located("P3", "Pole Permission: Pending", "40 Gauteng Avenue Lawley", "-26.390000", "27.820000", "LAW.P.B167"),
    ];
    ctx.engine
        .apply_snapshot(records, "Lawley_01072025.csv", date("2025-07-01"))
        .await
        .expect("apply");

    let report = find_duplicates(&ctx.entities, DEFAULT_ADDRESS_THRESHOLD)
        .await
        .expect("duplicates");
    assert_eq!(report.scanned, 3);
    assert_eq!(report.shared_poles.len(), 1);
    assert_eq!(report.shared_poles[0].pole_number, "LAW.P.B167");
    assert_eq!(report.shared_poles[0].entity_ids, vec!["P1", "P3"]);
    assert_eq!(report.similar_addresses.len(), 1);
    assert_eq!(
        (report.similar_addresses[0].left_id.as_str(), report.similar_addresses[0].right_id.as_str()),
        ("P1", "P2")
    );
    assert!(report.to_markdown().contains("## Shared Pole Numbers"));
}

fn wired(id: &str, pole: &str, drop: &str) -> ParsedRecord {
    ParsedRecord::new(id, Some("Home Sign Ups: Approved"))
        .with_attribute("pole_number", pole)
        .with_attribute("drop_number", drop)
}

#[tokio::test]
async fn pole_drop_integrity_flags_capacity_and_shared_drops() {
    let (ctx, _dir) = context();
    let mut records = Vec::new();
    for (pole, drops) in [("LAW.P.A788", 13), ("LAW.P.A100", 12), ("LAW.P.A200", 10)] {
        for n in 0..drops {
            records.push(wired(&format!("{pole}-{n}"), pole, &format!("DR{pole}-{n}")));
        }
    }
    records.push(wired("H1", "LAW.P.B001", "DR9001"));
    records.push(wired("H2", "LAW.P.B001", "DR9002"));
    records.push(wired("H3", "LAW.P.B002", "DR9002"));
    records.push(wired("H4", "LAW.P.B001", "No Drop Allocated"));
    records.push(ParsedRecord::new("H5", Some("Pole Permission: Approved")).with_attribute("pole_number", "LAW.P.B003"));
    ctx.engine
        .apply_snapshot(records, "Lawley_01072025.csv", date("2025-07-01"))
        .await
        .expect("apply");

    let report = pole_drop_integrity(&ctx.entities).await.expect("integrity");
    assert_eq!(report.scanned, 40);
    assert_eq!(report.with_pole_and_drop, 38);
    assert_eq!(report.unique_poles, 5);
    assert_eq!(report.unique_drops, 37);
    assert!((report.average_drops_per_pole - 7.6).abs() < 1e-9);

    assert_eq!(report.over_capacity.len(), 1);
    assert_eq!(report.over_capacity[0].pole_number, "LAW.P.A788");
    assert_eq!(report.over_capacity[0].drop_count, 13);
    assert_eq!(
        report.at_capacity.iter().map(|p| p.pole_number.as_str()).collect::<Vec<_>>(),
        vec!["LAW.P.A100"]
    );
    assert_eq!(
        report.near_capacity.iter().map(|p| p.pole_number.as_str()).collect::<Vec<_>>(),
        vec!["LAW.P.A200"]
    );
    assert_eq!(report.shared_drops.len(), 1);
    assert_eq!(report.shared_drops[0].drop_number, "DR9002");
    assert_eq!(report.shared_drops[0].pole_numbers, vec!["LAW.P.B001", "LAW.P.B002"]);
    assert!(!report.is_clean());

    let markdown = report.to_markdown();
    assert!(markdown.contains("## Over Capacity"));
    assert!(markdown.contains("- `LAW.P.A788`: 13/12 drops"));
    assert!(markdown.contains("- `DR9002`: LAW.P.B001, LAW.P.B002"));
}

#[tokio::test]
async fn reverts_and_history_are_reported() {
    let (ctx, _dir) = context();
    let days = [
        ("2025-07-01", "Home Sign Ups: Approved"),
        ("2025-07-02", "Pole Permission: Pending"),
        ("2025-07-03", "Home Sign Ups: Pending"),
        ("2025-07-04", "Legacy Status"),
    ];
    for (day, status) in days {
        let d = date(day);
        ctx.engine
            .apply_snapshot(
                vec![ParsedRecord::new("P1", Some(status))],
                &format!("Lawley_{}.csv", d.format("%d%m%Y")),
                d,
            )
            .await
            .expect("apply");
    }
    let progression = ctx.profile.progression();

    let report = revert_report(&ctx.entities, &progression).await.expect("reverts");
    assert_eq!(report.transitions, 3);
    assert_eq!(report.reverts.len(), 1);
    assert_eq!(report.by_severity().get(&RevertSeverity::High), Some(&1));
    assert_eq!(report.bypassed.len(), 1);
    assert_eq!(report.unknown_statuses.get("Legacy Status"), Some(&1));

    let history = entity_history(&ctx.entities, "P1", &progression)
        .await
        .expect("history")
        .expect("P1");
    assert_eq!(history.entries.len(), 4);
    assert!(history.violations.is_empty());
    assert_eq!(history.transitions[2].kind, TransitionKind::Unknown);
    assert!(history.to_markdown().contains("| 2025-07-02 | Pole Permission: Pending |"));
    assert!(entity_history(&ctx.entities, "P404", &progression).await.unwrap().is_none());
}

#[tokio::test]
async fn parquet_export_writes_a_checksummed_manifest() {
    let (ctx, dir) = context();
    for (name, day) in [("Lawley_01072025.csv", "2025-07-01"), ("Lawley_02072025.csv", "2025-07-02")] {
        ctx.engine
            .import_bytes(&ctx.parser, name, &fixture_bytes(name), date(day), ctx.apply_options(false))
            .await
            .expect("import");
    }

    let out = dir.path().join("export");
    let manifest_path = export_parquet(&ctx.entities, &ctx.ledger, &out).await.expect("export");
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&manifest_path).expect("manifest")).expect("json");
    let files = manifest["files"].as_array().expect("files");
    assert_eq!(files.len(), 3);

    let rows: Vec<(String, u64)> = files
        .iter()
        .map(|f| (f["name"].as_str().unwrap().to_string(), f["rows"].as_u64().unwrap()))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("entities".to_string(), 4),
            ("status_history".to_string(), 5),
            ("import_batches".to_string(), 2),
        ]
    );
    for file in files {
        let bytes = std::fs::read(out.join(file["path"].as_str().unwrap())).expect("parquet file");
        assert_eq!(file["sha256"].as_str(), Some(sha256_hex(&bytes).as_str()));
        assert_eq!(file["bytes"].as_u64(), Some(bytes.len() as u64));
    }
}
