use std::sync::Arc;

use chrono::NaiveDate;
use onemap_core::{BackupState, ParsedRecord, RestorePhase};
use onemap_storage::{
    BackoffPolicy, DocumentStore, FaultInjectingStore, MemoryDocumentStore, ENTITIES, IMPORT_BATCHES,
};
use onemap_sync::{
    backup_collection_name, BackupManager, ReconcileError, ReconciliationEngine,
};

fn date(s: &str) -> NaiveDate {
    s.parse().expect("date")
}

fn engine_over(documents: Arc<dyn DocumentStore>) -> ReconciliationEngine {
    let entities = Arc::new(
        onemap_storage::EntityStore::new(documents.clone()).with_retry_policy(BackoffPolicy::immediate(0)),
    );
    let ledger =
        Arc::new(onemap_storage::ImportLedger::new(documents).with_retry_policy(BackoffPolicy::immediate(0)));
    ReconciliationEngine::new(entities, ledger)
}

async fn seed(engine: &ReconciliationEngine, file: &str, day: &str, statuses: &[(&str, &str)]) {
    let records = statuses
        .iter()
        .map(|(id, status)| ParsedRecord::new(*id, Some(*status)))
        .collect();
    engine
        .apply_snapshot(records, file, date(day))
        .await
        .expect("seed import");
}

#[tokio::test]
async fn restore_brings_back_the_exact_documents() {
    let memory = Arc::new(MemoryDocumentStore::new());
    let engine = engine_over(memory.clone());
    let backups = BackupManager::new(memory.clone())
        .with_retry_policy(BackoffPolicy::immediate(0))
        .with_page_size(2);

    seed(
        &engine,
        "Lawley_01072025.csv",
        "2025-07-01",
        &[("P1", "A"), ("P2", "A"), ("P3", "B"), ("P4", "C"), ("P5", "A")],
    )
    .await;
    let entities_at_backup = memory.dump(ENTITIES).await;
    let ledger_at_backup = memory.dump(IMPORT_BATCHES).await;

    let manifest = backups.backup("before July 2").await.expect("backup");
    assert_eq!(manifest.state, BackupState::Complete);
    assert_eq!(manifest.copied.get(ENTITIES), Some(&5));
    assert_eq!(manifest.copied.get(IMPORT_BATCHES), Some(&1));

    seed(&engine, "Lawley_02072025.csv", "2025-07-02", &[("P1", "B"), ("P6", "A")]).await;
    assert_ne!(memory.dump(ENTITIES).await, entities_at_backup);

    let job = backups.restore(&manifest.tag, true).await.expect("restore");
    assert_eq!(job.phase, RestorePhase::Done);
    assert_eq!(job.restored.get(ENTITIES), Some(&5));
    assert_eq!(job.cleared.get(ENTITIES), Some(&6));
    assert_eq!(memory.dump(ENTITIES).await, entities_at_backup);
    assert_eq!(memory.dump(IMPORT_BATCHES).await, ledger_at_backup);

    let safety = backups
        .manifest(&job.pre_restore_tag)
        .await
        .unwrap()
        .expect("pre-restore backup");
    assert!(safety.is_usable());
    assert_eq!(safety.copied.get(ENTITIES), Some(&6));
    assert_eq!(
        backups.latest_complete().await.unwrap().map(|m| m.tag),
        Some(job.pre_restore_tag.clone())
    );
}

#[tokio::test]
async fn restore_needs_confirmation_and_a_real_backup() {
    let memory = Arc::new(MemoryDocumentStore::new());
    let backups = BackupManager::new(memory.clone());

    let err = backups.restore("bk-missing", false).await.unwrap_err();
    assert!(matches!(err, ReconcileError::RestoreNotConfirmed(_)), "{err:?}");

    let err = backups.restore("bk-missing", true).await.unwrap_err();
    assert!(matches!(err, ReconcileError::BackupNotFound(_)), "{err:?}");

    let err = backups.resume_restore("no-such-job").await.unwrap_err();
    assert!(matches!(err, ReconcileError::RestoreJobNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn interrupted_backup_is_marked_incomplete_and_resumes() {
    let faulty = Arc::new(FaultInjectingStore::new(Arc::new(MemoryDocumentStore::new())));
    let engine = engine_over(faulty.clone());
    let backups = BackupManager::new(faulty.clone())
        .with_retry_policy(BackoffPolicy::immediate(0))
        .with_page_size(2);
    seed(
        &engine,
        "Lawley_01072025.csv",
        "2025-07-01",
        &[("P1", "A"), ("P2", "A"), ("P3", "B")],
    )
    .await;

    let previous = backups.backup("good one").await.expect("first backup");

    faulty.fail_next_batches(1);
    let err = backups.backup("doomed").await.unwrap_err();
    let tag = match err {
        ReconcileError::BackupIncomplete { tag, .. } => tag,
        other => panic!("expected BackupIncomplete, got {other:?}"),
    };
    let broken = backups.manifest(&tag).await.unwrap().expect("manifest");
    assert_eq!(broken.state, BackupState::Incomplete);
    assert!(broken.error.is_some());
    assert!(backups.manifest(&previous.tag).await.unwrap().expect("previous").is_usable());

    let err = backups.restore(&tag, true).await.unwrap_err();
    assert!(matches!(err, ReconcileError::BackupIncomplete { .. }), "{err:?}");

    let resumed = backups.resume_backup(&tag).await.expect("resume");
    assert_eq!(resumed.state, BackupState::Complete);
    assert_eq!(resumed.copied.get(ENTITIES), Some(&3));
    assert_eq!(
        faulty.count(&backup_collection_name(&tag, ENTITIES)).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn interrupted_restore_resumes_from_its_job() {
    let inner = Arc::new(MemoryDocumentStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    let engine = engine_over(faulty.clone());
    let backups = BackupManager::new(faulty.clone())
        .with_retry_policy(BackoffPolicy::immediate(0))
        .with_page_size(2);

    seed(
        &engine,
        "Lawley_01072025.csv",
        "2025-07-01",
        &[("P1", "A"), ("P2", "A"), ("P3", "B")],
    )
    .await;
    let expected = inner.dump(ENTITIES).await;
    let manifest = backups.backup("baseline").await.expect("backup");
    seed(&engine, "Lawley_02072025.csv", "2025-07-02", &[("P2", "C")]).await;

    faulty.poison(ENTITIES, "P2").await;
    let err = backups.restore(&manifest.tag, true).await.unwrap_err();
    let job_id = match err {
        ReconcileError::RestoreInterrupted { job_id, phase, .. } => {
            assert_eq!(phase, "clearing");
            job_id
        }
        other => panic!("expected RestoreInterrupted, got {other:?}"),
    };
    let stalled = backups.restore_job(&job_id).await.unwrap().expect("job");
    assert_eq!(stalled.phase, RestorePhase::Clearing);
    assert!(stalled.error.is_some());

    faulty.clear_poison().await;
    let job = backups.resume_restore(&job_id).await.expect("resume");
    assert_eq!(job.phase, RestorePhase::Done);
    assert_eq!(job.job_id, job_id);
    assert_eq!(inner.dump(ENTITIES).await, expected);
    assert_eq!(backups.restore_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn prune_keeps_the_newest_complete_backups() {
    let memory = Arc::new(MemoryDocumentStore::new());
    let engine = engine_over(memory.clone());
    let backups = BackupManager::new(memory.clone());
    seed(&engine, "Lawley_01072025.csv", "2025-07-01", &[("P1", "A")]).await;

    let mut tags = Vec::new();
    for n in 0..3 {
        tags.push(backups.backup(&format!("nightly {n}")).await.expect("backup").tag);
    }

    let purged = backups.prune(1).await.expect("prune");
    assert_eq!(purged, tags[..2].to_vec());
    let left: Vec<String> = backups.list().await.unwrap().into_iter().map(|m| m.tag).collect();
    assert_eq!(left, vec![tags[2].clone()]);
    for tag in &tags[..2] {
        assert_eq!(memory.count(&backup_collection_name(tag, ENTITIES)).await.unwrap(), 0);
    }
    assert_eq!(memory.count(&backup_collection_name(&tags[2], ENTITIES)).await.unwrap(), 1);

    let err = backups.purge(&tags[0]).await.unwrap_err();
    assert!(matches!(err, ReconcileError::BackupNotFound(_)), "{err:?}");
}
