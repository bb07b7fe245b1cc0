use ledger_migrate::config::{EngineConfig, JobConfig};
use ledger_migrate::engine::MigrationEngine;
use ledger_migrate::entry::{Entry, EntrySet};
use ledger_migrate::ledger::JournalLedger;
use ledger_migrate::planner::PackingPolicy;
use ledger_migrate::progress::SCHEMA_VERSION;
use ledger_migrate::store::ProgressStore;
use ledger_migrate::MigrateError;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn config(dir: &Path) -> JobConfig {
    JobConfig {
        job: "wearables".to_string(),
        snapshots: vec![dir.join("unused.json")],
        progress: dir.join("progress.json"),
        engine: EngineConfig {
            packing: PackingPolicy::OwnerCount { max_owners: 1 },
            retry_delay: Duration::ZERO,
            ..EngineConfig::default()
        },
        ..JobConfig::default()
    }
}

fn source() -> EntrySet {
    vec![
        Entry::new("0xabc", "1", 2),
        Entry::new("0xabc", "2", 1),
        Entry::new("0xdef", "3", 4),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_interrupted_save_keeps_last_good_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let ledger = JournalLedger::open(dir.path().join("j.jsonl")).unwrap();

    let mut engine = MigrationEngine::open(&config, source(), ledger).unwrap().report_each_batch(false);
    engine.step().unwrap();
    let good = fs::read_to_string(&config.progress).unwrap();

    // Something squats on the temp path, so the next save cannot complete.
    fs::create_dir_all(ProgressStore::temp_path_for(&config.progress)).unwrap();
    let err = engine.step().unwrap_err();
    assert!(matches!(err, MigrateError::Persistence(_)));
    drop(engine);

    assert_eq!(fs::read_to_string(&config.progress).unwrap(), good);
    let store = ProgressStore::open_read_only(&config.progress, &config.job);
    let record = store.load().unwrap();
    assert_eq!(record.applied("0xabc", "1"), 2);
    assert_eq!(record.applied("0xdef", "3"), 0);
    assert!(!config.lock_path().exists());
}

#[test]
fn test_progress_file_is_always_complete_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let ledger = JournalLedger::open(dir.path().join("j.jsonl")).unwrap();

    let mut engine = MigrationEngine::open(&config, source(), ledger).unwrap().report_each_batch(false);
    while engine.step().unwrap().is_some() {
        let text = fs::read_to_string(&config.progress).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], SCHEMA_VERSION);
        assert!(!ProgressStore::temp_path_for(&config.progress).exists());
    }
}

#[test]
fn test_legacy_owner_items_file_is_upgraded_and_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let legacy = json!({
        "lastProcessedBatchIndexInLastRun": 4,
        "failedBatchIndexesInLastRun": [],
        "startTime": 1_700_000_000_000u64,
        "processedOwnerItems": {"0xABC": ["1", "2"]},
        "batchDetails": [{
            "batchIndex": 4,
            "ownersInBatch": ["0xABC"],
            "itemBalancesInBatch": [[{"itemId": "1", "balance": 2}, {"itemId": "2", "balance": 1}]],
            "success": true,
            "attemptTimestamp": 1_700_000_000_500u64
        }]
    });
    fs::write(&config.progress, legacy.to_string()).unwrap();

    let journal = dir.path().join("j.jsonl");
    let ledger = JournalLedger::open(&journal).unwrap();
    let mut engine = MigrationEngine::open(&config, source(), ledger).unwrap().report_each_batch(false);

    // Completion flags are clamped to the requested quantities.
    assert_eq!(engine.record().applied("0xabc", "1"), 2);
    assert_eq!(engine.planned_batches(), 1);
    let first = engine.step().unwrap().unwrap();
    assert_eq!(first.batch_index, 5);
    engine.run().unwrap();

    let ledger = engine.into_ledger();
    assert_eq!(ledger.applied("0xabc", "1"), 0);
    assert_eq!(ledger.applied("0xdef", "3"), 4);

    let on_disk: Value = serde_json::from_str(&fs::read_to_string(&config.progress).unwrap()).unwrap();
    assert_eq!(on_disk["version"], SCHEMA_VERSION);
    assert_eq!(on_disk["startTime"], 1_700_000_000_000u64);
    assert!(on_disk.get("processedOwnerItems").is_none());
}

#[test]
fn test_legacy_entry_id_list_is_upgraded() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    fs::write(
        &config.progress,
        json!({
            "totalEntriesInSource": 3,
            "processedEntryIds": ["3"],
            "lastAttemptedBatchIndex": 0,
            "lastSuccessfullyProcessedBatchIndex": 0,
            "failedBatchDetails": [],
            "currentRunFailedBatchIndexes": [],
            "startTime": 1_700_000_000_000u64,
            "completed": false,
            "completedAt": null
        })
        .to_string(),
    )
    .unwrap();

    let ledger = JournalLedger::open(dir.path().join("j.jsonl")).unwrap();
    let engine = MigrationEngine::open(&config, source(), ledger).unwrap();
    assert_eq!(engine.record().applied("0xdef", "3"), 4);
    assert_eq!(engine.planned_batches(), 1);
}

#[test]
fn test_legacy_bare_id_array_is_upgraded() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    fs::write(&config.progress, json!(["1", "2"]).to_string()).unwrap();

    let ledger = JournalLedger::open(dir.path().join("j.jsonl")).unwrap();
    let mut engine = MigrationEngine::open(&config, source(), ledger).unwrap().report_each_batch(false);
    assert_eq!(engine.planned_batches(), 1);
    engine.run().unwrap();

    let ledger = engine.into_ledger();
    assert_eq!(ledger.applied("0xabc", "1"), 0);
    assert_eq!(ledger.applied("0xdef", "3"), 4);
}

#[test]
fn test_unreadable_progress_file_aborts_before_work() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    fs::write(&config.progress, "{\"version\": 2, \"processed\": ").unwrap();

    let ledger = JournalLedger::open(dir.path().join("j.jsonl")).unwrap();
    let err = MigrationEngine::open(&config, source(), ledger).err().unwrap();
    assert!(matches!(err, MigrateError::Persistence(_)));
    assert_eq!(
        fs::read_to_string(&config.progress).unwrap(),
        "{\"version\": 2, \"processed\": "
    );
    assert!(!config.lock_path().exists());
}
