use ledger_migrate::config::{EngineConfig, JobConfig};
use ledger_migrate::controller::BatchState;
use ledger_migrate::engine::MigrationEngine;
use ledger_migrate::entry::{Entry, EntrySet};
use ledger_migrate::ledger::{JournalLedger, Ledger, LedgerError, Receipt};
use ledger_migrate::planner::{Batch, PackingPolicy};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;
use std::time::Duration;

/// Rejects any batch holding a poisoned asset and fails the first
/// `transient` writes with a congestion error.
#[derive(Default)]
struct Guarded {
    poisoned: FxHashSet<String>,
    transient: u32,
    applied: FxHashMap<(String, String), u64>,
    writes: u32,
}

impl Guarded {
    fn poisoned(assets: &[&str]) -> Self {
        Self {
            poisoned: assets.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl Ledger for Guarded {
    fn name(&self) -> &str {
        "guarded"
    }

    fn apply(&mut self, batch: &Batch, _timeout: Duration) -> Result<Receipt, LedgerError> {
        self.writes += 1;
        if self.transient > 0 {
            self.transient -= 1;
            return Err(LedgerError::transient("nonce too low, resubmit"));
        }
        let entries = batch.entries();
        if let Some(bad) = entries.iter().find(|e| self.poisoned.contains(&e.asset_id)) {
            return Err(LedgerError::rejected(format!("asset {} already exists", bad.asset_id)));
        }
        for e in entries {
            *self.applied.entry((e.owner_key, e.asset_id)).or_insert(0) += e.quantity;
        }
        Ok(Receipt { reference: format!("0x{:04x}", self.writes) })
    }
}

fn config(dir: &Path, packing: PackingPolicy) -> JobConfig {
    JobConfig {
        job: "split".to_string(),
        snapshots: vec![dir.join("unused.json")],
        progress: dir.join("progress.json"),
        engine: EngineConfig {
            packing,
            retry_delay: Duration::ZERO,
            ..EngineConfig::default()
        },
        ..JobConfig::default()
    }
}

fn four_owners() -> EntrySet {
    vec![
        Entry::new("a", "100", 1),
        Entry::new("b", "200", 1),
        Entry::new("c", "300", 1),
        Entry::new("d", "400", 1),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_bad_entry_isolated_and_others_applied() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), PackingPolicy::EntryCount { max_entries: 4 });
    let source = four_owners();

    let mut engine = MigrationEngine::open(&config, source.clone(), Guarded::poisoned(&["300"]))
        .unwrap()
        .report_each_batch(false);
    assert_eq!(engine.planned_batches(), 1);
    let summary = engine.run().unwrap();

    assert_eq!(summary.report.processed_entries, 3);
    assert_eq!(summary.report.failed_entries, 1);
    assert_eq!(summary.report.outstanding_entries, 0);
    assert_eq!(summary.stats.permanently_failed, 1);
    assert_eq!(summary.stats.retries, 0);

    let record = engine.record().clone();
    assert_eq!(record.failed_batches.len(), 1);
    assert_eq!(record.failed_batches[0].entries, vec![Entry::new("c", "300", 1)]);
    assert!(record.failed_batches[0].error.contains("already exists"));

    let ledger = engine.into_ledger();
    assert_eq!(ledger.applied.len(), 3);
    assert!(!ledger.applied.contains_key(&("c".to_string(), "300".to_string())));

    // A restart does not touch the failed entry again.
    let writes = ledger.writes;
    let mut engine = MigrationEngine::open(&config, source, ledger).unwrap().report_each_batch(false);
    assert_eq!(engine.planned_batches(), 0);
    engine.run().unwrap();
    assert_eq!(engine.into_ledger().writes, writes);
}

#[test]
fn test_retry_failed_redrives_after_fix() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), PackingPolicy::EntryCount { max_entries: 4 });
    let source = four_owners();

    let mut engine = MigrationEngine::open(&config, source.clone(), Guarded::poisoned(&["300"]))
        .unwrap()
        .report_each_batch(false);
    engine.run().unwrap();
    let mut ledger = engine.into_ledger();
    ledger.poisoned.clear();

    config.retry_failed = true;
    let mut engine = MigrationEngine::open(&config, source, ledger).unwrap().report_each_batch(false);
    assert_eq!(engine.planned_batches(), 1);
    let summary = engine.run().unwrap();
    assert_eq!(summary.report.processed_entries, 4);
    assert_eq!(summary.report.failed_entries, 0);

    // The audit log keeps the old failure, marked resolved.
    assert_eq!(engine.record().failed_batches.len(), 1);
    assert!(engine.record().failed_batches[0].resolved);
}

#[test]
fn test_transient_failures_retry_without_splitting() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), PackingPolicy::EntryCount { max_entries: 4 });
    let ledger = Guarded {
        transient: 3,
        ..Guarded::default()
    };

    let mut engine = MigrationEngine::open(&config, four_owners(), ledger)
        .unwrap()
        .report_each_batch(false);
    let mut states = Vec::new();
    while let Some(t) = engine.step().unwrap() {
        states.push(t.state);
    }
    assert_eq!(
        states,
        vec![
            BatchState::RetryPending,
            BatchState::RetryPending,
            BatchState::RetryPending,
            BatchState::Succeeded
        ]
    );
    assert_eq!(engine.record().batch_details.len(), 4);
    assert!(engine.record().batch_details.iter().all(|a| a.batch_index == 0));
}

#[test]
fn test_split_within_single_owner() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), PackingPolicy::OwnerCount { max_owners: 10 });
    let source: EntrySet = (1..=5).map(|i| Entry::new("solo", i.to_string(), 1)).collect();

    let mut engine = MigrationEngine::open(&config, source, Guarded::poisoned(&["4"]))
        .unwrap()
        .report_each_batch(false);
    let summary = engine.run().unwrap();
    assert_eq!(summary.report.processed_entries, 4);
    assert_eq!(engine.record().failed_batches[0].entries, vec![Entry::new("solo", "4", 1)]);
}

#[test]
fn test_journal_guard_catches_double_application() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), PackingPolicy::EntryCount { max_entries: 4 });
    let source = four_owners();
    let journal = dir.path().join("ledger.jsonl");

    // Someone already applied "b" outside the engine.
    {
        let mut ledger = JournalLedger::open(&journal).unwrap();
        ledger
            .apply(&Batch::from_entries(vec![Entry::new("b", "200", 1)]), Duration::ZERO)
            .unwrap();
    }

    let ledger = JournalLedger::open(&journal).unwrap().with_caps(source.clone());
    let mut engine = MigrationEngine::open(&config, source, ledger).unwrap().report_each_batch(false);
    let summary = engine.run().unwrap();

    assert_eq!(summary.report.failed_entries, 1);
    assert_eq!(engine.record().failed_batches[0].entries[0].owner_key, "b");
    let ledger = engine.into_ledger();
    for (owner, asset) in [("a", "100"), ("b", "200"), ("c", "300"), ("d", "400")] {
        assert_eq!(ledger.applied(owner, asset), 1);
    }
}
