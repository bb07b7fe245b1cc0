use crate::config::JobConfig;
use crate::controller::{ControllerStats, RetrySplitController, Transition};
use crate::entry::EntrySet;
use crate::executor::BatchExecutor;
use crate::ledger::Ledger;
use crate::planner::{plan, Batch};
use crate::progress::ProgressRecord;
use crate::reporter::ProgressReport;
use crate::store::ProgressStore;
use crate::MigrateError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of a run that drained its batch queue or was interrupted.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub planned_batches: usize,
    /// Stopped early on an operator signal; outstanding work remains.
    pub interrupted: bool,
    pub stats: ControllerStats,
    pub report: ProgressReport,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn print(&self) {
        if self.interrupted {
            println!("\n[migrate] ===== RUN INTERRUPTED =====");
        } else {
            println!("\n[migrate] ===== RUN COMPLETE =====");
        }
        println!("[migrate] Planned batches: {}", self.planned_batches);
        println!(
            "[migrate] Attempts: {} (succeeded {}, retried {}, split {}, permanently failed {})",
            self.stats.attempts, self.stats.succeeded, self.stats.retries, self.stats.splits, self.stats.permanently_failed
        );
        println!("[migrate] Run time: {:.1}s", self.elapsed.as_secs_f64());
        self.report.print();
        println!("[migrate] ========================\n");
    }
}

/// Dry view of what a run would do, built without the lock.
pub struct PlanPreview {
    pub record: ProgressRecord,
    pub batches: Vec<Batch>,
}

/// Plan `config` against its progress file without locking or writing.
pub fn preview(config: &JobConfig, source: &EntrySet) -> Result<PlanPreview, MigrateError> {
    config.engine.validate()?;
    let store = ProgressStore::open_read_only(&config.progress, &config.job);
    let mut record = store.load()?;
    prepare(&mut record, config, source);
    let batches = plan(source, &record, config.engine.packing)?;
    Ok(PlanPreview { record, batches })
}

fn prepare(record: &mut ProgressRecord, config: &JobConfig, source: &EntrySet) -> usize {
    if config.normalize_owner_case {
        record.lowercase_owners();
    }
    record.reconcile(source);
    if config.retry_failed {
        record.clear_failures()
    } else {
        0
    }
}

/// One migration run: owns the locked progress store, the progress record
/// and the retry/split controller around the ledger.
///
/// Batches run strictly one at a time. A ledger write is never started
/// before the previous one has reached a terminal outcome and its progress
/// has been saved.
pub struct MigrationEngine<L: Ledger> {
    source: EntrySet,
    store: ProgressStore,
    record: ProgressRecord,
    controller: RetrySplitController<L>,
    planned_batches: usize,
    report_each_batch: bool,
    interrupt: Arc<AtomicBool>,
    started: Instant,
}

impl<L: Ledger> MigrationEngine<L> {
    /// Lock the progress file, load and upgrade it, and plan the remaining
    /// work. Fails without touching the progress file if the lock is held.
    pub fn open(job: &JobConfig, source: EntrySet, ledger: L) -> Result<Self, MigrateError> {
        job.engine.validate()?;
        let store = ProgressStore::open(&job.progress, &job.job)?;
        let mut record = store.load()?;

        let cleared = prepare(&mut record, job, &source);
        if cleared > 0 {
            warn!(cleared, "re-driving permanently failed batches");
        }
        record.touch();
        store.save(&record)?;

        let batches = plan(&source, &record, job.engine.packing)?;
        let planned_batches = batches.len();
        info!(
            job = %job.job,
            ledger = ledger.name(),
            packing = %job.engine.packing,
            batches = planned_batches,
            outstanding_entries = batches.iter().map(Batch::entry_count).sum::<usize>(),
            "planned outstanding work"
        );

        let executor = BatchExecutor::new(ledger, job.engine.operation_timeout);
        let mut controller = RetrySplitController::new(executor, job.engine.retry_policy());
        controller.enqueue(batches);

        Ok(Self {
            source,
            store,
            record,
            controller,
            planned_batches,
            report_each_batch: true,
            interrupt: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        })
    }

    /// Print the progress report after every batch (on by default).
    pub fn report_each_batch(mut self, enabled: bool) -> Self {
        self.report_each_batch = enabled;
        self
    }

    /// Share a stop flag with a signal handler. Once set, `run` returns
    /// after the batch in flight has been saved.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn planned_batches(&self) -> usize {
        self.planned_batches
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport::from_record(&self.record, &self.source)
    }

    /// One execution attempt. `None` once the queue is drained.
    pub fn step(&mut self) -> Result<Option<Transition>, MigrateError> {
        let transition = self.controller.step(&mut self.record, &self.store, &self.source)?;
        if let Some(t) = &transition {
            info!(
                batch = t.batch_index,
                attempt = t.attempt,
                entries = t.entries,
                owners = t.owners,
                outcome = %t.state,
                queued = self.controller.queued(),
                "batch transition"
            );
            if self.report_each_batch {
                self.report().print();
            }
        }
        Ok(transition)
    }

    /// Drain the queue. Stops at the first persistence error, or between
    /// batches once the interrupt flag is set.
    pub fn run(&mut self) -> Result<RunSummary, MigrateError> {
        let mut interrupted = false;
        loop {
            if self.is_interrupted() {
                warn!(queued = self.controller.queued(), "interrupted, stopping before the next batch");
                interrupted = true;
                break;
            }
            if self.step()?.is_none() {
                break;
            }
        }

        let report = self.report();
        info!(
            processed = report.processed_entries,
            outstanding = report.outstanding_entries,
            failed = report.failed_entries,
            interrupted,
            "run finished"
        );
        Ok(RunSummary {
            planned_batches: self.planned_batches,
            interrupted,
            stats: self.controller.stats().clone(),
            report,
            elapsed: self.started.elapsed(),
        })
    }

    /// Give the ledger back, releasing the lock.
    pub fn into_ledger(self) -> L {
        self.controller.into_executor().into_ledger()
    }
}
