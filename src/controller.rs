use crate::entry::{Entry, EntrySet};
use crate::executor::{BatchExecutor, Outcome};
use crate::ledger::Ledger;
use crate::planner::Batch;
use crate::progress::{now_millis, BatchAttempt, FailedBatch, ProgressRecord};
use crate::store::ProgressStore;
use crate::MigrateError;
use std::collections::VecDeque;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle of one queued batch.
///
/// `Pending -> Executing -> {Succeeded | RetryPending | SplitPending |
/// PermanentlyFailed}`. `RetryPending` goes back to `Executing` after the
/// retry delay; `SplitPending` is replaced by two new `Pending` halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Executing,
    Succeeded,
    RetryPending,
    SplitPending,
    PermanentlyFailed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Pending => "pending",
            BatchState::Executing => "executing",
            BatchState::Succeeded => "succeeded",
            BatchState::RetryPending => "retry-pending",
            BatchState::SplitPending => "split-pending",
            BatchState::PermanentlyFailed => "permanently-failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt of an identical batch.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

struct QueuedBatch {
    batch: Batch,
    state: BatchState,
    /// Assigned on first execution and shared by its retries.
    index: Option<u64>,
    retries: u32,
}

impl QueuedBatch {
    fn pending(batch: Batch) -> Self {
        Self {
            batch,
            state: BatchState::Pending,
            index: None,
            retries: 0,
        }
    }
}

/// What one step did, for logging and reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub batch_index: u64,
    pub attempt: u32,
    pub entries: usize,
    pub owners: usize,
    pub state: BatchState,
    pub error: Option<String>,
}

/// Counters over the controller's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub attempts: u64,
    pub succeeded: u64,
    pub retries: u64,
    pub splits: u64,
    pub permanently_failed: u64,
}

/// Drives queued batches through retry and bisection.
///
/// Each `step` is exactly one execution attempt followed by a save of the
/// resulting progress. Nothing further runs until that save has succeeded.
pub struct RetrySplitController<L: Ledger> {
    executor: BatchExecutor<L>,
    policy: RetryPolicy,
    queue: VecDeque<QueuedBatch>,
    stats: ControllerStats,
}

impl<L: Ledger> RetrySplitController<L> {
    pub fn new(executor: BatchExecutor<L>, policy: RetryPolicy) -> Self {
        Self {
            executor,
            policy,
            queue: VecDeque::new(),
            stats: ControllerStats::default(),
        }
    }

    pub fn enqueue<I: IntoIterator<Item = Batch>>(&mut self, batches: I) {
        self.queue.extend(batches.into_iter().map(QueuedBatch::pending));
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn executor(&self) -> &BatchExecutor<L> {
        &self.executor
    }

    pub fn into_executor(self) -> BatchExecutor<L> {
        self.executor
    }

    /// Run one attempt of the batch at the front of the queue. Returns
    /// `None` once the queue is empty. A persistence error is returned
    /// as-is and the run must stop.
    pub fn step(
        &mut self,
        record: &mut ProgressRecord,
        store: &ProgressStore,
        source: &EntrySet,
    ) -> Result<Option<Transition>, MigrateError> {
        let Some(mut current) = self.queue.pop_front() else {
            return Ok(None);
        };

        if current.state == BatchState::RetryPending && !self.policy.retry_delay.is_zero() {
            thread::sleep(self.policy.retry_delay);
        }

        let index = *current.index.get_or_insert_with(|| record.allocate_batch_index());
        current.state = BatchState::Executing;
        let entries = current.batch.entries();
        let owners = current.batch.owner_count();
        let attempt = current.retries + 1;

        let outcome = self.executor.execute(&current.batch);
        self.stats.attempts += 1;
        let error = outcome.error().map(str::to_string);

        record.record_attempt(BatchAttempt {
            batch_index: index,
            entries: entries.clone(),
            success: outcome.is_success(),
            attempt_timestamp: now_millis(),
            attempt,
            error: error.clone(),
        });

        if let Outcome::Fatal(e) = &outcome {
            error!(batch = index, attempt, error = %e, "ledger refused the caller, halting");
            record.touch();
            store.save(record)?;
            current.state = BatchState::Pending;
            self.queue.push_front(current);
            return Err(MigrateError::Ledger(format!("batch {}: {}", index, e)));
        }

        let mut halves = None;
        let next = match &outcome {
            Outcome::Success(receipt) => {
                record.record_applied(&entries, source);
                self.stats.succeeded += 1;
                info!(
                    batch = index,
                    attempt,
                    entries = entries.len(),
                    owners,
                    reference = receipt.as_ref().map(|r| r.reference.as_str()).unwrap_or("-"),
                    "batch applied"
                );
                BatchState::Succeeded
            }
            Outcome::TransientFailure(e) if current.retries < self.policy.max_retries => {
                warn!(
                    batch = index,
                    attempt,
                    retries_left = self.policy.max_retries - current.retries,
                    error = %e,
                    "batch failed, will retry"
                );
                BatchState::RetryPending
            }
            Outcome::TransientFailure(e) | Outcome::PermanentFailure(e) | Outcome::Fatal(e) => match current.batch.bisect() {
                Some(pair) => {
                    halves = Some(pair);
                    warn!(batch = index, attempt, entries = entries.len(), error = %e, "batch failed, splitting");
                    BatchState::SplitPending
                }
                None => {
                    let entry = entries.first().map(describe_entry).unwrap_or_default();
                    error!(batch = index, attempt, entry = %entry, error = %e, "entry permanently failed");
                    record.record_failure(FailedBatch {
                        batch_index: index,
                        entries: entries.clone(),
                        error: e.clone(),
                        timestamp: now_millis(),
                        retry_count: current.retries,
                        resolved: false,
                    });
                    BatchState::PermanentlyFailed
                }
            },
        };

        record.touch();
        store.save(record)?;

        match next {
            BatchState::RetryPending => {
                current.retries += 1;
                current.state = BatchState::RetryPending;
                self.stats.retries += 1;
                self.queue.push_front(current);
            }
            BatchState::SplitPending => {
                if let Some((left, right)) = halves {
                    self.stats.splits += 1;
                    self.queue.push_front(QueuedBatch::pending(right));
                    self.queue.push_front(QueuedBatch::pending(left));
                }
            }
            BatchState::PermanentlyFailed => self.stats.permanently_failed += 1,
            _ => {}
        }

        Ok(Some(Transition {
            batch_index: index,
            attempt,
            entries: entries.len(),
            owners,
            state: next,
            error,
        }))
    }
}

fn describe_entry(e: &Entry) -> String {
    format!("{}/{}x{}", e.owner_key, e.asset_id, e.quantity)
}
