use crate::ledger::{Ledger, LedgerErrorKind, Receipt};
use crate::planner::Batch;
use std::time::{Duration, Instant};
use tracing::debug;

/// Terminal result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Option<Receipt>),
    /// Worth retrying unmodified.
    TransientFailure(String),
    /// The content was rejected. Only splitting can help.
    PermanentFailure(String),
    /// The ledger will accept nothing from this caller. The run must stop.
    Fatal(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::TransientFailure(e) | Outcome::PermanentFailure(e) | Outcome::Fatal(e) => Some(e),
        }
    }
}

/// Submits one batch as exactly one ledger write.
pub struct BatchExecutor<L: Ledger> {
    ledger: L,
    timeout: Duration,
    submissions: u64,
}

impl<L: Ledger> BatchExecutor<L> {
    pub fn new(ledger: L, timeout: Duration) -> Self {
        Self {
            ledger,
            timeout,
            submissions: 0,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    /// Ledger writes made so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Execute a batch. Malformed content is refused before any write; an
    /// empty batch succeeds without one.
    pub fn execute(&mut self, batch: &Batch) -> Outcome {
        if batch.is_empty() {
            return Outcome::Success(None);
        }
        if let Some(problem) = validate(batch) {
            return Outcome::PermanentFailure(problem);
        }

        let started = Instant::now();
        self.submissions += 1;
        let result = self.ledger.apply(batch, self.timeout);
        debug!(
            ledger = self.ledger.name(),
            entries = batch.entry_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ledger write returned"
        );

        match result {
            Ok(receipt) => Outcome::Success(Some(receipt)),
            Err(e) => match e.kind {
                LedgerErrorKind::Transient | LedgerErrorKind::Timeout => Outcome::TransientFailure(e.to_string()),
                LedgerErrorKind::Rejected => Outcome::PermanentFailure(e.to_string()),
                LedgerErrorKind::Fatal => Outcome::Fatal(e.to_string()),
            },
        }
    }
}

fn validate(batch: &Batch) -> Option<String> {
    for slice in &batch.owners {
        if slice.owner_key.is_empty() {
            return Some("batch has an empty owner key".to_string());
        }
        for asset in &slice.assets {
            if asset.asset_id.is_empty() {
                return Some(format!("{} has an empty asset id", slice.owner_key));
            }
            if asset.quantity == 0 {
                return Some(format!("{} asset {} has zero quantity", slice.owner_key, asset.asset_id));
            }
        }
    }
    None
}
