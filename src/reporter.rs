use crate::entry::EntrySet;
use crate::progress::{now_millis, ProgressRecord};
use rustc_hash::FxHashSet;
use std::fmt;

/// Aggregate progress derived from a record and its entry source.
///
/// Building a report reads state only; it never changes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub job: String,
    pub total_entries: usize,
    pub total_quantity: u64,
    pub processed_entries: usize,
    pub processed_quantity: u64,
    pub outstanding_entries: usize,
    pub outstanding_quantity: u64,
    pub failed_batches: usize,
    pub failed_entries: usize,
    pub batches: usize,
    pub attempts: usize,
    pub successful_attempts: usize,
    pub elapsed_ms: u64,
}

impl ProgressReport {
    pub fn from_record(record: &ProgressRecord, source: &EntrySet) -> Self {
        Self::at(record, source, now_millis())
    }

    /// Report as of `now` (milliseconds since the epoch).
    pub fn at(record: &ProgressRecord, source: &EntrySet, now: u64) -> Self {
        let failed = record.failed_set();

        let mut processed_entries = 0;
        let mut processed_quantity = 0u64;
        let mut outstanding_entries = 0;
        let mut outstanding_quantity = 0u64;
        for entry in source.entries() {
            let applied = record.applied(&entry.owner_key, &entry.asset_id).min(entry.quantity);
            processed_quantity = processed_quantity.saturating_add(applied);
            if applied == entry.quantity {
                processed_entries += 1;
            } else if !failed.contains(&(entry.owner_key.clone(), entry.asset_id.clone())) {
                outstanding_entries += 1;
                outstanding_quantity = outstanding_quantity.saturating_add(entry.quantity - applied);
            }
        }

        let batches: FxHashSet<u64> = record.batch_details.iter().map(|a| a.batch_index).collect();

        Self {
            job: record.job.clone(),
            total_entries: source.entry_count(),
            total_quantity: source.total_quantity(),
            processed_entries,
            processed_quantity,
            outstanding_entries,
            outstanding_quantity,
            failed_batches: record.unresolved_failures().count(),
            failed_entries: failed.len(),
            batches: batches.len(),
            attempts: record.batch_details.len(),
            successful_attempts: record.batch_details.iter().filter(|a| a.success).count(),
            elapsed_ms: now.saturating_sub(record.start_time),
        }
    }

    /// Successful attempts over all attempts, as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successful_attempts as f64 * 100.0 / self.attempts as f64
    }

    pub fn average_batch_ms(&self) -> u64 {
        if self.batches == 0 {
            return 0;
        }
        self.elapsed_ms / self.batches as u64
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding_entries == 0
    }

    pub fn print(&self) {
        println!("{}", self);
    }
}

fn seconds(ms: u64) -> String {
    format!("{:.1}s", ms as f64 / 1000.0)
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[migrate] ===== PROGRESS: {} =====", self.job)?;
        writeln!(
            f,
            "[migrate] Processed: {}/{} entries ({} of {} units)",
            self.processed_entries, self.total_entries, self.processed_quantity, self.total_quantity
        )?;
        writeln!(
            f,
            "[migrate] Outstanding: {} entries ({} units)",
            self.outstanding_entries, self.outstanding_quantity
        )?;
        writeln!(
            f,
            "[migrate] Failed: {} batches ({} entries)",
            self.failed_batches, self.failed_entries
        )?;
        writeln!(
            f,
            "[migrate] Attempts: {} over {} batches, success rate {:.1}%",
            self.attempts,
            self.batches,
            self.success_rate()
        )?;
        write!(
            f,
            "[migrate] Elapsed: {}, average {} per batch",
            seconds(self.elapsed_ms),
            seconds(self.average_batch_ms())
        )
    }
}
