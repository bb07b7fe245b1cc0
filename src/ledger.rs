use crate::entry::{Entry, EntrySet};
use crate::planner::Batch;
use crate::progress::now_millis;
use crate::MigrateError;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    /// Network, congestion, temporarily unavailable. Worth retrying as-is.
    Transient,
    /// No terminal state within the operation timeout.
    Timeout,
    /// The ledger refused the batch content.
    Rejected,
    /// The ledger refused the caller (bad credentials, no permission).
    /// No batch can succeed until an operator intervenes.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: LedgerErrorKind::Transient, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: LedgerErrorKind::Timeout, message: message.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { kind: LedgerErrorKind::Rejected, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: LedgerErrorKind::Fatal, message: message.into() }
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LedgerErrorKind::Transient => "transient",
            LedgerErrorKind::Timeout => "timeout",
            LedgerErrorKind::Rejected => "rejected",
            LedgerErrorKind::Fatal => "fatal",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}

/// Confirmation of a terminal successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub reference: String,
}

/// The external system entries are migrated into.
///
/// `apply` performs exactly one write for the whole batch and blocks until
/// it is confirmed, rejected, or `timeout` elapses. Writes are ordered by
/// the ledger (e.g. by account nonce), so callers never overlap them.
pub trait Ledger {
    fn name(&self) -> &str;

    fn apply(&mut self, batch: &Batch, timeout: Duration) -> Result<Receipt, LedgerError>;
}

impl<L: Ledger + ?Sized> Ledger for Box<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn apply(&mut self, batch: &Batch, timeout: Duration) -> Result<Receipt, LedgerError> {
        (**self).apply(batch, timeout)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    reference: String,
    timestamp: u64,
    entries: Vec<Entry>,
}

/// Append-only JSON-lines ledger for rehearsals.
///
/// Reloads its own journal on open. With caps set, any write that would push
/// an `(owner, asset)` past its cap is rejected, as is any asset on the deny
/// list.
pub struct JournalLedger {
    path: PathBuf,
    caps: Option<EntrySet>,
    deny: FxHashSet<String>,
    totals: FxHashMap<(String, String), u64>,
    writes: u64,
}

impl JournalLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MigrateError> {
        let path = path.as_ref().to_path_buf();
        let mut ledger = Self {
            path,
            caps: None,
            deny: FxHashSet::default(),
            totals: FxHashMap::default(),
            writes: 0,
        };

        if ledger.path.exists() {
            let file = File::open(&ledger.path).map_err(MigrateError::Io)?;
            for (n, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(MigrateError::Io)?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: JournalLine = serde_json::from_str(&line).map_err(|e| {
                    MigrateError::Ledger(format!("{} line {}: {}", ledger.path.display(), n + 1, e))
                })?;
                ledger.absorb(&parsed.entries);
                ledger.writes += 1;
            }
        } else if let Some(parent) = ledger.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(MigrateError::Io)?;
        }
        Ok(ledger)
    }

    pub fn with_caps(mut self, caps: EntrySet) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn with_deny<I: IntoIterator<Item = String>>(mut self, assets: I) -> Self {
        self.deny.extend(assets);
        self
    }

    /// Total quantity journaled for one `(owner, asset)`.
    pub fn applied(&self, owner: &str, asset: &str) -> u64 {
        self.totals
            .get(&(owner.to_string(), asset.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn absorb(&mut self, entries: &[Entry]) {
        for e in entries {
            let total = self
                .totals
                .entry((e.owner_key.clone(), e.asset_id.clone()))
                .or_insert(0);
            *total = total.saturating_add(e.quantity);
        }
    }

    fn check(&self, entries: &[Entry]) -> Result<(), LedgerError> {
        for e in entries {
            if self.deny.contains(&e.asset_id) {
                return Err(LedgerError::rejected(format!("asset {} is not mintable", e.asset_id)));
            }
            if let Some(caps) = &self.caps {
                let cap = caps.quantity(&e.owner_key, &e.asset_id);
                let applied = self.applied(&e.owner_key, &e.asset_id);
                if applied.checked_add(e.quantity).is_none_or(|after| after > cap) {
                    return Err(LedgerError::rejected(format!(
                        "{} asset {} would exceed {} ({} already applied)",
                        e.owner_key, e.asset_id, cap, applied
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Ledger for JournalLedger {
    fn name(&self) -> &str {
        "journal"
    }

    fn apply(&mut self, batch: &Batch, _timeout: Duration) -> Result<Receipt, LedgerError> {
        let entries = batch.entries();
        self.check(&entries)?;

        let line = JournalLine {
            reference: format!("journal:{}", self.writes + 1),
            timestamp: now_millis(),
            entries,
        };
        let text = serde_json::to_string(&line).map_err(|e| LedgerError::rejected(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::transient(format!("open {}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", text)
            .and_then(|_| file.sync_all())
            .map_err(|e| LedgerError::transient(format!("append {}: {}", self.path.display(), e)))?;

        self.absorb(&line.entries);
        self.writes += 1;
        debug!(reference = %line.reference, "journaled batch");
        Ok(Receipt { reference: line.reference })
    }
}

#[cfg(feature = "http")]
pub use http::HttpLedger;

#[cfg(feature = "http")]
mod http {
    use super::{Batch, Ledger, LedgerError, Receipt};
    use crate::MigrateError;
    use reqwest::StatusCode;
    use reqwest::blocking::Client;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize, Default)]
    struct ApplyResponse {
        #[serde(default)]
        reference: Option<String>,
    }

    /// Submits each batch as a JSON POST and waits for the endpoint's
    /// terminal answer.
    ///
    /// 2xx is success. 408, 429, 5xx, connection errors and timeouts are
    /// transient. 401 and 403 are fatal. Any other status means the content
    /// was rejected.
    pub struct HttpLedger {
        endpoint: String,
        client: Client,
    }

    impl HttpLedger {
        pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, MigrateError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| MigrateError::Ledger(format!("http client: {}", e)))?;
            Ok(Self {
                endpoint: endpoint.to_string(),
                client,
            })
        }
    }

    impl Ledger for HttpLedger {
        fn name(&self) -> &str {
            "http"
        }

        fn apply(&mut self, batch: &Batch, _timeout: Duration) -> Result<Receipt, LedgerError> {
            let response = self.client.post(&self.endpoint).json(batch).send().map_err(|e| {
                if e.is_timeout() {
                    LedgerError::timeout(e.to_string())
                } else {
                    LedgerError::transient(e.to_string())
                }
            })?;

            let status = response.status();
            if status.is_success() {
                let body: ApplyResponse = response.json().unwrap_or_default();
                return Ok(Receipt {
                    reference: body.reference.unwrap_or_else(|| status.to_string()),
                });
            }

            let text = response.text().unwrap_or_default();
            Err(classify(status, format!("{}: {}", status, text.trim())))
        }
    }

    pub(super) fn classify(status: StatusCode, message: String) -> LedgerError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LedgerError::fatal(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => LedgerError::transient(message),
            s if s.is_server_error() => LedgerError::transient(message),
            _ => LedgerError::rejected(message),
        }
    }
}

/// Build a ledger from an operator target: `journal:<path>` or an
/// `http://`/`https://` endpoint.
pub fn open_ledger(target: &str, timeout: Duration) -> Result<Box<dyn Ledger>, MigrateError> {
    if let Some(path) = target.strip_prefix("journal:") {
        return Ok(Box::new(JournalLedger::open(path)?));
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        #[cfg(feature = "http")]
        {
            return Ok(Box::new(HttpLedger::new(target, timeout)?));
        }
        #[cfg(not(feature = "http"))]
        {
            let _ = timeout;
            return Err(MigrateError::Ledger("built without the http feature".to_string()));
        }
    }
    Err(MigrateError::Input(format!(
        "unknown ledger '{}': use journal:<path> or an http(s) url",
        target
    )))
}
