use crate::controller::RetryPolicy;
use crate::planner::PackingPolicy;
use crate::source::SourceOptions;
use crate::store::ProgressStore;
use crate::MigrateError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine knobs passed in at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub packing: PackingPolicy,
    pub max_retries: u32,
    #[serde(rename = "retryDelayMs", with = "millis")]
    pub retry_delay: Duration,
    #[serde(rename = "operationTimeoutMs", with = "millis")]
    pub operation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            packing: PackingPolicy::default(),
            max_retries: 3,
            retry_delay: Duration::from_millis(2_000),
            operation_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        }
    }

    pub fn validate(&self) -> Result<(), MigrateError> {
        self.packing.validate()?;
        if self.operation_timeout.is_zero() {
            return Err(MigrateError::Input("operation timeout must be above zero".to_string()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// One migration job as described by a JSON job file.
///
/// ```json
/// {
///   "job": "wearables",
///   "snapshots": ["snapshots/wearables.json"],
///   "progress": "state/wearables-progress.json",
///   "ledger": "journal:state/wearables.jsonl",
///   "engine": {"packing": {"policy": "entry-count", "max_entries": 300}}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    pub job: String,
    pub snapshots: Vec<PathBuf>,
    pub progress: PathBuf,
    pub ledger: Option<String>,
    pub engine: EngineConfig,
    pub normalize_owner_case: bool,
    pub retry_failed: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job: "migration".to_string(),
            snapshots: Vec::new(),
            progress: PathBuf::from("migration-progress.json"),
            ledger: None,
            engine: EngineConfig::default(),
            normalize_owner_case: true,
            retry_failed: false,
        }
    }
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MigrateError::Input(format!("cannot read config {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, MigrateError> {
        serde_json::from_str(text).map_err(|e| MigrateError::Input(format!("invalid job config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.job.trim().is_empty() {
            return Err(MigrateError::Input("job name is empty".to_string()));
        }
        if self.snapshots.is_empty() {
            return Err(MigrateError::Input("no snapshot files configured".to_string()));
        }
        self.engine.validate()
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            normalize_owner_case: self.normalize_owner_case,
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        ProgressStore::lock_path_for(&self.progress)
    }
}
