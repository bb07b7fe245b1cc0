use crate::entry::{Entry, EntrySet};
use crate::MigrateError;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const SCHEMA_VERSION: u32 = 2;

/// Applied quantity recorded for completions carried over from schemas that
/// only stored "done". Clamped to the requested quantity by `reconcile`.
pub const COMPLETE: u64 = u64::MAX;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One execution attempt of one batch. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAttempt {
    pub batch_index: u64,
    pub entries: Vec<Entry>,
    pub success: bool,
    pub attempt_timestamp: u64,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An irreducible batch that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBatch {
    pub batch_index: u64,
    pub entries: Vec<Entry>,
    pub error: String,
    pub timestamp: u64,
    pub retry_count: u32,
    /// Set when an operator re-drives failed entries; the log line stays.
    #[serde(default)]
    pub resolved: bool,
}

/// Durable migration progress.
///
/// `processed` maps owner -> asset -> quantity already applied, so a
/// fungible entry split across several successful batches is tracked
/// exactly and never over-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub version: u32,
    #[serde(default)]
    pub job: String,
    pub start_time: u64,
    pub last_update_time: u64,
    #[serde(default)]
    pub next_batch_index: u64,
    #[serde(default)]
    pub processed: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub failed_batches: Vec<FailedBatch>,
    #[serde(default)]
    pub batch_details: Vec<BatchAttempt>,
    /// Asset ids an older run recorded as done without naming the owner.
    /// `reconcile` resolves them against the entry source.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub completed_asset_ids: BTreeSet<String>,
}

impl ProgressRecord {
    pub fn new(job: &str) -> Self {
        let now = now_millis();
        Self {
            version: SCHEMA_VERSION,
            job: job.to_string(),
            start_time: now,
            last_update_time: now,
            next_batch_index: 0,
            processed: BTreeMap::new(),
            failed_batches: Vec::new(),
            batch_details: Vec::new(),
            completed_asset_ids: BTreeSet::new(),
        }
    }

    /// Parse any known progress shape, upgrading older ones in memory.
    /// Returns the record and the shape it was upgraded from, if any.
    pub fn from_json(value: Value, job: &str) -> Result<(Self, Option<&'static str>), MigrateError> {
        migrate(value, job)
    }

    pub fn applied(&self, owner: &str, asset: &str) -> u64 {
        self.processed
            .get(owner)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or(0)
    }

    /// Allocate the next audit index for a batch.
    pub fn allocate_batch_index(&mut self) -> u64 {
        let idx = self.next_batch_index;
        self.next_batch_index += 1;
        idx
    }

    /// Mark a successful batch's entries as applied. Each entry adds its
    /// quantity, capped at the quantity requested by `source`.
    pub fn record_applied(&mut self, entries: &[Entry], source: &EntrySet) {
        for e in entries {
            let requested = source.quantity(&e.owner_key, &e.asset_id);
            let slot = self
                .processed
                .entry(e.owner_key.clone())
                .or_default()
                .entry(e.asset_id.clone())
                .or_insert(0);
            let next = slot.saturating_add(e.quantity);
            *slot = if requested > 0 { next.min(requested) } else { next };
        }
    }

    pub fn record_attempt(&mut self, attempt: BatchAttempt) {
        self.batch_details.push(attempt);
    }

    pub fn record_failure(&mut self, failed: FailedBatch) {
        self.failed_batches.push(failed);
    }

    /// `(owner, asset)` pairs of unresolved permanent failures.
    pub fn failed_set(&self) -> FxHashSet<(String, String)> {
        self.failed_batches
            .iter()
            .filter(|f| !f.resolved)
            .flat_map(|f| f.entries.iter())
            .map(|e| (e.owner_key.clone(), e.asset_id.clone()))
            .collect()
    }

    pub fn unresolved_failures(&self) -> impl Iterator<Item = &FailedBatch> {
        self.failed_batches.iter().filter(|f| !f.resolved)
    }

    /// Release every permanently failed entry back into planning.
    pub fn clear_failures(&mut self) -> usize {
        let mut cleared = 0;
        for f in self.failed_batches.iter_mut().filter(|f| !f.resolved) {
            f.resolved = true;
            cleared += 1;
        }
        cleared
    }

    /// Clamp applied quantities to what the entry source requests. Legacy
    /// boolean completions become exact quantities here, and owner-less
    /// completed ids mark every source entry carrying that id as applied.
    pub fn reconcile(&mut self, source: &EntrySet) {
        if !self.completed_asset_ids.is_empty() {
            for e in source.entries().filter(|e| self.completed_asset_ids.contains(&e.asset_id)) {
                let slot = self
                    .processed
                    .entry(e.owner_key)
                    .or_default()
                    .entry(e.asset_id)
                    .or_insert(0);
                *slot = (*slot).max(e.quantity);
            }
        }
        for (owner, assets) in self.processed.iter_mut() {
            for (asset, applied) in assets.iter_mut() {
                let requested = source.quantity(owner, asset);
                if requested > 0 && *applied > requested {
                    *applied = requested;
                }
            }
        }
    }

    /// Fold owner keys that differ only by case into their lower-case
    /// form, keeping the larger applied quantity per asset.
    pub fn lowercase_owners(&mut self) {
        if self.processed.keys().all(|k| *k == k.to_lowercase()) {
            return;
        }
        let mut merged: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for (owner, assets) in std::mem::take(&mut self.processed) {
            let slot = merged.entry(owner.to_lowercase()).or_default();
            for (asset, applied) in assets {
                let current = slot.entry(asset).or_insert(0);
                *current = (*current).max(applied);
            }
        }
        self.processed = merged;
    }

    pub fn touch(&mut self) {
        self.last_update_time = now_millis();
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyAddressRecord {
    token_ids: Vec<Value>,
    item_ids: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyItemBalance {
    #[serde(alias = "tokenId", alias = "assetId")]
    item_id: Value,
    #[serde(default = "one")]
    balance: u64,
}

fn one() -> u64 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyBatchDetail {
    #[serde(default)]
    batch_index: u64,
    #[serde(default)]
    owners_in_batch: Vec<String>,
    #[serde(default)]
    item_balances_in_batch: Vec<Vec<LegacyItemBalance>>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    attempt_timestamp: u64,
}

/// `minted` holds bare ids for identity assets and `{tokenId, balance}`
/// records for balances.
#[derive(Deserialize, Default)]
#[serde(default)]
struct LegacySafeRecord {
    minted: Vec<LegacyMinted>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyMinted {
    Balance(LegacyItemBalance),
    Id(Value),
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn start_time_of(obj: &serde_json::Map<String, Value>) -> u64 {
    obj.get("startTime").and_then(Value::as_u64).unwrap_or_else(now_millis)
}

fn mark_complete(record: &mut ProgressRecord, owner: &str, asset: String, quantity: u64) {
    let slot = record
        .processed
        .entry(owner.to_string())
        .or_default()
        .entry(asset)
        .or_insert(0);
    *slot = slot.saturating_add(quantity);
}

/// Owner-less ids, kept until `reconcile` can match them to entries.
fn mark_ids_complete(record: &mut ProgressRecord, field: &str, ids: &Value) -> Result<(), MigrateError> {
    let ids: Vec<Value> =
        serde_json::from_value(ids.clone()).map_err(|e| MigrateError::Persistence(format!("{}: {}", field, e)))?;
    record
        .completed_asset_ids
        .extend(ids.iter().filter_map(id_string));
    Ok(())
}

fn warn_unattributed(obj: &serde_json::Map<String, Value>, field: &str) {
    let count = match obj.get(field) {
        Some(Value::Array(items)) => items.len(),
        Some(Value::Object(items)) => items.values().filter_map(Value::as_array).map(Vec::len).sum(),
        _ => 0,
    };
    if count > 0 {
        warn!(field, count, "legacy failures carry no entry identity; they will be re-planned");
    }
}

const SAFE_SECTIONS: [&str; 3] = ["aavegotchis", "wearables", "forgeItems"];

fn migrate(value: Value, job: &str) -> Result<(ProgressRecord, Option<&'static str>), MigrateError> {
    // The oldest scripts wrote a bare list of completed ids, `[]` when fresh.
    if let Value::Array(items) = &value {
        let mut record = ProgressRecord::new(job);
        if items.is_empty() {
            return Ok((record, Some("empty-list")));
        }
        mark_ids_complete(&mut record, "completed id list", &value)?;
        return Ok((record, Some("id-list")));
    }

    let Value::Object(obj) = &value else {
        return Err(MigrateError::Persistence("progress file is not a JSON object".to_string()));
    };

    if let Some(version) = obj.get("version").and_then(Value::as_u64) {
        if version > SCHEMA_VERSION as u64 {
            return Err(MigrateError::Persistence(format!(
                "progress schema v{} is newer than supported v{}",
                version, SCHEMA_VERSION
            )));
        }
        if version == SCHEMA_VERSION as u64 {
            let record: ProgressRecord = serde_json::from_value(value.clone())
                .map_err(|e| MigrateError::Persistence(format!("corrupt progress record: {}", e)))?;
            return Ok((record, None));
        }
    }

    let mut record = ProgressRecord::new(job);
    record.start_time = start_time_of(obj);

    if let Some(Value::Object(owners)) = obj.get("processedOwnerItems") {
        for (owner, ids) in owners {
            let ids: Vec<Value> = serde_json::from_value(ids.clone())
                .map_err(|e| MigrateError::Persistence(format!("processedOwnerItems[{}]: {}", owner, e)))?;
            for id in ids.iter().filter_map(id_string) {
                mark_complete(&mut record, owner, id, COMPLETE);
            }
        }
        if let Some(details) = obj.get("batchDetails") {
            let details: Vec<LegacyBatchDetail> = serde_json::from_value(details.clone())
                .map_err(|e| MigrateError::Persistence(format!("batchDetails: {}", e)))?;
            for d in details {
                let entries = d
                    .owners_in_batch
                    .iter()
                    .zip(d.item_balances_in_batch.iter())
                    .flat_map(|(owner, balances)| {
                        balances.iter().filter_map(move |b| {
                            id_string(&b.item_id).map(|id| Entry::new(owner.clone(), id, b.balance))
                        })
                    })
                    .collect();
                record.next_batch_index = record.next_batch_index.max(d.batch_index + 1);
                record.record_attempt(BatchAttempt {
                    batch_index: d.batch_index,
                    entries,
                    success: d.success,
                    attempt_timestamp: d.attempt_timestamp,
                    attempt: 0,
                    error: None,
                });
            }
        }
        return Ok((record, Some("v1-owner-items")));
    }

    if let Some(Value::Object(owners)) = obj.get("processedAddresses") {
        for (owner, entry) in owners {
            let legacy: LegacyAddressRecord = serde_json::from_value(entry.clone())
                .map_err(|e| MigrateError::Persistence(format!("processedAddresses[{}]: {}", owner, e)))?;
            for id in legacy.token_ids.iter().chain(legacy.item_ids.iter()).filter_map(id_string) {
                mark_complete(&mut record, owner, id, COMPLETE);
            }
        }
        warn_unattributed(obj, "failedBatches");
        return Ok((record, Some("v0-processed-addresses")));
    }

    if SAFE_SECTIONS.iter().any(|s| obj.get(*s).is_some_and(Value::is_object)) {
        for section in SAFE_SECTIONS {
            let Some(Value::Object(safes)) = obj.get(section) else {
                continue;
            };
            for (owner, entry) in safes {
                let legacy: LegacySafeRecord = serde_json::from_value(entry.clone())
                    .map_err(|e| MigrateError::Persistence(format!("{}[{}]: {}", section, owner, e)))?;
                for minted in legacy.minted {
                    let (id, quantity) = match minted {
                        LegacyMinted::Balance(b) => (id_string(&b.item_id), b.balance),
                        LegacyMinted::Id(id) => (id_string(&id), COMPLETE),
                    };
                    if let Some(id) = id {
                        mark_complete(&mut record, owner, id, quantity);
                    }
                }
            }
        }
        warn_unattributed(obj, "failedMints");
        return Ok((record, Some("safe-mints")));
    }

    for (field, shape) in [
        ("processedEntryIds", "entry-id-list"),
        ("processedTokenIds", "token-id-list"),
        ("processedParentTokenIds", "parent-token-id-list"),
    ] {
        if let Some(ids) = obj.get(field) {
            mark_ids_complete(&mut record, field, ids)?;
            warn_unattributed(obj, "failedBatchDetails");
            warn_unattributed(obj, "failedBatches");
            warn_unattributed(obj, "failedParentTokenIdBatchesInLastRun");
            return Ok((record, Some(shape)));
        }
    }

    if obj.is_empty() {
        return Ok((record, Some("empty-object")));
    }

    Err(MigrateError::Persistence("unrecognized progress file shape".to_string()))
}

/// Log an upgrade once, at load time.
pub fn log_upgrade(from: Option<&'static str>, record: &ProgressRecord) {
    if let Some(shape) = from {
        info!(
            from = shape,
            to = SCHEMA_VERSION,
            owners = record.processed.len(),
            unattributed_ids = record.completed_asset_ids.len(),
            "upgraded progress record"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> EntrySet {
        vec![
            Entry::new("0xa", "1", 5),
            Entry::new("0xa", "2", 3),
            Entry::new("0xb", "3", 1),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_record_applied_caps_at_requested() {
        let mut record = ProgressRecord::new("job");
        let src = source();
        record.record_applied(&[Entry::new("0xa", "1", 3)], &src);
        record.record_applied(&[Entry::new("0xa", "1", 3)], &src);
        assert_eq!(record.applied("0xa", "1"), 5);
    }

    #[test]
    fn test_current_schema_round_trips() {
        let mut record = ProgressRecord::new("job");
        record.record_applied(&[Entry::new("0xb", "3", 1)], &source());
        let value = serde_json::to_value(&record).unwrap();
        let (loaded, from) = ProgressRecord::from_json(value, "job").unwrap();
        assert_eq!(loaded, record);
        assert!(from.is_none());
    }

    #[test]
    fn test_newer_schema_rejected() {
        let err = ProgressRecord::from_json(json!({"version": 99}), "job").unwrap_err();
        assert!(matches!(err, MigrateError::Persistence(_)));
    }

    #[test]
    fn test_migrate_processed_addresses() {
        let legacy = json!({
            "totalProcessed": 2,
            "lastBatchIndex": 2,
            "failedBatches": [1],
            "startTime": 1000,
            "processedAddresses": {
                "0xA": {"tokenIds": ["1", "2"], "timestamp": 5}
            }
        });
        let (mut record, from) = ProgressRecord::from_json(legacy, "job").unwrap();
        assert_eq!(from, Some("v0-processed-addresses"));
        assert_eq!(record.start_time, 1000);
        assert_eq!(record.applied("0xA", "1"), COMPLETE);

        record.lowercase_owners();
        assert_eq!(record.applied("0xa", "1"), COMPLETE);

        record.reconcile(&source());
        assert_eq!(record.applied("0xa", "1"), 5);
        assert_eq!(record.applied("0xa", "2"), 3);
    }

    #[test]
    fn test_migrate_owner_items_with_details() {
        let legacy = json!({
            "startTime": 7,
            "lastProcessedBatchIndexInLastRun": 0,
            "failedBatchIndexesInLastRun": [],
            "processedOwnerItems": {"0xb": ["3"]},
            "batchDetails": [{
                "batchIndex": 0,
                "ownersInBatch": ["0xb"],
                "itemBalancesInBatch": [[{"itemId": "3", "balance": 1}]],
                "success": true,
                "attemptTimestamp": 9
            }]
        });
        let (record, from) = ProgressRecord::from_json(legacy, "job").unwrap();
        assert_eq!(from, Some("v1-owner-items"));
        assert_eq!(record.batch_details.len(), 1);
        assert_eq!(record.batch_details[0].entries, vec![Entry::new("0xb", "3", 1)]);
        assert_eq!(record.next_batch_index, 1);
        assert!(record.applied("0xb", "3") > 0);
    }

    #[test]
    fn test_migrate_entry_id_list_resolves_against_source() {
        let legacy = json!({
            "totalEntriesInSource": 3,
            "processedEntryIds": ["1", "3"],
            "lastAttemptedBatchIndex": 1,
            "lastSuccessfullyProcessedBatchIndex": 0,
            "failedBatchDetails": [{
                "batchIndex": 1,
                "attemptTimestamp": 12,
                "success": false,
                "error": "reverted",
                "entryIdsInBatch": ["2"]
            }],
            "currentRunFailedBatchIndexes": [1],
            "startTime": 10,
            "completed": false,
            "completedAt": null
        });
        let (mut record, from) = ProgressRecord::from_json(legacy, "job").unwrap();
        assert_eq!(from, Some("entry-id-list"));
        assert_eq!(record.start_time, 10);
        assert!(record.processed.is_empty());

        record.reconcile(&source());
        assert_eq!(record.applied("0xa", "1"), 5);
        assert_eq!(record.applied("0xb", "3"), 1);
        assert_eq!(record.applied("0xa", "2"), 0);
    }

    #[test]
    fn test_migrate_token_id_shapes() {
        let object = json!({
            "processedCount": 2,
            "failedBatches": [],
            "startTime": 3,
            "processedTokenIds": ["2", "3"]
        });
        let (mut record, from) = ProgressRecord::from_json(object, "job").unwrap();
        assert_eq!(from, Some("token-id-list"));
        record.reconcile(&source());
        assert_eq!(record.applied("0xa", "2"), 3);
        assert_eq!(record.applied("0xb", "3"), 1);

        // The same script persisted just the id array between batches.
        let (mut record, from) = ProgressRecord::from_json(json!(["2", "3"]), "job").unwrap();
        assert_eq!(from, Some("id-list"));
        record.reconcile(&source());
        assert_eq!(record.applied("0xa", "2"), 3);
        assert_eq!(record.applied("0xa", "1"), 0);
    }

    #[test]
    fn test_migrate_parent_token_ids() {
        let legacy = json!({
            "startTime": 4,
            "processedParentTokenIds": ["1"],
            "failedParentTokenIdBatchesInLastRun": [],
            "lastProcessedParentTokenIdBatchIndexInLastRun": 0,
            "batchAttemptDetails": [{
                "batchIndex": 0,
                "parentTokenIdsAttempted": ["1"],
                "success": true,
                "attemptTimestamp": 5
            }]
        });
        let (mut record, from) = ProgressRecord::from_json(legacy, "job").unwrap();
        assert_eq!(from, Some("parent-token-id-list"));
        assert!(record.completed_asset_ids.contains("1"));
        record.reconcile(&source());
        assert_eq!(record.applied("0xa", "1"), 5);
    }

    #[test]
    fn test_migrate_safe_mints() {
        let legacy = json!({
            "aavegotchis": {"0xb": {"minted": ["3"], "timestamp": 1}},
            "wearables": {"0xa": {"minted": [{"tokenId": "2", "balance": 2}], "timestamp": 2}},
            "forgeItems": {},
            "failedMints": {"aavegotchis": [], "wearables": ["0xc"], "forgeItems": []},
            "lastProcessedIndex": 2,
            "startTime": 8
        });
        let (mut record, from) = ProgressRecord::from_json(legacy, "job").unwrap();
        assert_eq!(from, Some("safe-mints"));
        assert_eq!(record.applied("0xa", "2"), 2);

        record.reconcile(&source());
        assert_eq!(record.applied("0xb", "3"), 1);
        assert_eq!(record.applied("0xa", "2"), 2);
    }

    #[test]
    fn test_unresolved_ids_survive_a_save() {
        let (record, _) = ProgressRecord::from_json(json!({"processedEntryIds": ["99"]}), "job").unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["completedAssetIds"], json!(["99"]));
        let (loaded, from) = ProgressRecord::from_json(value, "job").unwrap();
        assert!(from.is_none());
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_unknown_shape_rejected() {
        let err = ProgressRecord::from_json(json!({"somethingElse": 1}), "job").unwrap_err();
        assert!(matches!(err, MigrateError::Persistence(_)));
    }

    #[test]
    fn test_empty_list_is_fresh() {
        let (record, _) = ProgressRecord::from_json(json!([]), "job").unwrap();
        assert!(record.processed.is_empty());
    }

    #[test]
    fn test_clear_failures_releases_entries() {
        let mut record = ProgressRecord::new("job");
        record.record_failure(FailedBatch {
            batch_index: 3,
            entries: vec![Entry::new("0xa", "2", 3)],
            error: "rejected".to_string(),
            timestamp: 1,
            retry_count: 3,
            resolved: false,
        });
        assert!(record.failed_set().contains(&("0xa".to_string(), "2".to_string())));
        assert_eq!(record.clear_failures(), 1);
        assert!(record.failed_set().is_empty());
        assert_eq!(record.failed_batches.len(), 1);
    }
}
