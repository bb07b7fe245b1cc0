use crate::entry::EntrySet;
use crate::MigrateError;
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const ID_KEYS: [&str; 3] = ["assetId", "tokenId", "itemId"];
const QUANTITY_KEYS: [&str; 2] = ["balance", "quantity"];

/// Options applied while normalizing snapshots
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Trim and lower-case owner keys so checksum and plain addresses merge
    pub normalize_owner_case: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            normalize_owner_case: true,
        }
    }
}

/// Totals reported to the operator after loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStats {
    pub files: usize,
    pub owners: usize,
    pub entries: usize,
    pub total_quantity: u64,
}

/// Loads one or more snapshot files into a single normalized entry set.
///
/// Two snapshot shapes are accepted, and may be mixed per owner:
/// `{owner: [{"assetId": "1", "balance": 3}, ...]}` for balances and
/// `{owner: ["1", "2"]}` for identity assets with an implicit quantity of 1.
/// Balances for the same `(owner, asset)` are summed across all files.
/// An identity asset listed twice for one owner is an input error, since it
/// cannot be held twice.
pub struct EntrySource {
    paths: Vec<PathBuf>,
    options: SourceOptions,
}

impl EntrySource {
    pub fn new(paths: Vec<PathBuf>, options: SourceOptions) -> Self {
        Self { paths, options }
    }

    /// Read every snapshot. Any missing or malformed file aborts the load.
    pub fn load(&self) -> Result<(EntrySet, SourceStats), MigrateError> {
        if self.paths.is_empty() {
            return Err(MigrateError::Input("no snapshot files given".to_string()));
        }

        let mut set = EntrySet::new();
        let mut identities = FxHashSet::default();

        for path in &self.paths {
            let text = read_snapshot(path)?;
            parse_snapshot_into(&text, &path.display().to_string(), &self.options, &mut set, &mut identities)?;
            info!(file = %path.display(), "loaded snapshot");
        }

        let stats = SourceStats {
            files: self.paths.len(),
            owners: set.owner_count(),
            entries: set.entry_count(),
            total_quantity: set.total_quantity(),
        };
        info!(
            owners = stats.owners,
            entries = stats.entries,
            total_quantity = stats.total_quantity,
            "entry source ready"
        );
        Ok((set, stats))
    }
}

fn read_snapshot(path: &Path) -> Result<String, MigrateError> {
    fs::read_to_string(path)
        .map_err(|e| MigrateError::Input(format!("cannot read snapshot {}: {}", path.display(), e)))
}

/// Parse a single snapshot document into a fresh entry set.
pub fn parse_snapshot(text: &str, origin: &str, options: &SourceOptions) -> Result<EntrySet, MigrateError> {
    let mut set = EntrySet::new();
    let mut identities = FxHashSet::default();
    parse_snapshot_into(text, origin, options, &mut set, &mut identities)?;
    Ok(set)
}

fn parse_snapshot_into(
    text: &str,
    origin: &str,
    options: &SourceOptions,
    set: &mut EntrySet,
    identities: &mut FxHashSet<(String, String)>,
) -> Result<(), MigrateError> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| MigrateError::Input(format!("{}: invalid JSON: {}", origin, e)))?;

    let Value::Object(owners) = doc else {
        return Err(MigrateError::Input(format!("{}: top level must be an object of owners", origin)));
    };

    for (raw_owner, holdings) in owners {
        let owner = normalize_owner(&raw_owner, options);
        if owner.is_empty() {
            return Err(MigrateError::Input(format!("{}: empty owner key", origin)));
        }
        let Value::Array(items) = holdings else {
            return Err(MigrateError::Input(format!("{}: holdings of {} must be an array", origin, raw_owner)));
        };

        for (i, item) in items.iter().enumerate() {
            match item {
                Value::Object(fields) => {
                    let asset = ID_KEYS
                        .iter()
                        .find_map(|k| fields.get(*k))
                        .ok_or_else(|| MigrateError::Input(format!("{}: {}[{}] has no asset id", origin, raw_owner, i)))
                        .and_then(|v| asset_id(v, origin, &raw_owner, i))?;
                    let quantity = QUANTITY_KEYS
                        .iter()
                        .find_map(|k| fields.get(*k))
                        .ok_or_else(|| MigrateError::Input(format!("{}: {}[{}] has no balance", origin, raw_owner, i)))
                        .and_then(|v| balance(v, origin, &raw_owner, i))?;
                    set.insert(&owner, &asset, quantity);
                }
                other => {
                    let asset = asset_id(other, origin, &raw_owner, i)?;
                    if !identities.insert((owner.clone(), asset.clone())) {
                        return Err(MigrateError::Input(format!(
                            "{}: identity asset {} listed twice for {}",
                            origin, asset, owner
                        )));
                    }
                    set.insert(&owner, &asset, 1);
                }
            }
        }
    }
    Ok(())
}

fn normalize_owner(raw: &str, options: &SourceOptions) -> String {
    let trimmed = raw.trim();
    if options.normalize_owner_case {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

fn asset_id(value: &Value, origin: &str, owner: &str, i: usize) -> Result<String, MigrateError> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => {
            return Err(MigrateError::Input(format!(
                "{}: {}[{}] asset id must be a string or non-negative integer",
                origin, owner, i
            )));
        }
    };
    if id.is_empty() {
        return Err(MigrateError::Input(format!("{}: {}[{}] has an empty asset id", origin, owner, i)));
    }
    Ok(id)
}

fn balance(value: &Value, origin: &str, owner: &str, i: usize) -> Result<u64, MigrateError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        MigrateError::Input(format!(
            "{}: {}[{}] balance must be a non-negative integer",
            origin, owner, i
        ))
    })
}
