use crate::entry::{AssetBalance, Entry, EntrySet};
use crate::progress::ProgressRecord;
use crate::MigrateError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// How outstanding entries are packed into capacity-bounded batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum PackingPolicy {
    /// At most `max_owners` owners per batch, each with all of its
    /// remaining entries.
    OwnerCount { max_owners: usize },
    /// At most `max_entries` `(owner, asset)` entries per batch, filled
    /// owner by owner so that large owners spill into later batches.
    EntryCount { max_entries: usize },
    /// At most `max_units` of summed quantity per batch. An entry larger
    /// than the room left is applied in parts across batches.
    UnitCount { max_units: u64 },
}

impl PackingPolicy {
    pub fn capacity(&self) -> u64 {
        match *self {
            PackingPolicy::OwnerCount { max_owners } => max_owners as u64,
            PackingPolicy::EntryCount { max_entries } => max_entries as u64,
            PackingPolicy::UnitCount { max_units } => max_units,
        }
    }

    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.capacity() == 0 {
            return Err(MigrateError::Input(format!("{} needs a capacity above zero", self)));
        }
        Ok(())
    }
}

impl Default for PackingPolicy {
    fn default() -> Self {
        PackingPolicy::EntryCount { max_entries: 300 }
    }
}

impl fmt::Display for PackingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackingPolicy::OwnerCount { max_owners } => write!(f, "owner-count({})", max_owners),
            PackingPolicy::EntryCount { max_entries } => write!(f, "entry-count({})", max_entries),
            PackingPolicy::UnitCount { max_units } => write!(f, "unit-count({})", max_units),
        }
    }
}

/// The part of one owner's holdings carried by a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSlice {
    pub owner_key: String,
    pub assets: Vec<AssetBalance>,
}

/// Entries submitted together as one ledger write, grouped by owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub owners: Vec<OwnerSlice>,
}

impl Batch {
    /// Group entries by owner, keeping first-seen owner order.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        let mut owners: Vec<OwnerSlice> = Vec::new();
        for e in entries {
            let balance = AssetBalance {
                asset_id: e.asset_id,
                quantity: e.quantity,
            };
            match owners.iter_mut().find(|s| s.owner_key == e.owner_key) {
                Some(slice) => slice.assets.push(balance),
                None => owners.push(OwnerSlice {
                    owner_key: e.owner_key,
                    assets: vec![balance],
                }),
            }
        }
        Self { owners }
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.owners
            .iter()
            .flat_map(|s| {
                s.assets
                    .iter()
                    .map(move |a| Entry::new(s.owner_key.clone(), a.asset_id.clone(), a.quantity))
            })
            .collect()
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    pub fn entry_count(&self) -> usize {
        self.owners.iter().map(|s| s.assets.len()).sum()
    }

    pub fn total_quantity(&self) -> u64 {
        self.owners
            .iter()
            .flat_map(|s| s.assets.iter())
            .fold(0u64, |total, a| total.saturating_add(a.quantity))
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Split into two non-empty halves: by owner when several owners are
    /// present, otherwise by entry within the single owner. A single-entry
    /// batch cannot be split.
    pub fn bisect(&self) -> Option<(Batch, Batch)> {
        if self.owners.len() > 1 {
            let mid = self.owners.len() / 2;
            let (left, right) = self.owners.split_at(mid);
            return Some((Batch { owners: left.to_vec() }, Batch { owners: right.to_vec() }));
        }
        let slice = self.owners.first()?;
        if slice.assets.len() < 2 {
            return None;
        }
        let mid = slice.assets.len() / 2;
        let (left, right) = slice.assets.split_at(mid);
        Some((
            Batch {
                owners: vec![OwnerSlice { owner_key: slice.owner_key.clone(), assets: left.to_vec() }],
            },
            Batch {
                owners: vec![OwnerSlice { owner_key: slice.owner_key.clone(), assets: right.to_vec() }],
            },
        ))
    }

    /// Short human description used in logs: first owner and asset ids.
    pub fn describe(&self) -> String {
        self.owners
            .iter()
            .map(|s| format!("{}[{}]", s.owner_key, s.assets.iter().map(|a| format!("{}x{}", a.asset_id, a.quantity)).join(",")))
            .join(" ")
    }
}

/// Entries still to apply: source quantity minus applied quantity, with
/// unresolved permanent failures left out. Owners with nothing left are
/// dropped.
pub fn outstanding(source: &EntrySet, record: &ProgressRecord) -> Vec<OwnerSlice> {
    let failed = record.failed_set();
    source
        .owners()
        .filter_map(|(owner, balances)| {
            let assets: Vec<AssetBalance> = balances
                .iter()
                .filter(|b| !failed.contains(&(owner.to_string(), b.asset_id.clone())))
                .filter_map(|b| {
                    let remaining = b.quantity.saturating_sub(record.applied(owner, &b.asset_id));
                    (remaining > 0).then(|| AssetBalance {
                        asset_id: b.asset_id.clone(),
                        quantity: remaining,
                    })
                })
                .collect();
            (!assets.is_empty()).then(|| OwnerSlice {
                owner_key: owner.to_string(),
                assets,
            })
        })
        .collect()
}

/// Plan the outstanding work into batches under `policy`.
pub fn plan(source: &EntrySet, record: &ProgressRecord, policy: PackingPolicy) -> Result<Vec<Batch>, MigrateError> {
    policy.validate()?;
    let remaining = outstanding(source, record);
    Ok(pack(remaining, policy))
}

/// Partition owner slices into batches. Every entry lands in exactly one
/// batch, except under `UnitCount` where an oversized entry is cut into
/// parts whose quantities sum to the original.
pub fn pack(remaining: Vec<OwnerSlice>, policy: PackingPolicy) -> Vec<Batch> {
    match policy {
        PackingPolicy::OwnerCount { max_owners } => pack_by_owner(remaining, max_owners),
        PackingPolicy::EntryCount { max_entries } => pack_round_robin(remaining, max_entries as u64, false),
        PackingPolicy::UnitCount { max_units } => pack_round_robin(remaining, max_units, true),
    }
}

fn pack_by_owner(remaining: Vec<OwnerSlice>, max_owners: usize) -> Vec<Batch> {
    remaining
        .into_iter()
        .chunks(max_owners.max(1))
        .into_iter()
        .map(|chunk| Batch { owners: chunk.collect() })
        .collect()
}

/// Per-owner read position during round-robin packing.
struct Cursor {
    owner_key: String,
    pending: VecDeque<AssetBalance>,
}

fn pack_round_robin(remaining: Vec<OwnerSlice>, capacity: u64, by_units: bool) -> Vec<Batch> {
    let capacity = capacity.max(1);
    let mut cursors: Vec<Cursor> = remaining
        .into_iter()
        .map(|s| Cursor {
            owner_key: s.owner_key,
            pending: s.assets.into(),
        })
        .collect();
    let mut batches = Vec::new();

    while cursors.iter().any(|c| !c.pending.is_empty()) {
        let mut room = capacity;
        let mut owners = Vec::new();

        // One round: each owner in turn contributes what still fits.
        for cursor in cursors.iter_mut().filter(|c| !c.pending.is_empty()) {
            if room == 0 {
                break;
            }
            let mut taken = Vec::new();
            while room > 0 {
                let Some(front) = cursor.pending.front_mut() else {
                    break;
                };
                if !by_units {
                    taken.extend(cursor.pending.pop_front());
                    room -= 1;
                } else if front.quantity <= room {
                    room -= front.quantity;
                    taken.extend(cursor.pending.pop_front());
                } else {
                    taken.push(AssetBalance {
                        asset_id: front.asset_id.clone(),
                        quantity: room,
                    });
                    front.quantity -= room;
                    room = 0;
                }
            }
            if !taken.is_empty() {
                owners.push(OwnerSlice {
                    owner_key: cursor.owner_key.clone(),
                    assets: taken,
                });
            }
        }

        batches.push(Batch { owners });
        cursors.retain(|c| !c.pending.is_empty());
    }
    batches
}
