use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One unit of migratable ownership. Uniqueness is `(owner_key, asset_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub owner_key: String,
    pub asset_id: String,
    pub quantity: u64,
}

impl Entry {
    pub fn new(owner_key: impl Into<String>, asset_id: impl Into<String>, quantity: u64) -> Self {
        Self {
            owner_key: owner_key.into(),
            asset_id: asset_id.into(),
            quantity,
        }
    }
}

/// A single asset balance held by one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset_id: String,
    pub quantity: u64,
}

/// Normalized owner -> balances mapping.
///
/// Owners iterate in key order; each owner's assets keep the order in which
/// they were first seen. Inserting an `(owner, asset)` pair that already
/// exists adds to its quantity instead of creating a second entry.
#[derive(Debug, Clone, Default)]
pub struct EntrySet {
    owners: BTreeMap<String, Vec<AssetBalance>>,
    index: FxHashMap<String, FxHashMap<String, usize>>,
}

impl EntrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `quantity` of `asset_id` to `owner_key`, aggregating duplicates.
    /// Zero quantities are ignored.
    pub fn insert(&mut self, owner_key: &str, asset_id: &str, quantity: u64) {
        if quantity == 0 {
            return;
        }
        let balances = self.owners.entry(owner_key.to_string()).or_default();
        let positions = self.index.entry(owner_key.to_string()).or_default();
        match positions.get(asset_id) {
            Some(&pos) => {
                balances[pos].quantity = balances[pos].quantity.saturating_add(quantity);
            }
            None => {
                positions.insert(asset_id.to_string(), balances.len());
                balances.push(AssetBalance {
                    asset_id: asset_id.to_string(),
                    quantity,
                });
            }
        }
    }

    /// Requested quantity for one `(owner, asset)`, zero if absent.
    pub fn quantity(&self, owner_key: &str, asset_id: &str) -> u64 {
        self.index
            .get(owner_key)
            .and_then(|positions| positions.get(asset_id))
            .and_then(|&pos| self.owners.get(owner_key).map(|b| b[pos].quantity))
            .unwrap_or(0)
    }

    pub fn contains(&self, owner_key: &str, asset_id: &str) -> bool {
        self.quantity(owner_key, asset_id) > 0
    }

    pub fn owners(&self) -> impl Iterator<Item = (&str, &[AssetBalance])> {
        self.owners.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.owners.iter().flat_map(|(owner, balances)| {
            balances
                .iter()
                .map(move |b| Entry::new(owner.clone(), b.asset_id.clone(), b.quantity))
        })
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    pub fn entry_count(&self) -> usize {
        self.owners.values().map(Vec::len).sum()
    }

    pub fn total_quantity(&self) -> u64 {
        self.owners
            .values()
            .flat_map(|b| b.iter())
            .fold(0u64, |total, b| total.saturating_add(b.quantity))
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Fold another set into this one.
    pub fn merge(&mut self, other: &EntrySet) {
        for (owner, balances) in other.owners() {
            for b in balances {
                self.insert(owner, &b.asset_id, b.quantity);
            }
        }
    }
}

impl FromIterator<Entry> for EntrySet {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut set = EntrySet::new();
        for e in iter {
            set.insert(&e.owner_key, &e.asset_id, e.quantity);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_summed() {
        let mut set = EntrySet::new();
        set.insert("0xa", "1", 2);
        set.insert("0xa", "1", 3);
        set.insert("0xa", "2", 1);

        assert_eq!(set.entry_count(), 2);
        assert_eq!(set.quantity("0xa", "1"), 5);
        assert_eq!(set.total_quantity(), 6);
    }

    #[test]
    fn test_asset_order_is_first_seen() {
        let mut set = EntrySet::new();
        set.insert("0xa", "9", 1);
        set.insert("0xa", "10", 1);
        set.insert("0xa", "9", 1);

        let ids: Vec<_> = set.entries().map(|e| e.asset_id).collect();
        assert_eq!(ids, vec!["9", "10"]);
    }

    #[test]
    fn test_zero_quantity_ignored() {
        let mut set = EntrySet::new();
        set.insert("0xa", "1", 0);
        assert!(set.is_empty());
        assert!(!set.contains("0xa", "1"));
    }

    #[test]
    fn test_total_quantity_saturates() {
        let mut set = EntrySet::new();
        set.insert("0xa", "1", u64::MAX);
        set.insert("0xb", "2", u64::MAX);
        set.insert("0xb", "2", 1);
        assert_eq!(set.quantity("0xb", "2"), u64::MAX);
        assert_eq!(set.total_quantity(), u64::MAX);
    }

    #[test]
    fn test_merge_aggregates_across_sets() {
        let a: EntrySet = vec![Entry::new("0xa", "1", 1), Entry::new("0xb", "2", 4)]
            .into_iter()
            .collect();
        let mut b: EntrySet = vec![Entry::new("0xa", "1", 2)].into_iter().collect();
        b.merge(&a);

        assert_eq!(b.owner_count(), 2);
        assert_eq!(b.quantity("0xa", "1"), 3);
        assert_eq!(b.quantity("0xb", "2"), 4);
    }
}
