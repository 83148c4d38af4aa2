//! Junction tables for manyMany relationships.
//!
//! A junction table stores the pairs of a manyMany relationship with an
//! optional `__order`, indexed on each key and on the composite pair.

use std::collections::{BTreeMap, BTreeSet};

/// One junction row: a linked pair plus its position on the owning side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JunctionRow {
    pub self_key: String,
    pub foreign_key: String,
    pub order: Option<i64>,
}

impl JunctionRow {
    /// Creates a junction row.
    pub fn new(
        self_key: impl Into<String>,
        foreign_key: impl Into<String>,
        order: Option<i64>,
    ) -> Self {
        Self {
            self_key: self_key.into(),
            foreign_key: foreign_key.into(),
            order,
        }
    }
}

/// The physical storage of one manyMany relationship.
pub struct JunctionTable {
    name: String,
    self_key_name: String,
    foreign_key_name: String,
    /// Composite index: `(selfKey, foreignKey)` → order.
    rows: BTreeMap<(String, String), Option<i64>>,
    by_self: hashbrown::HashMap<String, BTreeSet<String>>,
    by_foreign: hashbrown::HashMap<String, BTreeSet<String>>,
}

impl JunctionTable {
    /// Creates an empty junction table.
    pub fn new(
        name: impl Into<String>,
        self_key_name: impl Into<String>,
        foreign_key_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            self_key_name: self_key_name.into(),
            foreign_key_name: foreign_key_name.into(),
            rows: BTreeMap::new(),
            by_self: hashbrown::HashMap::new(),
            by_foreign: hashbrown::HashMap::new(),
        }
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the self-key column name.
    pub fn self_key_name(&self) -> &str {
        &self.self_key_name
    }

    /// Returns the foreign-key column name.
    pub fn foreign_key_name(&self) -> &str {
        &self.foreign_key_name
    }

    /// Inserts a pair. Returns false if it was already present (the order
    /// is updated in that case).
    pub fn insert(&mut self, row: JunctionRow) -> bool {
        let key = (row.self_key.clone(), row.foreign_key.clone());
        let fresh = self.rows.insert(key, row.order).is_none();
        if fresh {
            self.by_self
                .entry(row.self_key.clone())
                .or_default()
                .insert(row.foreign_key.clone());
            self.by_foreign
                .entry(row.foreign_key)
                .or_default()
                .insert(row.self_key);
        }
        fresh
    }

    /// Removes a pair. Returns the removed row if it was present.
    pub fn remove(&mut self, self_key: &str, foreign_key: &str) -> Option<JunctionRow> {
        let order = self
            .rows
            .remove(&(self_key.to_string(), foreign_key.to_string()))?;
        if let Some(set) = self.by_self.get_mut(self_key) {
            set.remove(foreign_key);
            if set.is_empty() {
                self.by_self.remove(self_key);
            }
        }
        if let Some(set) = self.by_foreign.get_mut(foreign_key) {
            set.remove(self_key);
            if set.is_empty() {
                self.by_foreign.remove(foreign_key);
            }
        }
        Some(JunctionRow::new(self_key, foreign_key, order))
    }

    /// Returns true when the pair is present.
    pub fn contains(&self, self_key: &str, foreign_key: &str) -> bool {
        self.rows
            .contains_key(&(self_key.to_string(), foreign_key.to_string()))
    }

    /// Foreign keys linked to `self_key`, ordered by `__order` then key.
    pub fn links_of_self(&self, self_key: &str) -> Vec<String> {
        let Some(set) = self.by_self.get(self_key) else {
            return Vec::new();
        };
        let mut out: Vec<(Option<i64>, &String)> = set
            .iter()
            .map(|foreign| {
                let order = self
                    .rows
                    .get(&(self_key.to_string(), foreign.clone()))
                    .copied()
                    .flatten();
                (order, foreign)
            })
            .collect();
        out.sort_by(|a, b| match (a.0, b.0) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.1.cmp(b.1)),
            (Some(_), None) => core::cmp::Ordering::Less,
            (None, Some(_)) => core::cmp::Ordering::Greater,
            (None, None) => a.1.cmp(b.1),
        });
        out.into_iter().map(|(_, foreign)| foreign.clone()).collect()
    }

    /// Self keys linked to `foreign_key`, in key order.
    pub fn links_of_foreign(&self, foreign_key: &str) -> Vec<String> {
        self.by_foreign
            .get(foreign_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterates all rows in composite-key order.
    pub fn rows(&self) -> impl Iterator<Item = JunctionRow> + '_ {
        self.rows
            .iter()
            .map(|((s, f), order)| JunctionRow::new(s.clone(), f.clone(), *order))
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> JunctionTable {
        JunctionTable::new("jct_x", "__fk_self", "__fk_foreign")
    }

    #[test]
    fn test_insert_and_contains() {
        let mut jct = table();
        assert!(jct.insert(JunctionRow::new("r1a", "r2a", None)));
        assert!(!jct.insert(JunctionRow::new("r1a", "r2a", Some(1))));
        assert!(jct.contains("r1a", "r2a"));
        assert_eq!(jct.len(), 1);
    }

    #[test]
    fn test_remove_cleans_indexes() {
        let mut jct = table();
        jct.insert(JunctionRow::new("r1a", "r2a", None));
        jct.insert(JunctionRow::new("r1a", "r2b", None));

        assert!(jct.remove("r1a", "r2a").is_some());
        assert!(jct.remove("r1a", "r2a").is_none());
        assert_eq!(jct.links_of_self("r1a"), vec!["r2b".to_string()]);
        assert!(jct.links_of_foreign("r2a").is_empty());
    }

    #[test]
    fn test_links_respect_order_column() {
        let mut jct = table();
        jct.insert(JunctionRow::new("r1a", "r2c", Some(2)));
        jct.insert(JunctionRow::new("r1a", "r2a", Some(1)));
        jct.insert(JunctionRow::new("r1a", "r2b", None));

        assert_eq!(
            jct.links_of_self("r1a"),
            vec!["r2a".to_string(), "r2c".to_string(), "r2b".to_string()]
        );
    }

    #[test]
    fn test_reverse_lookup() {
        let mut jct = table();
        jct.insert(JunctionRow::new("r1a", "r2a", None));
        jct.insert(JunctionRow::new("r1b", "r2a", None));
        assert_eq!(
            jct.links_of_foreign("r2a"),
            vec!["r1a".to_string(), "r1b".to_string()]
        );
    }
}
