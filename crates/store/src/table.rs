//! Per-table row storage with foreign-key index maintenance.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use easygrid_core::{Error, Record, RecordId, Result, TableSchema};

/// Index over one scalar foreign-key column.
struct FkIndex {
    unique: bool,
    map: hashbrown::HashMap<String, BTreeSet<RecordId>>,
}

impl FkIndex {
    fn new(unique: bool) -> Self {
        Self {
            unique,
            map: hashbrown::HashMap::new(),
        }
    }

    fn add(&mut self, key: &str, record_id: &str, column: &str) -> Result<()> {
        let set = self.map.entry(key.to_string()).or_default();
        if self.unique && !set.is_empty() && !set.contains(record_id) {
            return Err(Error::constraint_violation(
                column,
                format!("key {} is already linked", key),
            ));
        }
        set.insert(record_id.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str, record_id: &str) {
        if let Some(set) = self.map.get_mut(key) {
            set.remove(record_id);
            if set.is_empty() {
                self.map.remove(key);
            }
        }
    }

    fn get(&self, key: &str) -> Vec<RecordId> {
        self.map
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Row storage for a single table.
pub struct TableStore {
    schema: TableSchema,
    rows: hashbrown::HashMap<RecordId, Record>,
    fk_indexes: BTreeMap<String, FkIndex>,
}

impl TableStore {
    /// Creates an empty store for the given schema.
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: hashbrown::HashMap::new(),
            fk_indexes: BTreeMap::new(),
        }
    }

    /// Returns the table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Replaces the schema (field creation/update) and re-derives indexes
    /// as instructed by the caller afterwards.
    pub(crate) fn set_schema(&mut self, schema: TableSchema) {
        self.schema = schema;
    }

    /// Ensures an index over a scalar foreign-key column, building it from
    /// the existing rows.
    pub fn ensure_fk_index(&mut self, column: &str, unique: bool) -> Result<()> {
        if self.fk_indexes.contains_key(column) {
            return Ok(());
        }
        let mut index = FkIndex::new(unique);
        for record in self.rows.values() {
            if let Some(key) = record.get(column).and_then(Value::as_str) {
                index.add(key, &record.id, column)?;
            }
        }
        self.fk_indexes.insert(column.to_string(), index);
        Ok(())
    }

    /// Returns true when the column is index-backed.
    pub fn has_fk_index(&self, column: &str) -> bool {
        self.fk_indexes.contains_key(column)
    }

    /// Record ids whose indexed column equals `key`, in id order.
    pub fn by_fk(&self, column: &str, key: &str) -> Vec<RecordId> {
        self.fk_indexes
            .get(column)
            .map(|index| index.get(key))
            .unwrap_or_default()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gets a record by id.
    pub fn get(&self, record_id: &str) -> Option<&Record> {
        self.rows.get(record_id)
    }

    /// Iterates all records.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }

    /// All record ids, sorted.
    pub fn record_ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.rows.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Inserts a new record.
    pub fn insert(&mut self, record: Record) -> Result<()> {
        if self.rows.contains_key(&record.id) {
            return Err(Error::operation_invalid(format!(
                "record {} already exists in table {}",
                record.id, self.schema.id
            )));
        }
        self.index_record(&record)?;
        self.rows.insert(record.id.clone(), record);
        Ok(())
    }

    /// Replaces a record, maintaining indexes. Returns the old record.
    pub fn update(&mut self, record_id: &str, new_record: Record) -> Result<Record> {
        let old = self
            .rows
            .get(record_id)
            .cloned()
            .ok_or_else(|| Error::record_not_found(&self.schema.id, record_id))?;
        self.unindex_record(&old);
        if let Err(err) = self.index_record(&new_record) {
            // Put the old index entries back before failing.
            self.index_record(&old).ok();
            return Err(err);
        }
        self.rows.insert(record_id.to_string(), new_record);
        Ok(old)
    }

    /// Deletes a record. Returns it.
    pub fn remove(&mut self, record_id: &str) -> Result<Record> {
        let record = self
            .rows
            .remove(record_id)
            .ok_or_else(|| Error::record_not_found(&self.schema.id, record_id))?;
        self.unindex_record(&record);
        Ok(record)
    }

    /// Restores a record exactly as given, bypassing uniqueness checks.
    /// Used by transaction rollback, which re-establishes a state that was
    /// valid before.
    pub(crate) fn restore(&mut self, record: Record) {
        if let Some(old) = self.rows.remove(&record.id) {
            self.unindex_record(&old);
        }
        for (column, index) in self.fk_indexes.iter_mut() {
            if let Some(key) = record.get(column).and_then(Value::as_str) {
                index
                    .map
                    .entry(key.to_string())
                    .or_default()
                    .insert(record.id.clone());
            }
        }
        self.rows.insert(record.id.clone(), record);
    }

    fn index_record(&mut self, record: &Record) -> Result<()> {
        // Validate uniqueness first so a failure leaves every index untouched.
        for (column, index) in self.fk_indexes.iter() {
            if !index.unique {
                continue;
            }
            if let Some(key) = record.get(column).and_then(Value::as_str) {
                if let Some(set) = index.map.get(key) {
                    if !set.is_empty() && !set.contains(&record.id) {
                        return Err(Error::constraint_violation(
                            column,
                            format!("key {} is already linked", key),
                        ));
                    }
                }
            }
        }
        for (column, index) in self.fk_indexes.iter_mut() {
            if let Some(key) = record.get(column).and_then(Value::as_str) {
                index
                    .map
                    .entry(key.to_string())
                    .or_default()
                    .insert(record.id.clone());
            }
        }
        Ok(())
    }

    fn unindex_record(&mut self, record: &Record) {
        for (column, index) in self.fk_indexes.iter_mut() {
            if let Some(key) = record.get(column).and_then(Value::as_str) {
                index.remove(key, &record.id);
            }
        }
    }
}
