//! The record store: all tables, junctions, and schemas of one deployment.

use std::collections::BTreeMap;

use serde_json::Value;

use easygrid_core::{
    parse_link_cell, Error, FieldSchema, Fields, Record, RecordId, Relationship, Result,
    TableId, TableSchema,
};

use crate::junction::{JunctionRow, JunctionTable};
use crate::table::TableStore;

/// The record store managing every table of the deployment.
///
/// Table DDL proper is managed by an external collaborator; the store
/// materialises the schemas it is told about and assumes a column can
/// exist for every field id it receives.
pub struct RecordStore {
    tables: BTreeMap<TableId, TableStore>,
    junctions: BTreeMap<String, JunctionTable>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            junctions: BTreeMap::new(),
        }
    }

    /// Registers a table and wires up the physical side of its links
    /// (junction tables, foreign-key indexes).
    pub fn create_table(&mut self, schema: TableSchema) -> Result<()> {
        if self.tables.contains_key(&schema.id) {
            return Err(Error::invalid_schema(format!(
                "table already exists: {}",
                schema.id
            )));
        }
        tracing::debug!(table = %schema.id, fields = schema.fields.len(), "table registered");
        self.tables.insert(schema.id.clone(), TableStore::new(schema));
        self.rewire()
    }

    /// Drops a table.
    pub fn drop_table(&mut self, table_id: &str) -> Result<()> {
        if self.tables.remove(table_id).is_none() {
            return Err(Error::table_not_found(table_id));
        }
        Ok(())
    }

    /// Replaces a table's schema (field creation/update/deletion) and
    /// re-wires junctions and indexes.
    pub fn set_schema(&mut self, schema: TableSchema) -> Result<()> {
        let table = self
            .tables
            .get_mut(&schema.id)
            .ok_or_else(|| Error::table_not_found(&schema.id))?;
        table.set_schema(schema);
        self.rewire()
    }

    /// Ensures junction tables and FK indexes exist for every link field
    /// of every registered schema. Idempotent; called after any schema
    /// change so links created before their foreign table still get their
    /// storage once it appears.
    fn rewire(&mut self) -> Result<()> {
        let links: Vec<(TableId, FieldSchema)> = self
            .tables
            .values()
            .flat_map(|t| {
                t.schema()
                    .link_fields()
                    .cloned()
                    .map(|f| (t.schema().id.clone(), f))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (table_id, field) in links {
            let link = field.as_link().expect("link fields only");
            match link.relationship {
                Relationship::ManyMany => {
                    let name = link
                        .fk_host_table_name
                        .clone()
                        .expect("validated at schema build");
                    self.junctions.entry(name.clone()).or_insert_with(|| {
                        JunctionTable::new(name, &link.self_key_name, &link.foreign_key_name)
                    });
                }
                Relationship::ManyOne => {
                    if let Some(table) = self.tables.get_mut(&table_id) {
                        table.ensure_fk_index(&link.self_key_name, false)?;
                    }
                }
                Relationship::OneOne => {
                    if let Some(table) = self.tables.get_mut(&table_id) {
                        table.ensure_fk_index(&link.self_key_name, true)?;
                    }
                }
                Relationship::OneMany => {
                    if let Some(foreign) = self.tables.get_mut(&link.foreign_table_id) {
                        foreign.ensure_fk_index(&link.foreign_key_name, false)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns a table store.
    pub fn table(&self, table_id: &str) -> Option<&TableStore> {
        self.tables.get(table_id)
    }

    /// Returns a table store, or a table-not-found error.
    pub fn require_table(&self, table_id: &str) -> Result<&TableStore> {
        self.tables
            .get(table_id)
            .ok_or_else(|| Error::table_not_found(table_id))
    }

    pub(crate) fn require_table_mut(&mut self, table_id: &str) -> Result<&mut TableStore> {
        self.tables
            .get_mut(table_id)
            .ok_or_else(|| Error::table_not_found(table_id))
    }

    /// Returns a table's schema.
    pub fn schema(&self, table_id: &str) -> Result<&TableSchema> {
        self.require_table(table_id).map(|t| t.schema())
    }

    /// Iterates all schemas in table-id order.
    pub fn schemas(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values().map(|t| t.schema())
    }

    /// Returns a junction table by name.
    pub fn junction(&self, name: &str) -> Option<&JunctionTable> {
        self.junctions.get(name)
    }

    pub(crate) fn junction_mut(&mut self, name: &str) -> Result<&mut JunctionTable> {
        self.junctions
            .get_mut(name)
            .ok_or_else(|| Error::internal(format!("junction table {} not wired", name)))
    }

    /// Gets a record.
    pub fn get_record(&self, table_id: &str, record_id: &str) -> Option<&Record> {
        self.tables.get(table_id).and_then(|t| t.get(record_id))
    }

    /// Loads the document projection of a row: `(data, version)`.
    ///
    /// Returns `None` for a missing row; the caller treats that as an
    /// empty document at version 0.
    pub fn load_row(&self, table_id: &str, record_id: &str) -> Option<(Fields, u64)> {
        let table = self.tables.get(table_id)?;
        let record = table.get(record_id)?;
        Some((record.document_data(table.schema()), record.version))
    }

    /// Records of the owning table whose link field references
    /// `foreign_record`, resolved through the physical storage of the
    /// relationship (junction or FK index). Falls back to a JSON
    /// containment scan when no index backs the column.
    pub fn linked_record_ids(
        &self,
        owner_table: &str,
        link_field: &FieldSchema,
        foreign_record: &str,
    ) -> Vec<RecordId> {
        let Some(link) = link_field.as_link() else {
            return Vec::new();
        };
        match link.relationship {
            Relationship::ManyMany => link
                .fk_host_table_name
                .as_deref()
                .and_then(|name| self.junctions.get(name))
                .map(|jct| jct.links_of_foreign(foreign_record))
                .unwrap_or_default(),
            Relationship::ManyOne | Relationship::OneOne => {
                let Some(table) = self.tables.get(owner_table) else {
                    return Vec::new();
                };
                if table.has_fk_index(&link.self_key_name) {
                    table.by_fk(&link.self_key_name, foreign_record)
                } else {
                    self.scan_link_cells(owner_table, &link_field.id, foreign_record)
                }
            }
            Relationship::OneMany => {
                // The scalar FK lives on the foreign row and points back
                // at the owner.
                self.tables
                    .get(&link.foreign_table_id)
                    .and_then(|t| t.get(foreign_record))
                    .and_then(|r| r.get(&link.foreign_key_name))
                    .and_then(Value::as_str)
                    .map(|owner| vec![owner.to_string()])
                    .unwrap_or_default()
            }
        }
    }

    /// Records of the owning table referencing `foreign_record` in either
    /// the physical storage or the JSON link cell. The two can transiently
    /// disagree after a crash, so title propagation and the reconciler
    /// consult both.
    pub fn referencing_records(
        &self,
        owner_table: &str,
        link_field: &FieldSchema,
        foreign_record: &str,
    ) -> Vec<RecordId> {
        let mut ids = self.linked_record_ids(owner_table, link_field, foreign_record);
        for id in self.scan_link_cells(owner_table, &link_field.id, foreign_record) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// JSON containment scan: owner records whose link cell mentions the
    /// foreign record. Quadratic in cell count; acceptable for small
    /// tables and as the unindexed fallback.
    fn scan_link_cells(
        &self,
        owner_table: &str,
        link_field_id: &str,
        foreign_record: &str,
    ) -> Vec<RecordId> {
        let Some(table) = self.tables.get(owner_table) else {
            return Vec::new();
        };
        let mut ids: Vec<RecordId> = table
            .records()
            .filter(|record| {
                record
                    .get(link_field_id)
                    .map(|cell| {
                        parse_link_cell(cell)
                            .iter()
                            .any(|entry| entry.id == foreign_record)
                    })
                    .unwrap_or(false)
            })
            .map(|record| record.id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ----- persistence -----

    /// Serializes the whole store (schemas, rows, junction rows) for the
    /// file-backed persistence home.
    pub fn export(&self) -> serde_json::Value {
        let tables: Vec<serde_json::Value> = self
            .tables
            .values()
            .map(|table| {
                let mut records: Vec<&Record> = table.records().collect();
                records.sort_by(|a, b| a.id.cmp(&b.id));
                serde_json::json!({
                    "schema": table.schema(),
                    "records": records,
                })
            })
            .collect();
        let junctions: Vec<serde_json::Value> = self
            .junctions
            .values()
            .map(|jct| {
                let rows: Vec<serde_json::Value> = jct
                    .rows()
                    .map(|row| {
                        serde_json::json!([row.self_key, row.foreign_key, row.order])
                    })
                    .collect();
                serde_json::json!({
                    "name": jct.name(),
                    "selfKeyName": jct.self_key_name(),
                    "foreignKeyName": jct.foreign_key_name(),
                    "rows": rows,
                })
            })
            .collect();
        serde_json::json!({ "tables": tables, "junctions": junctions })
    }

    /// Rebuilds a store from its serialized form.
    pub fn import(value: &serde_json::Value) -> Result<Self> {
        let mut store = Self::new();
        let tables = value
            .get("tables")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| Error::internal("malformed store snapshot: missing tables"))?;
        for entry in tables {
            let schema: TableSchema = serde_json::from_value(
                entry
                    .get("schema")
                    .cloned()
                    .ok_or_else(|| Error::internal("malformed store snapshot: missing schema"))?,
            )
            .map_err(|err| Error::internal(format!("malformed table schema: {}", err)))?;
            let table_id = schema.id.clone();
            store.create_table(schema)?;
            if let Some(records) = entry.get("records").and_then(serde_json::Value::as_array) {
                let table = store.require_table_mut(&table_id)?;
                for raw in records {
                    let record: Record = serde_json::from_value(raw.clone())
                        .map_err(|err| Error::internal(format!("malformed record: {}", err)))?;
                    table.restore(record);
                }
            }
        }
        if let Some(junctions) = value.get("junctions").and_then(serde_json::Value::as_array) {
            for entry in junctions {
                let name = entry
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::internal("malformed junction snapshot"))?;
                let jct = store.junctions.entry(name.to_string()).or_insert_with(|| {
                    JunctionTable::new(
                        name,
                        entry
                            .get("selfKeyName")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default(),
                        entry
                            .get("foreignKeyName")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default(),
                    )
                });
                if let Some(rows) = entry.get("rows").and_then(serde_json::Value::as_array) {
                    for row in rows {
                        let self_key = row.get(0).and_then(serde_json::Value::as_str);
                        let foreign_key = row.get(1).and_then(serde_json::Value::as_str);
                        let order = row.get(2).and_then(serde_json::Value::as_i64);
                        if let (Some(self_key), Some(foreign_key)) = (self_key, foreign_key) {
                            jct.insert(crate::junction::JunctionRow::new(
                                self_key,
                                foreign_key,
                                order,
                            ));
                        }
                    }
                }
            }
        }
        Ok(store)
    }

    // ----- rollback hooks used by the journal -----

    pub(crate) fn undo_insert(&mut self, table_id: &str, record_id: &str) {
        if let Some(table) = self.tables.get_mut(table_id) {
            table.remove(record_id).ok();
        }
    }

    pub(crate) fn undo_to(&mut self, table_id: &str, record: Record) {
        if let Some(table) = self.tables.get_mut(table_id) {
            table.restore(record);
        }
    }

    pub(crate) fn undo_junction_insert(&mut self, junction: &str, row: &JunctionRow) {
        if let Some(jct) = self.junctions.get_mut(junction) {
            jct.remove(&row.self_key, &row.foreign_key);
        }
    }

    pub(crate) fn undo_junction_delete(&mut self, junction: &str, row: JunctionRow) {
        if let Some(jct) = self.junctions.get_mut(junction) {
            jct.insert(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easygrid_core::{
        ConcreteType, FieldKind, LinkDescriptor, TableSchemaBuilder,
    };
    use serde_json::json;

    fn link_field(
        id: &str,
        relationship: Relationship,
        foreign: &str,
        junction: Option<&str>,
    ) -> FieldSchema {
        FieldSchema::new(
            id,
            format!("Link {}", id),
            FieldKind::Link {
                link: LinkDescriptor {
                    relationship,
                    foreign_table_id: foreign.into(),
                    symmetric_field_id: Some("fldSym".into()),
                    self_key_name: format!("__fk_{}", id),
                    foreign_key_name: "__fk_fldSym".into(),
                    fk_host_table_name: junction.map(String::from),
                    lookup_field_id: "fldTitle".into(),
                },
            },
        )
    }

    fn two_tables(relationship: Relationship, junction: Option<&str>) -> RecordStore {
        let mut store = RecordStore::new();
        let t1 = TableSchemaBuilder::new("tbl1", "One")
            .add_field(FieldSchema::concrete("fldName", "Name", ConcreteType::Text))
            .unwrap()
            .add_field(link_field("fldL", relationship, "tbl2", junction))
            .unwrap()
            .build()
            .unwrap();
        let t2 = TableSchemaBuilder::new("tbl2", "Two")
            .add_field(FieldSchema::concrete("fldTitle", "Title", ConcreteType::Text))
            .unwrap()
            .build()
            .unwrap();
        store.create_table(t1).unwrap();
        store.create_table(t2).unwrap();
        store
    }

    #[test]
    fn test_create_table_wires_junction() {
        let store = two_tables(Relationship::ManyMany, Some("jct_l"));
        assert!(store.junction("jct_l").is_some());
    }

    #[test]
    fn test_create_table_wires_fk_index() {
        let store = two_tables(Relationship::ManyOne, None);
        assert!(store.table("tbl1").unwrap().has_fk_index("__fk_fldL"));
    }

    #[test]
    fn test_one_many_indexes_foreign_table() {
        let store = two_tables(Relationship::OneMany, None);
        assert!(store.table("tbl2").unwrap().has_fk_index("__fk_fldSym"));
    }

    #[test]
    fn test_load_row_projects_document_data() {
        let mut store = two_tables(Relationship::ManyOne, None);
        let mut record = Record::new("rec1");
        record.set("fldName", json!("hello"));
        record.set("__fk_fldL", json!("rec9"));
        record.version = 4;
        store.require_table_mut("tbl1").unwrap().insert(record).unwrap();

        let (data, version) = store.load_row("tbl1", "rec1").unwrap();
        assert_eq!(version, 4);
        assert!(data.contains_key("fldName"));
        assert!(!data.contains_key("__fk_fldL"));
        assert!(store.load_row("tbl1", "recMissing").is_none());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut store = two_tables(Relationship::ManyOne, None);
        let mut record = Record::new("rec1");
        record.set("fldName", json!("hello"));
        record.version = 3;
        store.require_table_mut("tbl1").unwrap().insert(record).unwrap();

        let snapshot = store.export();
        let restored = RecordStore::import(&snapshot).unwrap();
        assert_eq!(restored.schemas().count(), 2);
        let record = restored.get_record("tbl1", "rec1").unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.get("fldName"), Some(&json!("hello")));
        assert_eq!(restored.export(), snapshot);
    }

    #[test]
    fn test_referencing_records_unions_cell_scan() {
        let mut store = two_tables(Relationship::ManyOne, None);
        // rec1 has both the JSON cell and the FK column; rec2 only the
        // JSON cell (a simulated partial write).
        let mut rec1 = Record::new("rec1");
        rec1.set("fldL", json!({"id": "recX", "title": "x"}));
        rec1.set("__fk_fldL", json!("recX"));
        let mut rec2 = Record::new("rec2");
        rec2.set("fldL", json!({"id": "recX", "title": "x"}));

        let table = store.require_table_mut("tbl1").unwrap();
        table.insert(rec1).unwrap();
        table.insert(rec2).unwrap();

        let schema = store.schema("tbl1").unwrap().clone();
        let field = schema.field("fldL").unwrap();
        assert_eq!(
            store.linked_record_ids("tbl1", field, "recX"),
            vec!["rec1".to_string()]
        );
        assert_eq!(
            store.referencing_records("tbl1", field, "recX"),
            vec!["rec1".to_string(), "rec2".to_string()]
        );
    }
}
