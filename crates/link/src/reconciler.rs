//! Out-of-band link integrity reconciliation.
//!
//! The JSON link cells are authoritative: junction rows, symmetric cells,
//! and (through write-time reflection) foreign-key columns are all derived
//! state. The reconciler compares the three representations and emits one
//! repair op per disagreeing cell plus the junction fixes, all routed
//! through the write orchestrator so the usual version discipline applies.
//! Running it on a consistent store produces nothing.

use std::collections::BTreeSet;

use serde_json::Value;

use easygrid_core::{
    link_cell_value, parse_link_cell, FieldSchema, LinkCell, RecordId, Result, TableId,
};
use easygrid_ops::AtomicEdit;
use easygrid_store::{JunctionRow, Overlay, RecordStore};

use crate::maintainer::{title_of, LinkEffects};

/// The integrity reconciler.
pub struct Reconciler;

impl Reconciler {
    /// Scans every relationship and returns the effects needed to restore
    /// consistency. Safe to run concurrently with normal writes because
    /// the effects commit through the orchestrator like any other write.
    pub fn reconcile(store: &RecordStore) -> Result<LinkEffects> {
        let mut effects = LinkEffects::default();
        let overlay = Overlay::new();

        let links: Vec<(TableId, FieldSchema)> = store
            .schemas()
            .flat_map(|schema| {
                schema
                    .link_fields()
                    .cloned()
                    .map(|field| (schema.id.clone(), field))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (table_id, field) in links {
            let link = field.as_link().expect("link fields only");
            match link.fk_host_table_name.as_deref() {
                Some(junction_name) => {
                    // Process each junction from its canonical side only.
                    let canonical = store
                        .junction(junction_name)
                        .map(|jct| jct.self_key_name() == link.self_key_name)
                        .unwrap_or(false);
                    if canonical {
                        Self::reconcile_junction(
                            store,
                            &overlay,
                            &table_id,
                            &field,
                            junction_name,
                            &mut effects,
                        )?;
                    }
                }
                None => {
                    if link.relationship.fk_on_self() {
                        Self::reconcile_scalar(store, &overlay, &table_id, &field, &mut effects)?;
                    }
                }
            }
        }
        Ok(effects)
    }

    /// ManyMany: junction rows must mirror the canonical side's cells, and
    /// symmetric cells must mirror the junction-backed pair set.
    fn reconcile_junction(
        store: &RecordStore,
        overlay: &Overlay,
        table_id: &str,
        field: &FieldSchema,
        junction_name: &str,
        effects: &mut LinkEffects,
    ) -> Result<()> {
        let link = field.as_link().expect("link fields only");
        let table = store.require_table(table_id)?;
        let Some(junction) = store.junction(junction_name) else {
            return Ok(());
        };

        // Pairs asserted by the cells.
        let mut expected: BTreeSet<(RecordId, RecordId)> = BTreeSet::new();
        for record_id in table.record_ids() {
            let record = table.get(&record_id).expect("listed id");
            for (position, entry) in parse_link_cell(&record.get_or_null(&field.id))
                .iter()
                .enumerate()
            {
                if expected.insert((record_id.clone(), entry.id.clone()))
                    && !junction.contains(&record_id, &entry.id)
                {
                    effects.junction_inserts.push((
                        junction_name.to_string(),
                        JunctionRow::new(&record_id, &entry.id, Some(position as i64)),
                    ));
                }
            }
        }

        // Junction rows no cell asserts.
        for row in junction.rows() {
            if !expected.contains(&(row.self_key.clone(), row.foreign_key.clone())) {
                effects
                    .junction_deletes
                    .push((junction_name.to_string(), row));
            }
        }

        // Symmetric cells mirror the expected pair set.
        if let Some(sym_field_id) = &link.symmetric_field_id {
            let sym_lookup = store
                .schema(&link.foreign_table_id)
                .ok()
                .and_then(|s| s.field(sym_field_id))
                .and_then(|f| f.as_link())
                .map(|l| l.lookup_field_id.clone());
            let Some(sym_lookup) = sym_lookup else {
                return Ok(());
            };
            let Ok(foreign_table) = store.require_table(&link.foreign_table_id) else {
                return Ok(());
            };

            for foreign_id in foreign_table.record_ids() {
                let current = overlay.cell(
                    store,
                    &link.foreign_table_id,
                    &foreign_id,
                    sym_field_id,
                );
                let current_entries = parse_link_cell(&current);
                let owners: BTreeSet<RecordId> = expected
                    .iter()
                    .filter(|(_, f)| *f == foreign_id)
                    .map(|(owner, _)| owner.clone())
                    .collect();

                // Keep the existing order for retained owners, append
                // missing ones, refresh every title.
                let mut next: Vec<LinkCell> = current_entries
                    .iter()
                    .filter(|entry| owners.contains(&entry.id))
                    .map(|entry| {
                        let title =
                            title_of(&overlay.cell(store, table_id, &entry.id, &sym_lookup));
                        LinkCell::new(&entry.id, title)
                    })
                    .collect();
                for owner in &owners {
                    if !next.iter().any(|entry| entry.id == *owner) {
                        let title = title_of(&overlay.cell(store, table_id, owner, &sym_lookup));
                        next.push(LinkCell::new(owner, title));
                    }
                }

                let next_value = if next.is_empty() && current.is_null() {
                    Value::Null
                } else {
                    link_cell_value(&next, true)
                };
                if next_value != current {
                    effects
                        .doc_edits
                        .entry((link.foreign_table_id.clone(), foreign_id.clone()))
                        .or_default()
                        .push(AtomicEdit::set_field(sym_field_id, current, next_value));
                }
            }
        }
        Ok(())
    }

    /// ManyOne / oneOne: the scalar FK column must match the cell. A
    /// disagreement gets a write-through op on the cell (the adapter
    /// re-reflects the column on apply), with the title refreshed while
    /// we are there.
    fn reconcile_scalar(
        store: &RecordStore,
        overlay: &Overlay,
        table_id: &str,
        field: &FieldSchema,
        effects: &mut LinkEffects,
    ) -> Result<()> {
        let link = field.as_link().expect("link fields only");
        let table = store.require_table(table_id)?;

        for record_id in table.record_ids() {
            let record = table.get(&record_id).expect("listed id");
            let cell = record.get_or_null(&field.id);
            let entries = parse_link_cell(&cell);
            let Some(entry) = entries.first() else {
                continue;
            };
            let fk = record
                .get(&link.self_key_name)
                .and_then(Value::as_str)
                .unwrap_or_default();
            let title = title_of(&overlay.cell(
                store,
                &link.foreign_table_id,
                &entry.id,
                &link.lookup_field_id,
            ));
            let normalized =
                link_cell_value(&[LinkCell::new(&entry.id, title)], link.is_multi());
            if fk != entry.id || normalized != cell {
                effects
                    .doc_edits
                    .entry((table_id.to_string(), record_id.clone()))
                    .or_default()
                    .push(AtomicEdit::replace(
                        easygrid_ops::Path::field(&field.id),
                        cell.clone(),
                        normalized,
                    ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easygrid_core::{
        ConcreteType, FieldKind, LinkDescriptor, Record, Relationship, TableSchemaBuilder,
    };
    use easygrid_store::Transaction;
    use serde_json::json;

    fn many_many_store() -> RecordStore {
        let mut store = RecordStore::new();
        let t1 = TableSchemaBuilder::new("tbl1", "One")
            .add_field(FieldSchema::concrete("fldName", "Name", ConcreteType::Text))
            .unwrap()
            .add_field(FieldSchema::new(
                "fldL",
                "Links",
                FieldKind::Link {
                    link: LinkDescriptor {
                        relationship: Relationship::ManyMany,
                        foreign_table_id: "tbl2".into(),
                        symmetric_field_id: Some("fldS".into()),
                        self_key_name: "__fk_fldL".into(),
                        foreign_key_name: "__fk_fldS".into(),
                        fk_host_table_name: Some("jct_ls".into()),
                        lookup_field_id: "fldTitle".into(),
                    },
                },
            ))
            .unwrap()
            .build()
            .unwrap();
        let t2 = TableSchemaBuilder::new("tbl2", "Two")
            .add_field(FieldSchema::concrete("fldTitle", "Title", ConcreteType::Text))
            .unwrap()
            .add_field(FieldSchema::new(
                "fldS",
                "Backlinks",
                FieldKind::Link {
                    link: LinkDescriptor {
                        relationship: Relationship::ManyMany,
                        foreign_table_id: "tbl1".into(),
                        symmetric_field_id: Some("fldL".into()),
                        self_key_name: "__fk_fldS".into(),
                        foreign_key_name: "__fk_fldL".into(),
                        fk_host_table_name: Some("jct_ls".into()),
                        lookup_field_id: "fldName".into(),
                    },
                },
            ))
            .unwrap()
            .build()
            .unwrap();
        store.create_table(t1).unwrap();
        store.create_table(t2).unwrap();
        store
    }

    fn seed_linked(store: &mut RecordStore, with_junction: bool, with_backlink: bool) {
        let mut tx = Transaction::begin();
        let mut r1a = Record::new("r1a");
        r1a.set("fldName", json!("one-a"));
        r1a.set("fldL", json!([{"id": "r2a", "title": "α"}]));
        tx.insert_row(store, "tbl1", r1a).unwrap();
        let mut r2a = Record::new("r2a");
        r2a.set("fldTitle", json!("α"));
        if with_backlink {
            r2a.set("fldS", json!([{"id": "r1a", "title": "one-a"}]));
        }
        tx.insert_row(store, "tbl2", r2a).unwrap();
        if with_junction {
            tx.insert_junction(store, "jct_ls", JunctionRow::new("r1a", "r2a", Some(0)))
                .unwrap();
        }
        tx.commit();
    }

    #[test]
    fn test_consistent_state_produces_nothing() {
        let mut store = many_many_store();
        seed_linked(&mut store, true, true);
        let effects = Reconciler::reconcile(&store).unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn test_missing_junction_row_restored() {
        let mut store = many_many_store();
        seed_linked(&mut store, false, true);

        let effects = Reconciler::reconcile(&store).unwrap();
        assert_eq!(effects.junction_inserts.len(), 1);
        assert_eq!(effects.junction_inserts[0].1.self_key, "r1a");
        assert_eq!(effects.junction_inserts[0].1.foreign_key, "r2a");
        assert!(effects.junction_deletes.is_empty());
        assert!(effects.doc_edits.is_empty());

        // Apply the repair and re-run: idempotence.
        let mut tx = Transaction::begin();
        let (junction, row) = effects.junction_inserts[0].clone();
        tx.insert_junction(&mut store, &junction, row).unwrap();
        tx.commit();
        assert!(Reconciler::reconcile(&store).unwrap().is_empty());
    }

    #[test]
    fn test_orphan_junction_row_deleted() {
        let mut store = many_many_store();
        seed_linked(&mut store, true, true);
        let mut tx = Transaction::begin();
        tx.insert_junction(&mut store, "jct_ls", JunctionRow::new("r1a", "recGhost", None))
            .unwrap();
        tx.commit();

        let effects = Reconciler::reconcile(&store).unwrap();
        assert_eq!(effects.junction_deletes.len(), 1);
        assert_eq!(effects.junction_deletes[0].1.foreign_key, "recGhost");
    }

    #[test]
    fn test_missing_backlink_repaired() {
        let mut store = many_many_store();
        seed_linked(&mut store, true, false);

        let effects = Reconciler::reconcile(&store).unwrap();
        let edits = &effects.doc_edits[&("tbl2".to_string(), "r2a".to_string())];
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].oi, Some(json!([{"id": "r1a", "title": "one-a"}])));
    }

    #[test]
    fn test_scalar_fk_drift_gets_write_through_op() {
        let mut store = RecordStore::new();
        let t1 = TableSchemaBuilder::new("tbl1", "One")
            .add_field(FieldSchema::new(
                "fldL",
                "Parent",
                FieldKind::Link {
                    link: LinkDescriptor {
                        relationship: Relationship::ManyOne,
                        foreign_table_id: "tbl2".into(),
                        symmetric_field_id: Some("fldS".into()),
                        self_key_name: "__fk_fldL".into(),
                        foreign_key_name: "__fk_fldS".into(),
                        fk_host_table_name: None,
                        lookup_field_id: "fldTitle".into(),
                    },
                },
            ))
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

        let mut tx = Transaction::begin();
        let mut r2 = Record::new("r2");
        r2.set("fldTitle", json!("parent"));
        tx.insert_row(&mut store, "tbl2", r2).unwrap();
        // A row whose cell and FK column disagree (simulated partial write:
        // the cell says r2, the column says nothing).
        let mut r1 = Record::new("r1");
        r1.set("fldL", json!({"id": "r2", "title": "parent"}));
        tx.insert_row(&mut store, "tbl1", r1).unwrap();
        tx.commit();

        let effects = Reconciler::reconcile(&store).unwrap();
        let edits = &effects.doc_edits[&("tbl1".to_string(), "r1".to_string())];
        assert_eq!(edits.len(), 1);
        // The repair rewrites the cell; applying it re-reflects the column.
        assert_eq!(edits[0].oi, Some(json!({"id": "r2", "title": "parent"})));
    }
}
