//! Write-time link maintenance.

use std::collections::BTreeMap;

use serde_json::Value;

use easygrid_core::{
    link_cell_value, parse_link_cell, FieldId, LinkCell, LinkDescriptor, RecordId, Result,
    TableId,
};
use easygrid_ops::AtomicEdit;
use easygrid_store::{JunctionRow, Overlay, RecordStore};

/// One observed change to a link cell.
#[derive(Clone, Debug)]
pub struct LinkChange {
    pub table_id: TableId,
    pub record_id: RecordId,
    pub field_id: FieldId,
    /// Cell value before the write.
    pub old: Value,
    /// Cell value after the write.
    pub new: Value,
}

/// Everything the maintainer wants persisted and published alongside the
/// triggering write.
#[derive(Debug, Default)]
pub struct LinkEffects {
    /// Symmetric and title ops, grouped per document.
    pub doc_edits: BTreeMap<(TableId, RecordId), Vec<AtomicEdit>>,
    /// Junction rows to insert, per junction table.
    pub junction_inserts: Vec<(String, JunctionRow)>,
    /// Junction rows to delete, per junction table.
    pub junction_deletes: Vec<(String, JunctionRow)>,
}

impl LinkEffects {
    /// Returns true when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.doc_edits.is_empty()
            && self.junction_inserts.is_empty()
            && self.junction_deletes.is_empty()
    }

    /// Merges another effect set into this one.
    pub fn merge(&mut self, other: LinkEffects) {
        for (key, edits) in other.doc_edits {
            self.doc_edits.entry(key).or_default().extend(edits);
        }
        self.junction_inserts.extend(other.junction_inserts);
        self.junction_deletes.extend(other.junction_deletes);
    }

    pub(crate) fn edit(&mut self, table_id: &str, record_id: &str, edit: AtomicEdit) {
        self.doc_edits
            .entry((table_id.to_string(), record_id.to_string()))
            .or_default()
            .push(edit);
    }
}

/// Records an edit and applies it to the overlay immediately, so later
/// effects touching the same cell build on the already-edited value.
fn push_edit(
    effects: &mut LinkEffects,
    store: &RecordStore,
    overlay: &mut Overlay,
    table_id: &str,
    record_id: &str,
    edit: AtomicEdit,
) -> Result<()> {
    overlay.apply(
        store,
        table_id,
        record_id,
        &easygrid_ops::Operation::from_edits(vec![edit.clone()]),
    )?;
    effects.edit(table_id, record_id, edit);
    Ok(())
}

/// Renders a cell value as a link title.
pub(crate) fn title_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// The link maintainer.
pub struct LinkMaintainer;

impl LinkMaintainer {
    /// Computes the maintenance effects of a set of link-cell changes.
    ///
    /// Reads go through the overlay so titles and symmetric cells reflect
    /// every earlier write of the same transaction.
    pub fn apply_changes(
        store: &RecordStore,
        overlay: &mut Overlay,
        changes: &[LinkChange],
    ) -> Result<LinkEffects> {
        let mut effects = LinkEffects::default();
        for change in changes {
            Self::apply_one(store, overlay, change, &mut effects)?;
        }
        Ok(effects)
    }

    fn apply_one(
        store: &RecordStore,
        overlay: &mut Overlay,
        change: &LinkChange,
        effects: &mut LinkEffects,
    ) -> Result<()> {
        let schema = store.schema(&change.table_id)?;
        let field = schema.require_field(&change.field_id)?;
        let Some(link) = field.as_link() else {
            return Ok(());
        };

        let old_entries = parse_link_cell(&change.old);
        let new_entries = parse_link_cell(&change.new);
        let removed: Vec<&LinkCell> = old_entries
            .iter()
            .filter(|entry| !new_entries.iter().any(|n| n.id == entry.id))
            .collect();
        let added: Vec<&LinkCell> = new_entries
            .iter()
            .filter(|entry| !old_entries.iter().any(|o| o.id == entry.id))
            .collect();

        tracing::debug!(
            table = %change.table_id,
            record = %change.record_id,
            field = %change.field_id,
            added = added.len(),
            removed = removed.len(),
            "link cell changed"
        );

        // Junction rows for manyMany.
        if let Some(junction) = link.fk_host_table_name.as_deref() {
            for entry in &removed {
                effects.junction_deletes.push((
                    junction.to_string(),
                    JunctionRow::new(&change.record_id, &entry.id, None),
                ));
            }
            for entry in &added {
                let order = new_entries
                    .iter()
                    .position(|n| n.id == entry.id)
                    .map(|p| p as i64);
                effects.junction_inserts.push((
                    junction.to_string(),
                    JunctionRow::new(&change.record_id, &entry.id, order),
                ));
            }
        }

        // Symmetric cells on the other side.
        if let Some(sym_field_id) = &link.symmetric_field_id {
            let sym_multi = link.relationship.symmetric().is_multi();
            let own_title = Self::own_title(store, overlay, link, change);

            let removed_ids: Vec<String> = removed.iter().map(|e| e.id.clone()).collect();
            for peer_id in &removed_ids {
                Self::remove_from_peer(
                    store, overlay, link, sym_field_id, sym_multi, change, peer_id, effects,
                )?;
            }
            for entry in new_entries.iter() {
                // Added entries get a full symmetric entry; retained ones
                // get their title refreshed against the current state.
                Self::upsert_into_peer(
                    store,
                    overlay,
                    link,
                    sym_field_id,
                    sym_multi,
                    change,
                    &entry.id,
                    &own_title,
                    effects,
                )?;
            }
        }

        // Refresh the titles inside the written cell itself from the
        // current peer rows; `id` is authoritative, `title` is cache.
        if !new_entries.is_empty() {
            let refreshed: Vec<LinkCell> = new_entries
                .iter()
                .map(|entry| {
                    let title = title_of(&overlay.cell(
                        store,
                        &link.foreign_table_id,
                        &entry.id,
                        &link.lookup_field_id,
                    ));
                    LinkCell::new(&entry.id, title)
                })
                .collect();
            let refreshed_value = link_cell_value(&refreshed, link.is_multi());
            let current = overlay.cell(store, &change.table_id, &change.record_id, &change.field_id);
            if refreshed_value != current {
                push_edit(
                    effects,
                    store,
                    overlay,
                    &change.table_id,
                    &change.record_id,
                    AtomicEdit::set_field(&change.field_id, current, refreshed_value),
                )?;
            }
        }
        Ok(())
    }

    /// The title peers cache for this record: the value of the lookup
    /// field configured on the symmetric descriptor.
    fn own_title(
        store: &RecordStore,
        overlay: &Overlay,
        link: &LinkDescriptor,
        change: &LinkChange,
    ) -> String {
        let lookup = link
            .symmetric_field_id
            .as_ref()
            .and_then(|sym| {
                store
                    .schema(&link.foreign_table_id)
                    .ok()
                    .and_then(|s| s.field(sym))
            })
            .and_then(|f| f.as_link())
            .map(|sym_link| sym_link.lookup_field_id.clone());
        match lookup {
            Some(lookup_field) => title_of(&overlay.cell(
                store,
                &change.table_id,
                &change.record_id,
                &lookup_field,
            )),
            None => String::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn remove_from_peer(
        store: &RecordStore,
        overlay: &mut Overlay,
        link: &LinkDescriptor,
        sym_field_id: &str,
        sym_multi: bool,
        change: &LinkChange,
        peer_id: &str,
        effects: &mut LinkEffects,
    ) -> Result<()> {
        let current = overlay.cell(store, &link.foreign_table_id, peer_id, sym_field_id);
        let entries = parse_link_cell(&current);
        if !entries.iter().any(|e| e.id == change.record_id) {
            return Ok(());
        }
        let next: Vec<LinkCell> = entries
            .into_iter()
            .filter(|e| e.id != change.record_id)
            .collect();
        push_edit(
            effects,
            store,
            overlay,
            &link.foreign_table_id,
            peer_id,
            AtomicEdit::set_field(sym_field_id, current, link_cell_value(&next, sym_multi)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_into_peer(
        store: &RecordStore,
        overlay: &mut Overlay,
        link: &LinkDescriptor,
        sym_field_id: &str,
        sym_multi: bool,
        change: &LinkChange,
        peer_id: &str,
        own_title: &str,
        effects: &mut LinkEffects,
    ) -> Result<()> {
        // A cell may reference a record that no longer exists; there is no
        // peer document to maintain then.
        if overlay.fields(store, &link.foreign_table_id, peer_id).is_none() {
            return Ok(());
        }
        let current = overlay.cell(store, &link.foreign_table_id, peer_id, sym_field_id);
        let mut entries = parse_link_cell(&current);
        let next = match entries.iter_mut().find(|e| e.id == change.record_id) {
            Some(existing) => {
                if existing.title == own_title {
                    return Ok(());
                }
                existing.title = own_title.to_string();
                entries
            }
            None => {
                if !sym_multi {
                    // Single-valued peer cell: the new link replaces any
                    // previous occupant.
                    entries.clear();
                }
                entries.push(LinkCell::new(&change.record_id, own_title));
                entries
            }
        };
        push_edit(
            effects,
            store,
            overlay,
            &link.foreign_table_id,
            peer_id,
            AtomicEdit::set_field(sym_field_id, current, link_cell_value(&next, sym_multi)),
        )
    }

    /// Title fan-out: a field that is the lookup source for inbound link
    /// titles changed on `(table_id, record_id)`. Every referencing link
    /// cell gets a title-only replace preserving entry order.
    pub fn title_source_changed(
        store: &RecordStore,
        overlay: &mut Overlay,
        table_id: &str,
        record_id: &str,
        changed_field: &str,
    ) -> Result<LinkEffects> {
        let mut effects = LinkEffects::default();
        let new_title = title_of(&overlay.cell(store, table_id, record_id, changed_field));

        // Collect inbound link fields first: every link field anywhere
        // whose foreign table is ours and whose lookup source is the
        // changed field.
        let inbound: Vec<(TableId, easygrid_core::FieldSchema)> = store
            .schemas()
            .flat_map(|schema| {
                schema
                    .link_fields()
                    .filter(|field| {
                        field.as_link().is_some_and(|link| {
                            link.foreign_table_id == table_id
                                && link.lookup_field_id == changed_field
                        })
                    })
                    .cloned()
                    .map(|field| (schema.id.clone(), field))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (owner_table, field) in inbound {
            let link = field.as_link().expect("link fields only");
            for owner in store.referencing_records(&owner_table, &field, record_id) {
                let current = overlay.cell(store, &owner_table, &owner, &field.id);
                let mut entries = parse_link_cell(&current);
                let mut touched = false;
                for entry in entries.iter_mut() {
                    if entry.id == record_id && entry.title != new_title {
                        entry.title = new_title.clone();
                        touched = true;
                    }
                }
                if touched {
                    push_edit(
                        &mut effects,
                        store,
                        overlay,
                        &owner_table,
                        &owner,
                        AtomicEdit::replace(
                            easygrid_ops::Path::field(&field.id),
                            current,
                            link_cell_value(&entries, link.is_multi()),
                        ),
                    )?;
                }
            }
        }
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easygrid_core::{
        ConcreteType, FieldKind, FieldSchema, Record, Relationship, TableSchemaBuilder,
    };
    use easygrid_store::Transaction;
    use serde_json::json;

    /// Two tables with a manyMany pair of link fields.
    fn many_many_store() -> RecordStore {
        let mut store = RecordStore::new();
        let t1 = TableSchemaBuilder::new("tbl1", "One")
            .add_field(FieldSchema::concrete("fldName", "Name", ConcreteType::Text))
            .unwrap()
            .add_field(FieldSchema::new(
                "fldL",
                "Links",
                FieldKind::Link {
                    link: easygrid_core::LinkDescriptor {
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
                    link: easygrid_core::LinkDescriptor {
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

        let mut tx = Transaction::begin();
        let mut r1a = Record::new("r1a");
        r1a.set("fldName", json!("one-a"));
        tx.insert_row(&mut store, "tbl1", r1a).unwrap();
        let mut r1b = Record::new("r1b");
        r1b.set("fldName", json!("one-b"));
        tx.insert_row(&mut store, "tbl1", r1b).unwrap();
        let mut r2a = Record::new("r2a");
        r2a.set("fldTitle", json!("α"));
        tx.insert_row(&mut store, "tbl2", r2a).unwrap();
        let mut r2b = Record::new("r2b");
        r2b.set("fldTitle", json!("β"));
        tx.insert_row(&mut store, "tbl2", r2b).unwrap();
        tx.commit();
        store
    }

    #[test]
    fn test_many_many_set_produces_junctions_and_symmetric_ops() {
        let store = many_many_store();
        let mut overlay = Overlay::new();
        let change = LinkChange {
            table_id: "tbl1".into(),
            record_id: "r1a".into(),
            field_id: "fldL".into(),
            old: Value::Null,
            new: json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]),
        };
        let effects = LinkMaintainer::apply_changes(&store, &mut overlay, &[change]).unwrap();

        // (a) exactly two junction rows.
        assert_eq!(effects.junction_inserts.len(), 2);
        assert!(effects.junction_deletes.is_empty());
        assert_eq!(effects.junction_inserts[0].0, "jct_ls");

        // (b)(c) symmetric cells on r2a and r2b gain the backlink with the
        // looked-up title of r1a.
        let r2a_edits = &effects.doc_edits[&("tbl2".to_string(), "r2a".to_string())];
        assert_eq!(r2a_edits.len(), 1);
        assert_eq!(
            r2a_edits[0].oi,
            Some(json!([{"id": "r1a", "title": "one-a"}]))
        );
        assert!(effects
            .doc_edits
            .contains_key(&("tbl2".to_string(), "r2b".to_string())));

        // (e) nothing touches r1b.
        assert!(!effects
            .doc_edits
            .keys()
            .any(|(_, record)| record == "r1b"));
    }

    #[test]
    fn test_unlink_removes_junctions_and_backlinks() {
        let mut store = many_many_store();
        // Materialise the linked state.
        let mut tx = Transaction::begin();
        let op = easygrid_ops::Operation::from_edits(vec![AtomicEdit::insert(
            easygrid_ops::Path::field("fldL"),
            json!([{"id": "r2a", "title": "α"}]),
        )]);
        tx.apply_ops(&mut store, "tbl1", "r1a", &op, None).unwrap();
        let op = easygrid_ops::Operation::from_edits(vec![AtomicEdit::insert(
            easygrid_ops::Path::field("fldS"),
            json!([{"id": "r1a", "title": "one-a"}]),
        )]);
        tx.apply_ops(&mut store, "tbl2", "r2a", &op, None).unwrap();
        tx.insert_junction(&mut store, "jct_ls", JunctionRow::new("r1a", "r2a", None))
            .unwrap();
        tx.commit();

        let mut overlay = Overlay::new();
        let change = LinkChange {
            table_id: "tbl1".into(),
            record_id: "r1a".into(),
            field_id: "fldL".into(),
            old: json!([{"id": "r2a", "title": "α"}]),
            new: json!([]),
        };
        let effects = LinkMaintainer::apply_changes(&store, &mut overlay, &[change]).unwrap();

        assert_eq!(effects.junction_deletes.len(), 1);
        let r2a_edits = &effects.doc_edits[&("tbl2".to_string(), "r2a".to_string())];
        // The backlink cell is emptied; an empty multi cell is [].
        assert_eq!(r2a_edits[0].oi, Some(json!([])));
        assert_eq!(
            r2a_edits[0].od,
            Some(json!([{"id": "r1a", "title": "one-a"}]))
        );
    }

    #[test]
    fn test_stale_client_title_is_refreshed() {
        let store = many_many_store();
        let mut overlay = Overlay::new();
        let change = LinkChange {
            table_id: "tbl1".into(),
            record_id: "r1a".into(),
            field_id: "fldL".into(),
            old: Value::Null,
            new: json!([{"id": "r2a", "title": "stale"}]),
        };
        let effects = LinkMaintainer::apply_changes(&store, &mut overlay, &[change]).unwrap();
        let own = &effects.doc_edits[&("tbl1".to_string(), "r1a".to_string())];
        assert_eq!(own[0].oi, Some(json!([{"id": "r2a", "title": "α"}])));
    }

    #[test]
    fn test_title_fanout_preserves_order_and_peers() {
        let mut store = many_many_store();
        let mut tx = Transaction::begin();
        let op = easygrid_ops::Operation::from_edits(vec![AtomicEdit::insert(
            easygrid_ops::Path::field("fldL"),
            json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]),
        )]);
        tx.apply_ops(&mut store, "tbl1", "r1a", &op, None).unwrap();
        tx.insert_junction(&mut store, "jct_ls", JunctionRow::new("r1a", "r2a", Some(0)))
            .unwrap();
        tx.insert_junction(&mut store, "jct_ls", JunctionRow::new("r1a", "r2b", Some(1)))
            .unwrap();
        tx.commit();

        // r2a's title source changes α -> α2 inside some transaction.
        let mut overlay = Overlay::new();
        let mut fields = overlay.fields(&store, "tbl2", "r2a").unwrap();
        fields.insert("fldTitle".into(), json!("α2"));
        overlay.set("tbl2", "r2a", fields);

        let effects =
            LinkMaintainer::title_source_changed(&store, &mut overlay, "tbl2", "r2a", "fldTitle")
                .unwrap();
        let edits = &effects.doc_edits[&("tbl1".to_string(), "r1a".to_string())];
        assert_eq!(edits.len(), 1);
        // Only the r2a entry's title changed; order and the r2b entry are
        // preserved.
        assert_eq!(
            edits[0].oi,
            Some(json!([{"id": "r2a", "title": "α2"}, {"id": "r2b", "title": "β"}]))
        );
        assert_eq!(
            edits[0].od,
            Some(json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]))
        );
    }

    #[test]
    fn test_single_valued_peer_cell_is_replaced() {
        let mut store = RecordStore::new();
        let t1 = TableSchemaBuilder::new("tbl1", "One")
            .add_field(FieldSchema::concrete("fldName", "Name", ConcreteType::Text))
            .unwrap()
            .add_field(FieldSchema::new(
                "fldL",
                "Parent",
                FieldKind::Link {
                    link: easygrid_core::LinkDescriptor {
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
            .add_field(FieldSchema::new(
                "fldS",
                "Children",
                FieldKind::Link {
                    link: easygrid_core::LinkDescriptor {
                        relationship: Relationship::OneMany,
                        foreign_table_id: "tbl1".into(),
                        symmetric_field_id: Some("fldL".into()),
                        self_key_name: "__fk_fldS".into(),
                        foreign_key_name: "__fk_fldL".into(),
                        fk_host_table_name: None,
                        lookup_field_id: "fldName".into(),
                    },
                },
            ))
            .unwrap()
            .build()
            .unwrap();
        store.create_table(t1).unwrap();
        store.create_table(t2).unwrap();
        let mut tx = Transaction::begin();
        let mut r1 = Record::new("r1");
        r1.set("fldName", json!("child"));
        tx.insert_row(&mut store, "tbl1", r1).unwrap();
        let mut r2 = Record::new("r2");
        r2.set("fldTitle", json!("parent"));
        tx.insert_row(&mut store, "tbl2", r2).unwrap();
        tx.commit();

        let mut overlay = Overlay::new();
        let change = LinkChange {
            table_id: "tbl2".into(),
            record_id: "r2".into(),
            field_id: "fldS".into(),
            old: Value::Null,
            new: json!([{"id": "r1", "title": "child"}]),
        };
        let effects = LinkMaintainer::apply_changes(&store, &mut overlay, &[change]).unwrap();
        // The symmetric manyOne cell on r1 is a single object.
        let r1_edits = &effects.doc_edits[&("tbl1".to_string(), "r1".to_string())];
        assert_eq!(r1_edits[0].oi, Some(json!({"id": "r2", "title": "parent"})));
        assert!(effects.junction_inserts.is_empty());
    }
}
