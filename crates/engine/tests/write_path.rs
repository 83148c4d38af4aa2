//! Write-path behaviour: version discipline, derived propagation, link
//! maintenance, and publication atomicity.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use easygrid_core::{
    ConcreteType, DocumentKey, FieldKind, FieldSchema, Fields, LinkDescriptor, Record,
    Relationship, TableSchemaBuilder,
};
use easygrid_engine::{CommitPublisher, WriteOrchestrator};
use easygrid_ops::Operation;
use easygrid_store::{RecordStore, Transaction};

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(DocumentKey, u64, Operation)>>,
    deleted: Mutex<Vec<DocumentKey>>,
}

impl RecordingPublisher {
    fn published(&self) -> Vec<(DocumentKey, u64, Operation)> {
        self.published.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<DocumentKey> {
        self.deleted.lock().unwrap().clone()
    }
}

impl CommitPublisher for RecordingPublisher {
    fn publish(&self, key: &DocumentKey, version: u64, op: &Operation) {
        self.published
            .lock()
            .unwrap()
            .push((key.clone(), version, op.clone()));
    }

    fn publish_deleted(&self, key: &DocumentKey) {
        self.deleted.lock().unwrap().push(key.clone());
    }
}

fn fields(pairs: &[(&str, Value)]) -> Fields {
    let mut map = Fields::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

/// A table with `fldC = fldA + fldB` and one row at version 0.
fn formula_store() -> RecordStore {
    let mut store = RecordStore::new();
    let schema = TableSchemaBuilder::new("tblX", "X")
        .add_field(FieldSchema::concrete("fldA", "A", ConcreteType::Number))
        .unwrap()
        .add_field(FieldSchema::concrete("fldB", "B", ConcreteType::Number))
        .unwrap()
        .add_field(FieldSchema::new(
            "fldC",
            "C",
            FieldKind::Formula {
                expression: "{fldA} + {fldB}".into(),
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    store.create_table(schema).unwrap();

    let mut record = Record::new("recY");
    record.set("fldA", json!(2));
    record.set("fldB", json!(3));
    record.set("fldC", json!(5));
    let mut tx = Transaction::begin();
    tx.insert_row(&mut store, "tblX", record).unwrap();
    tx.commit();
    store
}

#[tokio::test]
async fn formula_propagation_is_one_version_bump() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    orchestrator.set_publisher(publisher.clone());

    let outcome = orchestrator
        .update_record("tblX", "recY", fields(&[("fldA", json!(10))]), Some(0))
        .await
        .unwrap();

    let key = DocumentKey::for_record("tblX", "recY");
    let doc = outcome.doc(&key).unwrap();
    assert_eq!(doc.version, 1);
    // The bundle carries the primary edit and the recomputed formula.
    assert_eq!(doc.op.len(), 2);
    assert_eq!(doc.op.edits()[0].od, Some(json!(2)));
    assert_eq!(doc.op.edits()[0].oi, Some(json!(10)));
    assert_eq!(doc.op.edits()[1].od, Some(json!(5)));
    assert_eq!(doc.op.edits()[1].oi, Some(json!(13.0)));

    // Exactly one broadcast, carrying both edits.
    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1, 1);
    assert_eq!(published[0].2.len(), 2);

    // The stored row matches the committed ops.
    let record = orchestrator.get_record("tblX", "recY").await.unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.get("fldA"), Some(&json!(10)));
    assert_eq!(record.get("fldC"), Some(&json!(13.0)));
}

#[tokio::test]
async fn version_mismatch_changes_nothing() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    orchestrator.set_publisher(publisher.clone());

    let err = orchestrator
        .update_record("tblX", "recY", fields(&[("fldA", json!(10))]), Some(7))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "version_mismatch");

    let record = orchestrator.get_record("tblX", "recY").await.unwrap();
    assert_eq!(record.version, 0);
    assert_eq!(record.get("fldA"), Some(&json!(2)));
    assert!(publisher.published().is_empty());
}

#[tokio::test]
async fn invalid_cell_rejects_whole_mutation() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let err = orchestrator
        .update_record(
            "tblX",
            "recY",
            fields(&[("fldA", json!(1)), ("fldB", json!("not a number"))]),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "operation_invalid");

    let record = orchestrator.get_record("tblX", "recY").await.unwrap();
    assert_eq!(record.version, 0);
    assert_eq!(record.get("fldA"), Some(&json!(2)));
}

#[tokio::test]
async fn computed_fields_are_not_writable() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let err = orchestrator
        .update_record("tblX", "recY", fields(&[("fldC", json!(99))]), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "operation_invalid");
}

#[tokio::test]
async fn create_record_starts_at_version_one() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let (record_id, outcome) = orchestrator
        .create_record("tblX", fields(&[("fldA", json!(1)), ("fldB", json!(1))]), None)
        .await
        .unwrap();

    let key = DocumentKey::for_record("tblX", &record_id);
    assert_eq!(outcome.doc(&key).unwrap().version, 1);
    let record = orchestrator.get_record("tblX", &record_id).await.unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.get("fldC"), Some(&json!(2.0)));
}

/// Tables T1 and T2 with a symmetric manyMany link, records r1a/r1b and
/// r2a/r2b, no links yet.
fn linked_tables() -> RecordStore {
    let mut store = RecordStore::new();
    let t1 = TableSchemaBuilder::new("tbl1", "T1")
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
    let t2 = TableSchemaBuilder::new("tbl2", "T2")
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

    let mut tx = Transaction::begin();
    for (table, id, field, value) in [
        ("tbl1", "r1a", "fldName", "one-a"),
        ("tbl1", "r1b", "fldName", "one-b"),
        ("tbl2", "r2a", "fldTitle", "α"),
        ("tbl2", "r2b", "fldTitle", "β"),
    ] {
        let mut record = Record::new(id);
        record.set(field, json!(value));
        tx.insert_row(&mut store, table, record).unwrap();
    }
    tx.commit();
    store
}

#[tokio::test]
async fn many_many_link_set_maintains_everything() {
    let orchestrator = WriteOrchestrator::new(linked_tables()).unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    orchestrator.set_publisher(publisher.clone());

    let cell = json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]);
    let outcome = orchestrator
        .update_record("tbl1", "r1a", fields(&[("fldL", cell)]), None)
        .await
        .unwrap();

    // One version bump per affected document: r1a, r2a, r2b.
    assert_eq!(outcome.docs.len(), 3);
    for doc in outcome.docs.values() {
        assert_eq!(doc.version, 1);
    }
    // r1b is untouched.
    assert!(!outcome
        .docs
        .contains_key(&DocumentKey::for_record("tbl1", "r1b")));

    // Exactly two junction rows.
    let r1a = orchestrator.get_record("tbl1", "r1a").await.unwrap();
    assert_eq!(
        r1a.get("fldL"),
        Some(&json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]))
    );
    let r2a = orchestrator.get_record("tbl2", "r2a").await.unwrap();
    assert_eq!(
        r2a.get("fldS"),
        Some(&json!([{"id": "r1a", "title": "one-a"}]))
    );
    let r2b = orchestrator.get_record("tbl2", "r2b").await.unwrap();
    assert_eq!(
        r2b.get("fldS"),
        Some(&json!([{"id": "r1a", "title": "one-a"}]))
    );
    let r1b = orchestrator.get_record("tbl1", "r1b").await.unwrap();
    assert_eq!(r1b.version, 0);
    assert!(r1b.get("fldL").is_none());

    // One broadcast per affected document.
    assert_eq!(publisher.published().len(), 3);
}

#[tokio::test]
async fn title_rename_fans_out_in_one_transaction() {
    let orchestrator = WriteOrchestrator::new(linked_tables()).unwrap();
    let cell = json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]);
    orchestrator
        .update_record("tbl1", "r1a", fields(&[("fldL", cell)]), None)
        .await
        .unwrap();

    let outcome = orchestrator
        .update_record("tbl2", "r2a", fields(&[("fldTitle", json!("α2"))]), None)
        .await
        .unwrap();

    // r2a bumps for the rename, r1a bumps for the title refresh.
    let r1a_key = DocumentKey::for_record("tbl1", "r1a");
    let r1a_doc = outcome.doc(&r1a_key).unwrap();
    assert_eq!(r1a_doc.op.len(), 1);
    assert_eq!(
        r1a_doc.op.edits()[0].oi,
        Some(json!([{"id": "r2a", "title": "α2"}, {"id": "r2b", "title": "β"}]))
    );

    let r1a = orchestrator.get_record("tbl1", "r1a").await.unwrap();
    assert_eq!(
        r1a.get("fldL"),
        Some(&json!([{"id": "r2a", "title": "α2"}, {"id": "r2b", "title": "β"}]))
    );
}

#[tokio::test]
async fn unlink_cleans_junctions_and_backlinks() {
    let orchestrator = WriteOrchestrator::new(linked_tables()).unwrap();
    let cell = json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]);
    orchestrator
        .update_record("tbl1", "r1a", fields(&[("fldL", cell)]), None)
        .await
        .unwrap();

    orchestrator
        .update_record(
            "tbl1",
            "r1a",
            fields(&[("fldL", json!([{"id": "r2b", "title": "β"}]))]),
            None,
        )
        .await
        .unwrap();

    let r2a = orchestrator.get_record("tbl2", "r2a").await.unwrap();
    assert_eq!(r2a.get("fldS"), Some(&json!([])));
    let r2b = orchestrator.get_record("tbl2", "r2b").await.unwrap();
    assert_eq!(
        r2b.get("fldS"),
        Some(&json!([{"id": "r1a", "title": "one-a"}]))
    );
}

#[tokio::test]
async fn delete_record_detaches_inbound_links() {
    let orchestrator = WriteOrchestrator::new(linked_tables()).unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    orchestrator.set_publisher(publisher.clone());

    let cell = json!([{"id": "r2a", "title": "α"}]);
    orchestrator
        .update_record("tbl1", "r1a", fields(&[("fldL", cell)]), None)
        .await
        .unwrap();

    let outcome = orchestrator.delete_record("tbl2", "r2a").await.unwrap();
    assert_eq!(outcome.deleted, vec![DocumentKey::for_record("tbl2", "r2a")]);
    assert!(orchestrator.get_record("tbl2", "r2a").await.is_none());

    // r1a's cell lost the entry.
    let r1a = orchestrator.get_record("tbl1", "r1a").await.unwrap();
    assert_eq!(r1a.get("fldL"), Some(&json!([])));
    assert_eq!(publisher.deleted().len(), 1);
}

#[tokio::test]
async fn reconcile_restores_missing_junction_row_idempotently() {
    // Seed a drifted state: the cell asserts a link, the junction lost it.
    let mut store = linked_tables();
    let mut tx = Transaction::begin();
    let op = Operation::from_edits(vec![easygrid_ops::AtomicEdit::insert(
        easygrid_ops::Path::field("fldL"),
        json!([{"id": "r2a", "title": "α"}]),
    )]);
    tx.apply_ops(&mut store, "tbl1", "r1a", &op, None).unwrap();
    let op = Operation::from_edits(vec![easygrid_ops::AtomicEdit::insert(
        easygrid_ops::Path::field("fldS"),
        json!([{"id": "r1a", "title": "one-a"}]),
    )]);
    tx.apply_ops(&mut store, "tbl2", "r2a", &op, None).unwrap();
    tx.commit();

    let orchestrator = WriteOrchestrator::new(store).unwrap();
    assert!(!orchestrator.junction_contains("jct_ls", "r1a", "r2a").await);

    let outcome = orchestrator.reconcile().await.unwrap();
    assert!(outcome.docs.is_empty());
    assert!(orchestrator.junction_contains("jct_ls", "r1a", "r2a").await);

    // Second run finds nothing to repair.
    let again = orchestrator.reconcile().await.unwrap();
    assert!(again.docs.is_empty() && again.deleted.is_empty());
    assert!(orchestrator.junction_contains("jct_ls", "r1a", "r2a").await);
}

#[tokio::test]
async fn cycle_detected_at_field_creation() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    // fldD depends on fldC; fine.
    orchestrator
        .create_field(
            "tblX",
            FieldSchema::new(
                "fldD",
                "D",
                FieldKind::Formula {
                    expression: "{fldC} * 2".into(),
                },
            ),
        )
        .await
        .unwrap();

    // Redefining fldC to read fldD closes a cycle and must be refused.
    let err = orchestrator
        .update_field(
            "tblX",
            FieldSchema::new(
                "fldC",
                "C",
                FieldKind::Formula {
                    expression: "{fldD} + 1".into(),
                },
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "cycle_detected");

    // The old definition still computes.
    let record = orchestrator.get_record("tblX", "recY").await.unwrap();
    assert_eq!(record.get("fldD"), Some(&json!(10.0)));
}

#[tokio::test]
async fn field_backfill_covers_existing_records() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let outcome = orchestrator
        .create_field(
            "tblX",
            FieldSchema::new(
                "fldDouble",
                "Double",
                FieldKind::Formula {
                    expression: "{fldA} * 2".into(),
                },
            ),
        )
        .await
        .unwrap();

    let key = DocumentKey::for_record("tblX", "recY");
    assert!(outcome.doc(&key).is_some());
    let record = orchestrator.get_record("tblX", "recY").await.unwrap();
    assert_eq!(record.get("fldDouble"), Some(&json!(4.0)));
}

#[tokio::test]
async fn batch_create_is_one_publish_set() {
    let orchestrator = WriteOrchestrator::new(formula_store()).unwrap();
    let publisher = Arc::new(RecordingPublisher::default());
    orchestrator.set_publisher(publisher.clone());

    let (ids, outcome) = orchestrator
        .create_records(
            "tblX",
            vec![
                fields(&[("fldA", json!(1)), ("fldB", json!(1))]),
                fields(&[("fldA", json!(2)), ("fldB", json!(2))]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(outcome.docs.len(), 2);
    assert_eq!(publisher.published().len(), 2);

    // Published in ascending document order.
    let published = publisher.published();
    assert!(published[0].0 < published[1].0);
}

#[tokio::test]
async fn division_by_zero_is_a_value_not_an_error() {
    let mut store = RecordStore::new();
    let schema = TableSchemaBuilder::new("tblX", "X")
        .add_field(FieldSchema::concrete("fldA", "A", ConcreteType::Number))
        .unwrap()
        .add_field(FieldSchema::concrete("fldB", "B", ConcreteType::Number))
        .unwrap()
        .add_field(FieldSchema::new(
            "fldQ",
            "Quotient",
            FieldKind::Formula {
                expression: "{fldA} / {fldB}".into(),
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    store.create_table(schema).unwrap();
    let mut tx = Transaction::begin();
    let mut record = Record::new("recY");
    record.set("fldA", json!(6));
    record.set("fldB", json!(2));
    record.set("fldQ", json!(3.0));
    tx.insert_row(&mut store, "tblX", record).unwrap();
    tx.commit();

    let orchestrator = WriteOrchestrator::new(store).unwrap();
    orchestrator
        .update_record("tblX", "recY", fields(&[("fldB", json!(0))]), None)
        .await
        .unwrap();

    let record = orchestrator.get_record("tblX", "recY").await.unwrap();
    assert_eq!(record.get("fldQ"), Some(&json!({"error": "#DIV/0!"})));
}

#[tokio::test]
async fn junction_rows_exist_after_link_write() {
    let store = linked_tables();
    let orchestrator = WriteOrchestrator::new(store).unwrap();
    orchestrator
        .update_record(
            "tbl1",
            "r1a",
            fields(&[(
                "fldL",
                json!([{"id": "r2a", "title": "α"}, {"id": "r2b", "title": "β"}]),
            )]),
            None,
        )
        .await
        .unwrap();

    // Verify through the reconciler: a consistent state yields no repairs.
    let outcome = orchestrator.reconcile().await.unwrap();
    assert!(outcome.docs.is_empty() && outcome.deleted.is_empty());
}
