//! The single committed path for any mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use easygrid_calc::{CalculationEngine, DependencyGraph, NodeKey};
use easygrid_core::cell::validate_cell;
use easygrid_core::schema::validate_field;
use easygrid_core::{
    link_cell_value, parse_link_cell, DocumentKey, Error, FieldId, FieldSchema, Fields, Record,
    RecordId, Result, TableId, TableSchema,
};
use easygrid_link::{LinkChange, LinkEffects, LinkMaintainer, Reconciler};
use easygrid_ops::{AtomicEdit, EditKind, Operation, Path};
use easygrid_store::{JunctionRow, Overlay, RecordStore, Transaction};

use crate::idempotency::IdempotencyCache;
use crate::publisher::{CommitPublisher, NoopPublisher};

/// Default ceiling on one commit.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One document's share of a committed transaction.
#[derive(Clone, Debug)]
pub struct CommittedDoc {
    /// The document's version after the bump.
    pub version: u64,
    /// Primary, derived, and link edits merged, in application order.
    pub op: Operation,
}

/// Everything one committed transaction changed, keyed by document.
#[derive(Clone, Debug, Default)]
pub struct CommitOutcome {
    pub docs: BTreeMap<DocumentKey, CommittedDoc>,
    pub deleted: Vec<DocumentKey>,
}

impl CommitOutcome {
    /// Returns one document's share, if it was affected.
    pub fn doc(&self, key: &DocumentKey) -> Option<&CommittedDoc> {
        self.docs.get(key)
    }
}

/// A staged mutation, before any store state changes.
enum Mutation {
    Create {
        table_id: TableId,
        record_id: RecordId,
        data: Fields,
    },
    /// REST-style `{fieldId: value}` update; expands to whole-cell ops.
    UpdateData {
        table_id: TableId,
        record_id: RecordId,
        data: Fields,
        expected_version: Option<u64>,
    },
    /// OT-style op list.
    Update {
        table_id: TableId,
        record_id: RecordId,
        op: Operation,
        expected_version: Option<u64>,
    },
    Delete {
        table_id: TableId,
        record_id: RecordId,
    },
}

/// Work accumulated while staging a transaction. Nothing here touches the
/// store; the overlay carries every intermediate state.
#[derive(Default)]
struct Staging {
    overlay: Overlay,
    changed: Vec<(TableId, RecordId, FieldId)>,
    link_changes: BTreeMap<(TableId, RecordId, FieldId), LinkChange>,
    doc_edits: BTreeMap<DocumentKey, Vec<AtomicEdit>>,
    expected: BTreeMap<DocumentKey, u64>,
    created: BTreeSet<DocumentKey>,
    deleted: BTreeSet<DocumentKey>,
    junction_inserts: Vec<(String, JunctionRow)>,
    junction_deletes: Vec<(String, JunctionRow)>,
}

impl Staging {
    fn push_edits(&mut self, key: &DocumentKey, edits: impl IntoIterator<Item = AtomicEdit>) {
        self.doc_edits.entry(key.clone()).or_default().extend(edits);
    }
}

struct EngineState {
    store: RecordStore,
    graph: DependencyGraph,
}

/// The write orchestrator. One per process; shared behind `Arc`.
pub struct WriteOrchestrator {
    state: Mutex<EngineState>,
    publisher: parking_lot::RwLock<Arc<dyn CommitPublisher>>,
    idempotency: parking_lot::Mutex<IdempotencyCache>,
    commit_timeout: Duration,
}

impl WriteOrchestrator {
    /// Creates an orchestrator over a store, building the dependency
    /// graph from the store's registered schemas.
    pub fn new(store: RecordStore) -> Result<Self> {
        let graph = DependencyGraph::build(store.schemas())?;
        Ok(Self {
            state: Mutex::new(EngineState { store, graph }),
            publisher: parking_lot::RwLock::new(Arc::new(NoopPublisher)),
            idempotency: parking_lot::Mutex::new(IdempotencyCache::default()),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        })
    }

    /// Overrides the commit timeout (tests use short ones).
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Installs the commit publisher (the broker hub, once it exists).
    pub fn set_publisher(&self, publisher: Arc<dyn CommitPublisher>) {
        *self.publisher.write() = publisher;
    }

    // ----- reads -----

    /// Loads a document snapshot: `(data, version)`, or `None` when the
    /// row does not exist (the caller treats that as `(empty, 0)`).
    pub async fn load_document(&self, key: &DocumentKey) -> Option<(Fields, u64)> {
        let state = self.state.lock().await;
        state.store.load_row(key.table_id(), &key.doc_id)
    }

    /// Returns a record clone, for REST responses.
    pub async fn get_record(&self, table_id: &str, record_id: &str) -> Option<Record> {
        let state = self.state.lock().await;
        state.store.get_record(table_id, record_id).cloned()
    }

    /// Returns a table schema clone.
    pub async fn schema(&self, table_id: &str) -> Result<TableSchema> {
        let state = self.state.lock().await;
        state.store.schema(table_id).cloned()
    }

    /// Returns all table ids.
    pub async fn table_ids(&self) -> Vec<TableId> {
        let state = self.state.lock().await;
        state.store.schemas().map(|s| s.id.clone()).collect()
    }

    /// Serializes the store for the file-backed persistence home.
    pub async fn export_store(&self) -> Value {
        let state = self.state.lock().await;
        state.store.export()
    }

    /// Returns true when a junction table currently stores the pair.
    pub async fn junction_contains(
        &self,
        junction: &str,
        self_key: &str,
        foreign_key: &str,
    ) -> bool {
        let state = self.state.lock().await;
        state
            .store
            .junction(junction)
            .map(|j| j.contains(self_key, foreign_key))
            .unwrap_or(false)
    }

    // ----- idempotency -----

    /// Returns the cached response for an idempotency key.
    pub fn cached_response(&self, key: &str) -> Option<Value> {
        self.idempotency.lock().get(key)
    }

    /// Caches a successful response under an idempotency key.
    pub fn cache_response(&self, key: &str, response: Value) {
        self.idempotency.lock().put(key, response);
    }

    // ----- schema management -----

    /// Registers a table (startup bootstrap; table DDL proper is owned by
    /// an external collaborator).
    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        let table_id = schema.id.clone();
        let mut state = self.state.lock().await;
        state.store.create_table(schema)?;
        match DependencyGraph::build(state.store.schemas()) {
            Ok(graph) => {
                state.graph = graph;
                Ok(())
            }
            Err(err) => {
                state.store.drop_table(&table_id).ok();
                Err(err)
            }
        }
    }

    /// Creates a field. Fails with `cycle_detected` before any state
    /// changes when the field's dependencies would induce a cycle, then
    /// backfills derived values across existing records.
    pub async fn create_field(&self, table_id: &str, field: FieldSchema) -> Result<CommitOutcome> {
        validate_field(&field)?;
        let mut state = self.lock_for_commit().await?;
        let mut schema = state.store.schema(table_id)?.clone();
        if schema.field(&field.id).is_some() {
            return Err(Error::invalid_schema(format!(
                "duplicate field id: {}",
                field.id
            )));
        }
        if schema.fields.iter().any(|f| f.name == field.name) {
            return Err(Error::invalid_schema(format!(
                "duplicate field name: {}",
                field.name
            )));
        }
        schema.fields.push(field.clone());
        let graph = Self::try_graph(&state.store, &schema)?;

        state.store.set_schema(schema)?;
        state.graph = graph;
        tracing::info!(table = table_id, field = %field.id, "field created");
        self.backfill_field(&mut state, table_id, &field)
    }

    /// Updates a field definition, re-running cycle detection and the
    /// backfill.
    pub async fn update_field(&self, table_id: &str, field: FieldSchema) -> Result<CommitOutcome> {
        validate_field(&field)?;
        let mut state = self.lock_for_commit().await?;
        let mut schema = state.store.schema(table_id)?.clone();
        let slot = schema
            .fields
            .iter_mut()
            .find(|f| f.id == field.id)
            .ok_or_else(|| Error::field_not_found(table_id, &field.id))?;
        *slot = field.clone();
        let graph = Self::try_graph(&state.store, &schema)?;

        state.store.set_schema(schema)?;
        state.graph = graph;
        tracing::info!(table = table_id, field = %field.id, "field updated");
        self.backfill_field(&mut state, table_id, &field)
    }

    /// Deletes a field. Refused while other fields depend on it; clears
    /// the column from existing records first.
    pub async fn delete_field(&self, table_id: &str, field_id: &str) -> Result<CommitOutcome> {
        let mut state = self.lock_for_commit().await?;
        let mut schema = state.store.schema(table_id)?.clone();
        let field = schema
            .field(field_id)
            .cloned()
            .ok_or_else(|| Error::field_not_found(table_id, field_id))?;
        let node: NodeKey = (table_id.to_string(), field_id.to_string());
        if !state.graph.dependents(&node).is_empty() {
            return Err(Error::invalid_schema(format!(
                "field {} is an input of other fields",
                field_id
            )));
        }

        // Clear the column (and, for link fields, the relationship state)
        // while the field still exists in the schema.
        let mut staging = Staging::default();
        let record_ids = state.store.require_table(table_id)?.record_ids();
        for record_id in record_ids {
            let old = staging
                .overlay
                .cell(&state.store, table_id, &record_id, field_id);
            if old.is_null() {
                continue;
            }
            let key = DocumentKey::for_record(table_id, &record_id);
            let edit = AtomicEdit::delete(Path::field(field_id), old.clone());
            staging
                .overlay
                .apply(&state.store, table_id, &record_id, &one(&edit))?;
            staging.push_edits(&key, [edit]);
            staging
                .changed
                .push((table_id.to_string(), record_id.clone(), field_id.to_string()));
            if field.as_link().is_some() {
                staging.link_changes.insert(
                    (table_id.to_string(), record_id.clone(), field_id.to_string()),
                    LinkChange {
                        table_id: table_id.to_string(),
                        record_id: record_id.clone(),
                        field_id: field_id.to_string(),
                        old,
                        new: Value::Null,
                    },
                );
            }
        }
        let outcome = self.settle_and_commit(&mut state, staging, None)?;

        schema.fields.retain(|f| f.id != field_id);
        let graph = Self::try_graph(&state.store, &schema)?;
        state.store.set_schema(schema)?;
        state.graph = graph;
        tracing::info!(table = table_id, field = field_id, "field deleted");
        Ok(outcome)
    }

    fn try_graph(store: &RecordStore, replaced: &TableSchema) -> Result<DependencyGraph> {
        let others: Vec<&TableSchema> =
            store.schemas().filter(|s| s.id != replaced.id).collect();
        DependencyGraph::build(others.into_iter().chain([replaced]))
    }

    /// Evaluates a (re)defined derived field for every record and commits
    /// the resulting ops like any other mutation.
    fn backfill_field(
        &self,
        state: &mut EngineState,
        table_id: &str,
        field: &FieldSchema,
    ) -> Result<CommitOutcome> {
        if !field.is_computed() {
            return Ok(CommitOutcome::default());
        }
        let mut staging = Staging::default();
        let node: NodeKey = (table_id.to_string(), field.id.clone());
        let record_ids = state.store.require_table(table_id)?.record_ids();
        for record_id in record_ids {
            let Some(mut fields) = staging.overlay.fields(&state.store, table_id, &record_id)
            else {
                continue;
            };
            let value = CalculationEngine::evaluate_node(
                &state.store,
                &state.graph,
                &staging.overlay,
                &node,
                &field.kind,
                &fields,
            );
            let old = fields.get(&field.id).cloned().unwrap_or(Value::Null);
            if old == value {
                continue;
            }
            let key = DocumentKey::for_record(table_id, &record_id);
            staging.push_edits(&key, [AtomicEdit::set_field(&field.id, old, value.clone())]);
            if value.is_null() {
                fields.remove(&field.id);
            } else {
                fields.insert(field.id.clone(), value);
            }
            staging.overlay.set(table_id, &record_id, fields);
            staging
                .changed
                .push((table_id.to_string(), record_id.clone(), field.id.clone()));
        }
        self.settle_and_commit(state, staging, None)
    }

    // ----- mutations -----

    /// Broker-originated OT submission. The origin document's bundle is
    /// returned but not re-published to its own agent.
    pub async fn submit_operation(
        &self,
        key: &DocumentKey,
        expected_version: u64,
        op: Operation,
    ) -> Result<CommitOutcome> {
        let mutation = Mutation::Update {
            table_id: key.table_id().to_string(),
            record_id: key.doc_id.clone(),
            op,
            expected_version: Some(expected_version),
        };
        self.run(vec![mutation], Some(key.clone())).await
    }

    /// Creates a record; `record_id` is generated when not supplied.
    pub async fn create_record(
        &self,
        table_id: &str,
        data: Fields,
        record_id: Option<RecordId>,
    ) -> Result<(RecordId, CommitOutcome)> {
        let record_id = record_id.unwrap_or_else(new_record_id);
        let mutation = Mutation::Create {
            table_id: table_id.to_string(),
            record_id: record_id.clone(),
            data,
        };
        let outcome = self.run(vec![mutation], None).await?;
        Ok((record_id, outcome))
    }

    /// Updates a record from a REST-style `{fieldId: value}` map, with the
    /// same optimistic-concurrency failure mode as an OT submission.
    pub async fn update_record(
        &self,
        table_id: &str,
        record_id: &str,
        data: Fields,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome> {
        self.run(
            vec![Mutation::UpdateData {
                table_id: table_id.to_string(),
                record_id: record_id.to_string(),
                data,
                expected_version,
            }],
            None,
        )
        .await
    }

    /// Deletes a record, cleaning up inbound and outbound links.
    pub async fn delete_record(&self, table_id: &str, record_id: &str) -> Result<CommitOutcome> {
        self.run(
            vec![Mutation::Delete {
                table_id: table_id.to_string(),
                record_id: record_id.to_string(),
            }],
            None,
        )
        .await
    }

    /// Batch create: one transaction, one publish set.
    pub async fn create_records(
        &self,
        table_id: &str,
        rows: Vec<Fields>,
    ) -> Result<(Vec<RecordId>, CommitOutcome)> {
        let mut ids = Vec::with_capacity(rows.len());
        let mutations = rows
            .into_iter()
            .map(|data| {
                let record_id = new_record_id();
                ids.push(record_id.clone());
                Mutation::Create {
                    table_id: table_id.to_string(),
                    record_id,
                    data,
                }
            })
            .collect();
        let outcome = self.run(mutations, None).await?;
        Ok((ids, outcome))
    }

    /// Batch update.
    pub async fn update_records(
        &self,
        table_id: &str,
        rows: Vec<(RecordId, Fields, Option<u64>)>,
    ) -> Result<CommitOutcome> {
        let mutations = rows
            .into_iter()
            .map(|(record_id, data, expected_version)| Mutation::UpdateData {
                table_id: table_id.to_string(),
                record_id,
                data,
                expected_version,
            })
            .collect();
        self.run(mutations, None).await
    }

    /// Batch delete.
    pub async fn delete_records(
        &self,
        table_id: &str,
        record_ids: Vec<RecordId>,
    ) -> Result<CommitOutcome> {
        let mutations = record_ids
            .into_iter()
            .map(|record_id| Mutation::Delete {
                table_id: table_id.to_string(),
                record_id,
            })
            .collect();
        self.run(mutations, None).await
    }

    /// Runs the link-integrity reconciler and commits its repairs through
    /// the normal pipeline. Running it twice in a row is a no-op.
    pub async fn reconcile(&self) -> Result<CommitOutcome> {
        let mut state = self.lock_for_commit().await?;
        let effects = Reconciler::reconcile(&state.store)?;
        let mut staging = Staging::default();
        Self::stage_effects(&state.store, &mut staging, effects)?;
        self.settle_and_commit(&mut state, staging, None)
    }

    // ----- the pipeline -----

    async fn run(
        &self,
        mutations: Vec<Mutation>,
        origin: Option<DocumentKey>,
    ) -> Result<CommitOutcome> {
        let mut state = self.lock_for_commit().await?;
        let mut staging = Staging::default();
        for mutation in &mutations {
            Self::stage(&state.store, &mut staging, mutation)?;
        }
        self.settle_and_commit(&mut state, staging, origin)
    }

    async fn lock_for_commit(&self) -> Result<tokio::sync::MutexGuard<'_, EngineState>> {
        tokio::time::timeout(self.commit_timeout, self.state.lock())
            .await
            .map_err(|_| Error::timeout("commit lock"))
    }

    /// Validates one mutation and stages its primary ops into the overlay.
    fn stage(store: &RecordStore, staging: &mut Staging, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Create {
                table_id,
                record_id,
                data,
            } => {
                let schema = store.schema(table_id)?;
                if store.get_record(table_id, record_id).is_some() {
                    return Err(Error::operation_invalid(format!(
                        "record {} already exists",
                        record_id
                    )));
                }
                for field in schema.fields.iter().filter(|f| f.required) {
                    if data.get(&field.id).map(Value::is_null).unwrap_or(true) {
                        return Err(Error::required_field(&field.id));
                    }
                }
                let mut edits = Vec::new();
                for (field_id, value) in data {
                    let field = schema.require_field(field_id)?;
                    validate_cell(field, value)?;
                    if !value.is_null() {
                        edits.push(AtomicEdit::insert(Path::field(field_id), value.clone()));
                    }
                }
                let key = DocumentKey::for_record(table_id, record_id);
                staging.overlay.create(table_id, record_id);
                staging.overlay.apply(
                    store,
                    table_id,
                    record_id,
                    &Operation::from_edits(edits.clone()),
                )?;
                staging.created.insert(key.clone());
                staging.expected.insert(key.clone(), 0);
                staging.push_edits(&key, edits);
                for (field_id, value) in data {
                    staging
                        .changed
                        .push((table_id.clone(), record_id.clone(), field_id.clone()));
                    let field = schema.require_field(field_id)?;
                    if field.as_link().is_some() && !value.is_null() {
                        staging.link_changes.insert(
                            (table_id.clone(), record_id.clone(), field_id.clone()),
                            LinkChange {
                                table_id: table_id.clone(),
                                record_id: record_id.clone(),
                                field_id: field_id.clone(),
                                old: Value::Null,
                                new: value.clone(),
                            },
                        );
                    }
                }
                Ok(())
            }
            Mutation::UpdateData {
                table_id,
                record_id,
                data,
                expected_version,
            } => {
                let schema = store.schema(table_id)?;
                let mut edits = Vec::new();
                for (field_id, value) in data {
                    let field = schema.require_field(field_id)?;
                    validate_cell(field, value)?;
                    let old = staging.overlay.cell(store, table_id, record_id, field_id);
                    if old == *value {
                        continue;
                    }
                    edits.push(AtomicEdit::set_field(field_id, old, value.clone()));
                }
                Self::stage(
                    store,
                    staging,
                    &Mutation::Update {
                        table_id: table_id.clone(),
                        record_id: record_id.clone(),
                        op: Operation::from_edits(edits),
                        expected_version: *expected_version,
                    },
                )
            }
            Mutation::Update {
                table_id,
                record_id,
                op,
                expected_version,
            } => {
                let schema = store.schema(table_id)?;
                let exists = store.get_record(table_id, record_id).is_some()
                    || staging.overlay.is_created(table_id, record_id);
                if !exists {
                    return Err(Error::record_not_found(table_id, record_id));
                }
                if let Some(expected) = expected_version {
                    let current = store
                        .get_record(table_id, record_id)
                        .map(|r| r.version)
                        .unwrap_or(0);
                    if *expected != current {
                        return Err(Error::version_mismatch(*expected, current));
                    }
                }
                let key = DocumentKey::for_record(table_id, record_id);

                // Validate each edit and capture link-cell pre-images.
                for edit in op.edits() {
                    let field_id = edit
                        .p
                        .field_id()
                        .ok_or_else(|| {
                            Error::operation_invalid(format!(
                                "op path {} does not address a field",
                                edit.p
                            ))
                        })?
                        .clone();
                    let field = schema.require_field(&field_id)?;
                    if field.is_computed() {
                        return Err(Error::operation_invalid(format!(
                            "field {} is computed and cannot be written",
                            field_id
                        )));
                    }
                    if edit.p.is_whole_field() {
                        if let Some(oi) = &edit.oi {
                            validate_cell(field, oi)?;
                        }
                        if field.required && matches!(edit.kind()?, EditKind::Delete) {
                            return Err(Error::required_field(&field_id));
                        }
                    }
                    let link_key = (table_id.clone(), record_id.clone(), field_id.clone());
                    if field.as_link().is_some() && !staging.link_changes.contains_key(&link_key) {
                        let old = staging.overlay.cell(store, table_id, record_id, &field_id);
                        staging.link_changes.insert(
                            link_key,
                            LinkChange {
                                table_id: table_id.clone(),
                                record_id: record_id.clone(),
                                field_id: field_id.clone(),
                                old,
                                new: Value::Null,
                            },
                        );
                    }
                    staging
                        .changed
                        .push((table_id.clone(), record_id.clone(), field_id));
                }

                staging.overlay.apply(store, table_id, record_id, op)?;

                // Record the post-apply state of every touched link cell.
                let touched: Vec<(TableId, RecordId, FieldId)> = staging
                    .link_changes
                    .keys()
                    .filter(|(t, r, _)| t == table_id && r == record_id)
                    .cloned()
                    .collect();
                for link_key in touched {
                    let new = staging.overlay.cell(store, table_id, record_id, &link_key.2);
                    if let Some(change) = staging.link_changes.get_mut(&link_key) {
                        change.new = new;
                    }
                }

                if let Some(expected) = expected_version {
                    staging.expected.entry(key.clone()).or_insert(*expected);
                }
                staging.push_edits(&key, op.edits().iter().cloned());
                Ok(())
            }
            Mutation::Delete {
                table_id,
                record_id,
            } => {
                let schema = store.schema(table_id)?;
                let record = store
                    .get_record(table_id, record_id)
                    .ok_or_else(|| Error::record_not_found(table_id, record_id))?
                    .clone();
                let key = DocumentKey::for_record(table_id, record_id);
                staging.deleted.insert(key);

                // Outbound links: clearing our cells detaches peers.
                for field in schema.link_fields() {
                    let old = record.get_or_null(&field.id);
                    if old.is_null() {
                        continue;
                    }
                    staging.link_changes.insert(
                        (table_id.clone(), record_id.clone(), field.id.clone()),
                        LinkChange {
                            table_id: table_id.clone(),
                            record_id: record_id.clone(),
                            field_id: field.id.clone(),
                            old,
                            new: Value::Null,
                        },
                    );
                }

                // Inbound links: every cell referencing this record loses
                // its entry.
                let inbound: Vec<(TableId, FieldSchema)> = store
                    .schemas()
                    .flat_map(|s| {
                        s.link_fields()
                            .filter(|f| {
                                f.as_link().is_some_and(|l| l.foreign_table_id == *table_id)
                            })
                            .cloned()
                            .map(|f| (s.id.clone(), f))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                for (owner_table, field) in inbound {
                    for owner in store.referencing_records(&owner_table, &field, record_id) {
                        if staging
                            .deleted
                            .contains(&DocumentKey::for_record(&owner_table, &owner))
                        {
                            continue;
                        }
                        let old = staging.overlay.cell(store, &owner_table, &owner, &field.id);
                        let entries: Vec<_> = parse_link_cell(&old)
                            .into_iter()
                            .filter(|e| e.id != *record_id)
                            .collect();
                        let link = field.as_link().expect("link fields only");
                        let new = link_cell_value(&entries, link.is_multi());
                        if new == old {
                            continue;
                        }
                        let edit = AtomicEdit::set_field(&field.id, old.clone(), new.clone());
                        staging
                            .overlay
                            .apply(store, &owner_table, &owner, &one(&edit))?;
                        let owner_key = DocumentKey::for_record(&owner_table, &owner);
                        staging.push_edits(&owner_key, [edit]);
                        staging
                            .changed
                            .push((owner_table.clone(), owner.clone(), field.id.clone()));
                        staging.link_changes.insert(
                            (owner_table.clone(), owner.clone(), field.id.clone()),
                            LinkChange {
                                table_id: owner_table.clone(),
                                record_id: owner.clone(),
                                field_id: field.id.clone(),
                                old,
                                new,
                            },
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Folds precomputed link effects (the reconciler's repairs) into the
    /// staging area.
    fn stage_effects(
        store: &RecordStore,
        staging: &mut Staging,
        effects: LinkEffects,
    ) -> Result<()> {
        for ((table_id, record_id), edits) in effects.doc_edits {
            let key = DocumentKey::for_record(&table_id, &record_id);
            for edit in edits {
                staging.overlay.apply(store, &table_id, &record_id, &one(&edit))?;
                if let Some(field_id) = edit.p.field_id() {
                    staging
                        .changed
                        .push((table_id.clone(), record_id.clone(), field_id.clone()));
                }
                staging.push_edits(&key, [edit]);
            }
        }
        staging.junction_inserts.extend(effects.junction_inserts);
        staging.junction_deletes.extend(effects.junction_deletes);
        Ok(())
    }

    /// Runs calculation and link maintenance over the staged primary ops,
    /// persists everything in one transaction, and publishes on commit.
    fn settle_and_commit(
        &self,
        state: &mut EngineState,
        mut staging: Staging,
        origin: Option<DocumentKey>,
    ) -> Result<CommitOutcome> {
        // Derived pass over the primary changes.
        let derived = CalculationEngine::recompute(
            &state.store,
            &state.graph,
            &mut staging.overlay,
            &staging.changed,
        )?;
        let mut derived_changed: Vec<(TableId, RecordId, FieldId)> = Vec::new();
        for doc in derived {
            let key = DocumentKey::for_record(&doc.table_id, &doc.record_id);
            if staging.deleted.contains(&key) {
                continue;
            }
            for edit in &doc.edits {
                if let Some(field_id) = edit.p.field_id() {
                    derived_changed.push((
                        doc.table_id.clone(),
                        doc.record_id.clone(),
                        field_id.clone(),
                    ));
                }
            }
            staging.push_edits(&key, doc.edits);
        }

        // Link maintenance: symmetric cells, junctions, titles.
        let link_changes: Vec<LinkChange> = staging.link_changes.values().cloned().collect();
        let mut effects =
            LinkMaintainer::apply_changes(&state.store, &mut staging.overlay, &link_changes)?;
        let mut title_seeds = staging.changed.clone();
        title_seeds.extend(derived_changed.iter().cloned());
        title_seeds.sort();
        title_seeds.dedup();
        for (table_id, record_id, field_id) in &title_seeds {
            let fanout = LinkMaintainer::title_source_changed(
                &state.store,
                &mut staging.overlay,
                table_id,
                record_id,
                field_id,
            )?;
            effects.merge(fanout);
        }

        let mut link_changed: Vec<(TableId, RecordId, FieldId)> = Vec::new();
        for ((table_id, record_id), edits) in &effects.doc_edits {
            let key = DocumentKey::for_record(table_id, record_id);
            if staging.deleted.contains(&key) {
                continue;
            }
            for edit in edits {
                if let Some(field_id) = edit.p.field_id() {
                    link_changed.push((table_id.clone(), record_id.clone(), field_id.clone()));
                }
            }
            staging.push_edits(&key, edits.clone());
        }

        // Second derived pass for cells dirtied by link maintenance only;
        // the first pass already covered the whole closure of the primary
        // changes.
        let mut seeds = link_changed;
        seeds.sort();
        seeds.dedup();
        let derived2 =
            CalculationEngine::recompute(&state.store, &state.graph, &mut staging.overlay, &seeds)?;
        for doc in derived2 {
            let key = DocumentKey::for_record(&doc.table_id, &doc.record_id);
            if staging.deleted.contains(&key) {
                continue;
            }
            staging.push_edits(&key, doc.edits);
        }

        staging.junction_inserts.extend(effects.junction_inserts);
        staging.junction_deletes.extend(effects.junction_deletes);

        // Persist. Any failure rolls back the whole transaction.
        let mut tx = Transaction::begin();
        let outcome = match Self::persist(&mut tx, state, &staging) {
            Ok(outcome) => outcome,
            Err(err) => {
                tx.rollback(&mut state.store);
                tracing::warn!(error = %err, "mutation rolled back");
                return Err(err);
            }
        };
        tx.commit();

        // Publish on the commit hook, in document order, while still
        // serialised against the next commit.
        let publisher = self.publisher.read().clone();
        for (key, doc) in &outcome.docs {
            if origin.as_ref() == Some(key) {
                continue;
            }
            publisher.publish(key, doc.version, &doc.op);
        }
        for key in &outcome.deleted {
            publisher.publish_deleted(key);
        }
        Ok(outcome)
    }

    fn persist(
        tx: &mut Transaction,
        state: &mut EngineState,
        staging: &Staging,
    ) -> Result<CommitOutcome> {
        let mut outcome = CommitOutcome::default();

        for key in &staging.created {
            tx.insert_row(
                &mut state.store,
                key.table_id(),
                Record::new(key.doc_id.clone()),
            )?;
        }

        for (key, edits) in &staging.doc_edits {
            if staging.deleted.contains(key) {
                continue;
            }
            let op = Operation::from_edits(edits.clone());
            if op.is_empty() {
                continue;
            }
            let expected = staging.expected.get(key).copied();
            let version =
                tx.apply_ops(&mut state.store, key.table_id(), &key.doc_id, &op, expected)?;
            outcome.docs.insert(key.clone(), CommittedDoc { version, op });
        }

        for (junction, row) in &staging.junction_inserts {
            tx.insert_junction(&mut state.store, junction, row.clone())?;
        }
        for (junction, row) in &staging.junction_deletes {
            tx.delete_junction(&mut state.store, junction, &row.self_key, &row.foreign_key)?;
        }

        for key in &staging.deleted {
            tx.delete_row(&mut state.store, key.table_id(), &key.doc_id)?;
            outcome.deleted.push(key.clone());
        }

        Ok(outcome)
    }
}

/// Wraps one edit as an operation.
fn one(edit: &AtomicEdit) -> Operation {
    Operation::from_edits(vec![edit.clone()])
}

/// Generates a record id.
fn new_record_id() -> RecordId {
    format!("rec{}", uuid::Uuid::new_v4().simple())
}
