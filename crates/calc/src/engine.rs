//! Dirty-closure recomputation.
//!
//! Given the set of changed `(table, record, field)` cells, walk the
//! dependency graph in topological order and evaluate every affected
//! derived cell against the transaction-local overlay. Each evaluation
//! that changes a stored value yields one replace op; the results come
//! back grouped per document so the orchestrator can issue one version
//! bump per affected record.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use easygrid_core::cell::{error_value, is_error_value, ERROR_GENERIC};
use easygrid_core::{
    parse_link_cell, Aggregation, FieldId, FieldKind, RecordId, Result, TableId,
};
use easygrid_ops::AtomicEdit;
use easygrid_store::{Overlay, RecordStore};

use crate::formula::to_display_string;
use crate::graph::{DependencyGraph, NodeKey};

/// The ops produced for one document by a recomputation or maintenance
/// pass.
#[derive(Clone, Debug, PartialEq)]
pub struct DocOps {
    pub table_id: TableId,
    pub record_id: RecordId,
    pub edits: Vec<AtomicEdit>,
}

/// The calculation engine.
pub struct CalculationEngine;

impl CalculationEngine {
    /// Recomputes every derived cell dirtied by `changed`, reading and
    /// writing through the overlay. Each affected cell is evaluated at
    /// most once.
    pub fn recompute(
        store: &RecordStore,
        graph: &DependencyGraph,
        overlay: &mut Overlay,
        changed: &[(TableId, RecordId, FieldId)],
    ) -> Result<Vec<DocOps>> {
        let mut seeds: BTreeSet<NodeKey> = BTreeSet::new();
        let mut dirty: BTreeMap<NodeKey, BTreeSet<RecordId>> = BTreeMap::new();
        for (table_id, record_id, field_id) in changed {
            let node = (table_id.clone(), field_id.clone());
            seeds.insert(node.clone());
            dirty.entry(node).or_default().insert(record_id.clone());
        }

        let order = graph.dirty_closure(&seeds);
        if !order.is_empty() {
            tracing::debug!(seeds = seeds.len(), nodes = order.len(), "recomputing derived cells");
        }
        let mut out: BTreeMap<(TableId, RecordId), Vec<AtomicEdit>> = BTreeMap::new();

        for node in order {
            let (table_id, field_id) = &node;
            let schema = store.schema(table_id)?;
            let field = schema.require_field(field_id)?;

            // Records to recompute: union over this node's dirty inputs.
            let mut records: BTreeSet<RecordId> =
                dirty.get(&node).cloned().unwrap_or_default();
            for input in graph.inputs(&node) {
                let Some(input_records) = dirty.get(input) else {
                    continue;
                };
                if input.0 == *table_id {
                    records.extend(input_records.iter().cloned());
                } else if let Some(link_field_id) = field.kind.via_link_field() {
                    // Cross-table input: expand the foreign records to the
                    // records here that link to them.
                    let link_field = schema.require_field(link_field_id)?;
                    for foreign_record in input_records {
                        records.extend(store.referencing_records(
                            table_id,
                            link_field,
                            foreign_record,
                        ));
                    }
                }
            }

            let mut changed_here: BTreeSet<RecordId> = BTreeSet::new();
            for record_id in records {
                let Some(mut fields) = overlay.fields(store, table_id, &record_id) else {
                    continue;
                };
                let new = evaluate(store, graph, overlay, &node, &field.kind, &fields);
                let old = fields.get(field_id).cloned().unwrap_or(Value::Null);
                if old == new {
                    continue;
                }
                out.entry((table_id.clone(), record_id.clone()))
                    .or_default()
                    .push(AtomicEdit::set_field(field_id, old, new.clone()));
                if new.is_null() {
                    fields.remove(field_id);
                } else {
                    fields.insert(field_id.clone(), new);
                }
                overlay.set(table_id, &record_id, fields);
                changed_here.insert(record_id);
            }
            if !changed_here.is_empty() {
                dirty.insert(node, changed_here);
            }
        }

        Ok(out
            .into_iter()
            .map(|((table_id, record_id), edits)| DocOps {
                table_id,
                record_id,
                edits,
            })
            .collect())
    }
}

impl CalculationEngine {
    /// Evaluates one derived cell out of band, e.g. to backfill a freshly
    /// created field across existing records.
    pub fn evaluate_node(
        store: &RecordStore,
        graph: &DependencyGraph,
        overlay: &Overlay,
        node: &NodeKey,
        kind: &FieldKind,
        fields: &easygrid_core::Fields,
    ) -> Value {
        evaluate(store, graph, overlay, node, kind, fields)
    }
}

fn evaluate(
    store: &RecordStore,
    graph: &DependencyGraph,
    overlay: &Overlay,
    node: &NodeKey,
    kind: &FieldKind,
    fields: &easygrid_core::Fields,
) -> Value {
    match kind {
        FieldKind::Formula { .. } => match graph.formula(node) {
            Some(expr) => expr.eval(fields),
            None => error_value(ERROR_GENERIC),
        },
        FieldKind::Lookup {
            link_field_id,
            foreign_field_id,
        } => {
            let (values, multi) =
                foreign_values(store, overlay, node, fields, link_field_id, foreign_field_id);
            if multi {
                Value::Array(values)
            } else {
                values.into_iter().next().unwrap_or(Value::Null)
            }
        }
        FieldKind::Rollup {
            link_field_id,
            foreign_field_id,
            aggregation,
        } => {
            let (values, _) =
                foreign_values(store, overlay, node, fields, link_field_id, foreign_field_id);
            aggregate(*aggregation, &values)
        }
        FieldKind::Count { link_field_id } => {
            let cell = fields.get(link_field_id).cloned().unwrap_or(Value::Null);
            Value::from(parse_link_cell(&cell).len())
        }
        _ => Value::Null,
    }
}

/// Resolves the link cell and reads the named field from each linked
/// record, in link-cell order. Returns the values and whether the link is
/// multi-valued.
fn foreign_values(
    store: &RecordStore,
    overlay: &Overlay,
    node: &NodeKey,
    fields: &easygrid_core::Fields,
    link_field_id: &str,
    foreign_field_id: &str,
) -> (Vec<Value>, bool) {
    let link = store
        .schema(&node.0)
        .ok()
        .and_then(|schema| schema.field(link_field_id))
        .and_then(|field| field.as_link())
        .cloned();
    let Some(link) = link else {
        return (Vec::new(), false);
    };
    let cell = fields.get(link_field_id).cloned().unwrap_or(Value::Null);
    let values = parse_link_cell(&cell)
        .iter()
        .map(|entry| overlay.cell(store, &link.foreign_table_id, &entry.id, foreign_field_id))
        .collect();
    (values, link.is_multi())
}

fn aggregate(aggregation: Aggregation, values: &[Value]) -> Value {
    if let Some(err) = values.iter().find(|v| is_error_value(v)) {
        return err.clone();
    }
    match aggregation {
        Aggregation::Count => Value::from(values.iter().filter(|v| !v.is_null()).count()),
        Aggregation::Sum | Aggregation::Avg | Aggregation::Min | Aggregation::Max => {
            let mut numbers = Vec::new();
            for value in values {
                match value {
                    Value::Null => {}
                    Value::Number(n) => numbers.push(n.as_f64().unwrap_or(0.0)),
                    _ => return error_value(ERROR_GENERIC),
                }
            }
            if numbers.is_empty() {
                return Value::Null;
            }
            let result = match aggregation {
                Aggregation::Sum => numbers.iter().sum(),
                Aggregation::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
                Aggregation::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
                Aggregation::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                _ => unreachable!(),
            };
            serde_json::Number::from_f64(result)
                .map(Value::Number)
                .unwrap_or_else(|| error_value(ERROR_GENERIC))
        }
        Aggregation::And | Aggregation::Or => {
            let mut bools = Vec::new();
            for value in values {
                match value {
                    Value::Null => {}
                    Value::Bool(b) => bools.push(*b),
                    _ => return error_value(ERROR_GENERIC),
                }
            }
            if bools.is_empty() {
                return Value::Null;
            }
            Value::Bool(match aggregation {
                Aggregation::And => bools.iter().all(|b| *b),
                _ => bools.iter().any(|b| *b),
            })
        }
        Aggregation::Concat => {
            let mut out = String::new();
            for value in values {
                if value.is_null() {
                    continue;
                }
                match to_display_string(value) {
                    Some(s) => {
                        if !out.is_empty() {
                            out.push_str(", ");
                        }
                        out.push_str(&s);
                    }
                    None => return error_value(ERROR_GENERIC),
                }
            }
            Value::String(out)
        }
    }
}
