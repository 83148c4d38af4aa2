//! The field dependency graph.
//!
//! Nodes are `(table, field)` pairs; an edge `u → v` means v must
//! recompute when u changes. Formula inputs are same-table edges;
//! lookup/rollup/count fields add an edge from their link field and a
//! cross-table edge from the foreign field they read. The graph is rebuilt
//! wholesale from the schema registry on any field change, and field
//! creation fails with `cycle_detected` before a cyclic graph can exist.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use easygrid_core::{Error, FieldId, FieldKind, Result, TableId, TableSchema};

use crate::formula::{parse, Expr};

/// A graph node: one field of one table.
pub type NodeKey = (TableId, FieldId);

/// Dependency graph over every registered table.
#[derive(Debug)]
pub struct DependencyGraph {
    /// u → fields that must recompute when u changes.
    dependents: BTreeMap<NodeKey, Vec<NodeKey>>,
    /// v → the inputs it reads.
    inputs: BTreeMap<NodeKey, Vec<NodeKey>>,
    /// Derived nodes, with parsed formula expressions where applicable.
    derived: BTreeSet<NodeKey>,
    formulas: BTreeMap<NodeKey, Expr>,
}

impl DependencyGraph {
    /// Builds the graph from all registered schemas.
    ///
    /// Fails with `operation_invalid` on an unparsable formula and with
    /// `cycle_detected` when derived fields form a cycle.
    pub fn build<'a>(schemas: impl Iterator<Item = &'a TableSchema>) -> Result<Self> {
        let mut graph = Self {
            dependents: BTreeMap::new(),
            inputs: BTreeMap::new(),
            derived: BTreeSet::new(),
            formulas: BTreeMap::new(),
        };

        for schema in schemas {
            for field in &schema.fields {
                let node: NodeKey = (schema.id.clone(), field.id.clone());
                match &field.kind {
                    FieldKind::Formula { expression } => {
                        let expr = parse(expression).map_err(|err| {
                            Error::operation_invalid(format!(
                                "formula {} does not parse: {}",
                                field.id, err
                            ))
                        })?;
                        for input in expr.field_refs() {
                            graph.add_edge((schema.id.clone(), input), node.clone());
                        }
                        graph.formulas.insert(node.clone(), expr);
                        graph.derived.insert(node);
                    }
                    FieldKind::Lookup {
                        link_field_id,
                        foreign_field_id,
                    }
                    | FieldKind::Rollup {
                        link_field_id,
                        foreign_field_id,
                        ..
                    } => {
                        graph.add_edge((schema.id.clone(), link_field_id.clone()), node.clone());
                        if let Some(link) = schema
                            .field(link_field_id)
                            .and_then(|f| f.as_link())
                        {
                            graph.add_edge(
                                (link.foreign_table_id.clone(), foreign_field_id.clone()),
                                node.clone(),
                            );
                        }
                        graph.derived.insert(node);
                    }
                    FieldKind::Count { link_field_id } => {
                        graph.add_edge((schema.id.clone(), link_field_id.clone()), node.clone());
                        graph.derived.insert(node);
                    }
                    _ => {}
                }
            }
        }

        for edges in graph.dependents.values_mut() {
            edges.sort();
            edges.dedup();
        }
        for edges in graph.inputs.values_mut() {
            edges.sort();
            edges.dedup();
        }

        graph.check_acyclic()?;
        Ok(graph)
    }

    fn add_edge(&mut self, from: NodeKey, to: NodeKey) {
        self.dependents.entry(from.clone()).or_default().push(to.clone());
        self.inputs.entry(to).or_default().push(from);
    }

    /// Fields that must recompute when `node` changes.
    pub fn dependents(&self, node: &NodeKey) -> &[NodeKey] {
        self.dependents.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inputs read by `node`.
    pub fn inputs(&self, node: &NodeKey) -> &[NodeKey] {
        self.inputs.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true when the node is a derived field.
    pub fn is_derived(&self, node: &NodeKey) -> bool {
        self.derived.contains(node)
    }

    /// Returns the parsed formula of a node, if it is a formula field.
    pub fn formula(&self, node: &NodeKey) -> Option<&Expr> {
        self.formulas.get(node)
    }

    /// Number of derived nodes.
    pub fn derived_count(&self) -> usize {
        self.derived.len()
    }

    /// The derived nodes reachable from `seeds`, in topological order.
    ///
    /// The order is deterministic: ties break on the node key.
    pub fn dirty_closure(&self, seeds: &BTreeSet<NodeKey>) -> Vec<NodeKey> {
        // Reachable derived nodes.
        let mut reachable: BTreeSet<NodeKey> = BTreeSet::new();
        let mut queue: VecDeque<NodeKey> = seeds.iter().cloned().collect();
        while let Some(node) = queue.pop_front() {
            for dep in self.dependents(&node) {
                if self.derived.contains(dep) && reachable.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }

        // Kahn's algorithm restricted to the reachable subgraph.
        let mut in_degree: BTreeMap<NodeKey, usize> = reachable
            .iter()
            .map(|node| {
                let degree = self
                    .inputs(node)
                    .iter()
                    .filter(|input| reachable.contains(*input))
                    .count();
                (node.clone(), degree)
            })
            .collect();

        let mut ready: BTreeSet<NodeKey> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut order = Vec::with_capacity(reachable.len());

        while let Some(node) = ready.iter().next().cloned() {
            ready.remove(&node);
            for dep in self.dependents(&node) {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dep.clone());
                    }
                }
            }
            order.push(node);
        }
        order
    }

    /// Fails with `cycle_detected` if derived fields form a cycle.
    fn check_acyclic(&self) -> Result<()> {
        // Depth-first search with white/grey/black coloring over derived
        // nodes only: concrete and link nodes have no inputs, so any cycle
        // is made entirely of derived nodes.
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut colors: BTreeMap<&NodeKey, Color> =
            self.derived.iter().map(|n| (n, Color::White)).collect();

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a NodeKey,
            colors: &mut BTreeMap<&'a NodeKey, Color>,
            path: &mut Vec<&'a NodeKey>,
        ) -> Result<()> {
            colors.insert(node, Color::Grey);
            path.push(node);
            for dep in graph.dependents(node) {
                match colors.get(dep).copied() {
                    Some(Color::Grey) => {
                        let cycle: Vec<String> = path
                            .iter()
                            .skip_while(|n| **n != dep)
                            .map(|(t, f)| format!("{}.{}", t, f))
                            .collect();
                        return Err(Error::cycle_detected(cycle.join(" -> ")));
                    }
                    Some(Color::White) => visit(graph, dep, colors, path)?,
                    _ => {}
                }
            }
            path.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        let nodes: Vec<&NodeKey> = self.derived.iter().collect();
        for node in nodes {
            if colors.get(&node) == Some(&Color::White) {
                let mut path = Vec::new();
                visit(self, node, &mut colors, &mut path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easygrid_core::{ConcreteType, FieldSchema, TableSchemaBuilder};

    fn formula_field(id: &str, expression: &str) -> FieldSchema {
        FieldSchema::new(
            id,
            format!("F {}", id),
            FieldKind::Formula {
                expression: expression.to_string(),
            },
        )
    }

    fn table_with_formula() -> TableSchema {
        TableSchemaBuilder::new("tblA", "A")
            .add_field(FieldSchema::concrete("fldA", "A", ConcreteType::Number))
            .unwrap()
            .add_field(FieldSchema::concrete("fldB", "B", ConcreteType::Number))
            .unwrap()
            .add_field(formula_field("fldC", "{fldA} + {fldB}"))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_formula_edges() {
        let schema = table_with_formula();
        let graph = DependencyGraph::build([&schema].into_iter()).unwrap();
        let node = ("tblA".to_string(), "fldC".to_string());
        assert!(graph.is_derived(&node));
        assert_eq!(
            graph.dependents(&("tblA".to_string(), "fldA".to_string())),
            &[node.clone()]
        );
        assert_eq!(graph.inputs(&node).len(), 2);
    }

    #[test]
    fn test_dirty_closure_chain_topo_order() {
        let schema = TableSchemaBuilder::new("tblA", "A")
            .add_field(FieldSchema::concrete("fldA", "A", ConcreteType::Number))
            .unwrap()
            .add_field(formula_field("fldB", "{fldA} * 2"))
            .unwrap()
            .add_field(formula_field("fldC", "{fldB} + 1"))
            .unwrap()
            .build()
            .unwrap();
        let graph = DependencyGraph::build([&schema].into_iter()).unwrap();

        let seeds: BTreeSet<NodeKey> = [("tblA".to_string(), "fldA".to_string())].into();
        let order = graph.dirty_closure(&seeds);
        assert_eq!(
            order,
            vec![
                ("tblA".to_string(), "fldB".to_string()),
                ("tblA".to_string(), "fldC".to_string())
            ]
        );
    }

    #[test]
    fn test_unrelated_fields_not_in_closure() {
        let schema = table_with_formula();
        let graph = DependencyGraph::build([&schema].into_iter()).unwrap();
        let seeds: BTreeSet<NodeKey> = [("tblA".to_string(), "fldC".to_string())].into();
        assert!(graph.dirty_closure(&seeds).is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let schema = TableSchemaBuilder::new("tblA", "A")
            .add_field(formula_field("fldA", "{fldB} + 1"))
            .unwrap()
            .add_field(formula_field("fldB", "{fldA} + 1"))
            .unwrap()
            .build()
            .unwrap();
        let err = DependencyGraph::build([&schema].into_iter()).unwrap_err();
        assert_eq!(err.code(), "cycle_detected");
    }

    #[test]
    fn test_self_cycle_detected() {
        let schema = TableSchemaBuilder::new("tblA", "A")
            .add_field(formula_field("fldA", "{fldA} + 1"))
            .unwrap()
            .build()
            .unwrap();
        let err = DependencyGraph::build([&schema].into_iter()).unwrap_err();
        assert_eq!(err.code(), "cycle_detected");
    }

    #[test]
    fn test_bad_formula_rejected() {
        let schema = TableSchemaBuilder::new("tblA", "A")
            .add_field(formula_field("fldA", "{fldB} +"))
            .unwrap()
            .build()
            .unwrap();
        assert!(DependencyGraph::build([&schema].into_iter()).is_err());
    }
}
