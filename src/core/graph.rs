//! RW-006: Query dependency graph.
//!
//! Edges are derived fresh from a document on every pass: query `B` depends
//! on query `A` when one of `B`'s filter values references `$A` (directly or
//! as the head of a property path). `$$` escapes never create edges.
//!
//! Ordering is a depth-first post-order walk driven by an explicit stack, so
//! a pathological document cannot exhaust the call stack. Node states are
//! unvisited (absent), resolving (on the walk stack) and resolved.

use super::error::EngineError;
use super::resolver;
use super::types::DocumentSpec;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Resolving,
    Resolved,
}

/// Dependencies between the queries of one document.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// query -> queries it references, in first-reference order
    deps: IndexMap<String, Vec<String>>,
    /// query -> actions it references (`@name`)
    action_refs: IndexMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for every query in `doc`.
    ///
    /// References to names that are not queries of this document are not
    /// edges; such a query simply stays pending at execution time.
    pub fn from_document(doc: &DocumentSpec) -> Self {
        let mut graph = Self::default();
        for (name, spec) in &doc.queries {
            let filter = spec.filter_value();
            let deps = resolver::query_references(&filter)
                .into_iter()
                .filter(|dep| doc.queries.contains_key(dep))
                .collect();
            graph.deps.insert(name.clone(), deps);
            graph
                .action_refs
                .insert(name.clone(), resolver::action_references(&filter));
        }
        graph
    }

    /// Number of queries.
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Whether the graph has no queries.
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Direct dependencies of `query`.
    pub fn dependencies(&self, query: &str) -> &[String] {
        self.deps.get(query).map_or(&[], Vec::as_slice)
    }

    /// Actions referenced by `query`'s filter.
    pub fn action_references(&self, query: &str) -> &[String] {
        self.action_refs.get(query).map_or(&[], Vec::as_slice)
    }

    /// Queries whose filter references `@action`.
    pub fn queries_referencing_action(&self, action: &str) -> Vec<String> {
        self.action_refs
            .iter()
            .filter(|(_, actions)| actions.iter().any(|a| a == action))
            .map(|(query, _)| query.clone())
            .collect()
    }

    /// Execution order for every query: dependencies before dependents,
    /// otherwise document order.
    pub fn execution_order(&self) -> Result<Vec<String>, EngineError> {
        let roots: Vec<&str> = self.deps.keys().map(String::as_str).collect();
        self.order_for(&roots)
    }

    /// Execution order for `roots` and everything they transitively depend
    /// on. Used to run a query added mid-session together with its ancestors.
    pub fn order_for(&self, roots: &[&str]) -> Result<Vec<String>, EngineError> {
        let mut state: HashMap<&str, Visit> = HashMap::new();
        let mut order = Vec::new();

        for root in roots {
            let Some((root, _)) = self.deps.get_key_value(*root) else {
                return Err(EngineError::UnknownQuery(root.to_string()));
            };
            let root = root.as_str();
            if state.contains_key(root) {
                continue;
            }

            // (node, index of the next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            state.insert(root, Visit::Resolving);

            while let Some(top) = stack.len().checked_sub(1) {
                let (node, next) = stack[top];
                let deps = self.dependencies(node);
                if next < deps.len() {
                    stack[top].1 += 1;
                    let dep = deps[next].as_str();
                    match state.get(dep) {
                        Some(Visit::Resolved) => {}
                        Some(Visit::Resolving) => {
                            let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                            let mut path: Vec<String> =
                                stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                            path.push(dep.to_string());
                            return Err(EngineError::Cycle { path });
                        }
                        None => {
                            state.insert(dep, Visit::Resolving);
                            stack.push((dep, 0));
                        }
                    }
                } else {
                    state.insert(node, Visit::Resolved);
                    order.push(node.to_string());
                    stack.pop();
                }
            }
        }
        Ok(order)
    }

    /// Everything `query` transitively depends on (excluding itself).
    pub fn ancestors(&self, query: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependencies(query).iter().map(String::as_str).collect();
        while let Some(node) = stack.pop() {
            if seen.insert(node.to_string()) {
                stack.extend(self.dependencies(node).iter().map(String::as_str));
            }
        }
        seen.remove(query);
        seen
    }

    /// Queries that transitively depend on `query`, in execution order.
    pub fn dependents(&self, query: &str) -> Result<Vec<String>, EngineError> {
        let mut changed: HashSet<&str> = HashSet::from([query]);
        let mut out = Vec::new();
        for node in self.execution_order()? {
            if node == query {
                continue;
            }
            if self.dependencies(&node).iter().any(|d| changed.contains(d.as_str())) {
                if let Some((key, _)) = self.deps.get_key_value(node.as_str()) {
                    changed.insert(key.as_str());
                }
                out.push(node);
            }
        }
        Ok(out)
    }
}
