// src/resolver/graph.rs

//! Dependency graph and install ordering
//!
//! Nodes are package names in the order they were added; edges point from
//! a dependent to the packages it requires. Ordering uses Kahn's algorithm
//! with ties broken by insertion order, so the same input always yields the
//! same order. Cycles do not fail: when no node is ready, the earliest
//! remaining node is placed next.

use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Dependency graph for ordering
#[derive(Debug, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// For each node, the nodes it depends on
    deps: Vec<BTreeSet<usize>>,
    /// For each node, the nodes depending on it (reverse edges)
    dependents: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package node; adding a name twice returns the existing node
    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        self.deps.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        i
    }

    /// Record that `from` needs `to` installed first
    ///
    /// Edges naming unknown packages and self-edges are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if f == t {
            return;
        }
        self.deps[f].insert(t);
        self.dependents[t].insert(f);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get all dependencies of a package
    pub fn get_dependencies(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.deps[i].iter().map(|&d| self.names[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Installation order: dependencies before dependents
    ///
    /// The second value is true when a cycle had to be broken.
    pub fn install_order(&self) -> (Vec<String>, bool) {
        let n = self.names.len();
        let mut pending: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut placed = vec![false; n];
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut broke_cycle = false;

        while order.len() < n {
            let next = match ready.pop_first() {
                Some(i) => i,
                None => {
                    let Some(i) = (0..n).find(|&i| !placed[i]) else {
                        break;
                    };
                    warn!("Dependency cycle involving '{}', breaking by input order", self.names[i]);
                    broke_cycle = true;
                    i
                }
            };
            if placed[next] {
                continue;
            }
            placed[next] = true;
            order.push(self.names[next].clone());

            for &d in &self.dependents[next] {
                if placed[d] {
                    continue;
                }
                pending[d] = pending[d].saturating_sub(1);
                if pending[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        (order, broke_cycle)
    }
}
