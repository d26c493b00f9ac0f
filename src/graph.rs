//! Dependency graph construction and topological ordering
//!
//! Derives a DAG from the `depends_on` references between descriptors and
//! produces the order the reconciler applies them in. Descriptors with no
//! mutual ordering constraint keep their original declaration order, so
//! repeated runs produce identical plans.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use thiserror::Error;

use crate::model::{ConfigError, ResourceDescriptor};

/// Errors raised while building the dependency graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency relation contains a cycle; names every participant
    #[error("cyclic dependency between descriptors: {}", ids.join(" -> "))]
    CyclicDependency { ids: Vec<String> },

    /// Descriptor-level validation failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Immutable dependency graph over one plan's descriptors
#[derive(Debug)]
pub struct DependencyGraph {
    graph: StableDiGraph<usize, ()>,
    /// Descriptor id, declaration order
    ids: Vec<String>,
    index_of: HashMap<String, NodeIndex>,
    /// Topologically sorted descriptor ids
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph and compute the apply order.
    ///
    /// Fails with [`GraphError::CyclicDependency`] if the relation is not a
    /// DAG, naming every descriptor on a cycle. Dependency references are
    /// assumed to resolve (checked by `DeploymentPlan::validate`); an
    /// unresolved reference here is still reported as a `ConfigError`.
    pub fn build(descriptors: &[ResourceDescriptor]) -> Result<Self, GraphError> {
        let mut graph = StableDiGraph::new();
        let mut ids = Vec::with_capacity(descriptors.len());
        let mut index_of = HashMap::with_capacity(descriptors.len());

        for (decl_idx, desc) in descriptors.iter().enumerate() {
            let node = graph.add_node(decl_idx);
            ids.push(desc.id.clone());
            index_of.insert(desc.id.clone(), node);
        }

        // Edges point dependency -> dependent
        for desc in descriptors {
            let to = index_of[&desc.id];
            for dep in &desc.depends_on {
                let from = *index_of.get(dep).ok_or_else(|| {
                    ConfigError::UnknownDependency {
                        id: desc.id.clone(),
                        missing: dep.clone(),
                    }
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let order = toposort_stable(&graph, &ids)?;

        Ok(Self {
            graph,
            ids,
            index_of,
            order,
        })
    }

    /// Descriptor ids in apply order (every dependency before its dependents)
    pub fn apply_order(&self) -> &[String] {
        &self.order
    }

    /// Descriptor ids in destroy order (reverse of apply order)
    pub fn destroy_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Direct dependents of a descriptor
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let Some(&node) = self.index_of.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| self.ids[self.graph[n]].clone())
            .collect()
    }

    /// All descriptors that transitively depend on `id`, in apply order.
    ///
    /// Used for bulkhead reporting: when a descriptor fails, exactly this
    /// set is skipped.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index_of.get(id) else {
            return Vec::new();
        };
        let mut reached = std::collections::HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if reached.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.order
            .iter()
            .filter(|oid| {
                self.index_of
                    .get(oid.as_str())
                    .is_some_and(|n| reached.contains(n))
            })
            .cloned()
            .collect()
    }

    /// Number of unfulfilled dependencies per descriptor id.
    ///
    /// The reconciler seeds its ready queue from the zero entries.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.ids
            .iter()
            .map(|id| {
                let node = self.index_of[id];
                let degree = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count();
                (id.clone(), degree)
            })
            .collect()
    }
}

/// Kahn's algorithm with declaration-order tie-break.
///
/// Ready nodes are drained smallest-declaration-index first, which makes the
/// output deterministic across runs regardless of hash iteration order.
fn toposort_stable(
    graph: &StableDiGraph<usize, ()>,
    ids: &[String],
) -> Result<Vec<String>, GraphError> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    // Min-heap keyed by declaration index
    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| Reverse((graph[n], n)))
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse((decl_idx, node))) = ready.pop() {
        order.push(ids[decl_idx].clone());
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            let degree = in_degree.get_mut(&next).expect("node in degree map");
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse((graph[next], next)));
            }
        }
    }

    if order.len() < ids.len() {
        return Err(GraphError::CyclicDependency {
            ids: cycle_members(graph, ids),
        });
    }
    Ok(order)
}

/// Name every descriptor participating in a cycle, in declaration order.
fn cycle_members(graph: &StableDiGraph<usize, ()>, ids: &[String]) -> Vec<String> {
    let mut members: Vec<usize> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| {
            scc.len() > 1 || scc.iter().any(|&n| graph.find_edge(n, n).is_some())
        })
        .flatten()
        .map(|n| graph[n])
        .collect();
    members.sort_unstable();
    members.into_iter().map(|i| ids[i].clone()).collect()
}
