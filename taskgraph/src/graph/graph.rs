//! Label-keyed directed graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::validation::{validate_dag, Adjacency};
use crate::errors::StructuralError;

/// A dependency edge: `left` depends on `right` under symbolic `name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// The depending node.
    pub left: String,
    /// The node depended on.
    pub right: String,
    /// The symbolic dependency name.
    pub name: String,
}

impl Edge {
    /// Creates an edge.
    #[must_use]
    pub fn new(left: impl Into<String>, right: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            name: name.into(),
        }
    }
}

/// An immutable directed graph of labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeSet<String>,
    edges: BTreeSet<Edge>,
}

impl Graph {
    /// Creates a graph. Edges may reference nodes outside `nodes`; use
    /// [`crate::graph::TaskGraph::build`] for a checked graph.
    #[must_use]
    pub fn new(nodes: BTreeSet<String>, edges: BTreeSet<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Returns the nodes.
    #[must_use]
    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    /// Returns the edges.
    #[must_use]
    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    /// Node to the set of nodes it depends on.
    #[must_use]
    pub fn links(&self) -> Adjacency {
        let mut links: Adjacency = self.nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for edge in &self.edges {
            links.entry(edge.left.clone()).or_default().insert(edge.right.clone());
        }
        links
    }

    /// Node to the set of nodes that depend on it.
    #[must_use]
    pub fn reverse_links(&self) -> Adjacency {
        let mut links: Adjacency = self.nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
        for edge in &self.edges {
            links.entry(edge.right.clone()).or_default().insert(edge.left.clone());
        }
        links
    }

    /// Node to `{name: dependency}`.
    #[must_use]
    pub fn named_links(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut links: BTreeMap<String, BTreeMap<String, String>> =
            self.nodes.iter().map(|n| (n.clone(), BTreeMap::new())).collect();
        for edge in &self.edges {
            links
                .entry(edge.left.clone())
                .or_default()
                .insert(edge.name.clone(), edge.right.clone());
        }
        links
    }

    /// Returns the subgraph reachable from `seeds`.
    ///
    /// With `reverse == false` this follows dependency edges (everything the
    /// seeds require); with `reverse == true` it follows them backwards
    /// (everything that depends on the seeds). Seeds are included.
    ///
    /// # Errors
    ///
    /// Returns `StructuralError::MissingLabel` for a seed outside the graph,
    /// and `StructuralError::Cycle` if the reached subgraph is cyclic.
    pub fn transitive_closure<I, S>(&self, seeds: I, reverse: bool) -> Result<Self, StructuralError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let links = if reverse { self.reverse_links() } else { self.links() };

        let mut reached = BTreeSet::new();
        let mut queue = VecDeque::new();
        for seed in seeds {
            let seed = seed.as_ref();
            if !self.nodes.contains(seed) {
                return Err(StructuralError::missing_label(seed, "graph"));
            }
            if reached.insert(seed.to_string()) {
                queue.push_back(seed.to_string());
            }
        }

        while let Some(node) = queue.pop_front() {
            for next in links.get(&node).into_iter().flatten() {
                if reached.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }

        let edges = self
            .edges
            .iter()
            .filter(|e| reached.contains(&e.left) && reached.contains(&e.right))
            .cloned()
            .collect();
        let closure = Self::new(reached, edges);
        validate_dag(&closure.links())?;
        Ok(closure)
    }

    /// Returns the nodes with dependencies before dependents.
    ///
    /// # Errors
    ///
    /// Returns `StructuralError::Cycle` if the graph is cyclic.
    pub fn visit_postorder(&self) -> Result<Vec<String>, StructuralError> {
        Ok(self.waves()?.into_iter().flatten().collect())
    }

    /// Groups nodes into topological levels: every node's dependencies lie
    /// in strictly earlier waves. Within a wave nodes are sorted.
    ///
    /// # Errors
    ///
    /// Returns `StructuralError::Cycle` if the graph is cyclic.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, StructuralError> {
        let links = self.links();
        let reverse = self.reverse_links();
        let mut pending: BTreeMap<&str, usize> = links
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.iter().filter(|d| links.contains_key(*d)).count()))
            .collect();

        let mut waves = Vec::new();
        let mut ready: Vec<String> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| (*node).to_string())
            .collect();
        let mut emitted = 0;

        while !ready.is_empty() {
            emitted += ready.len();
            let mut next = BTreeSet::new();
            for node in &ready {
                pending.remove(node.as_str());
                for dependent in reverse.get(node).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(dependent.clone());
                        }
                    }
                }
            }
            waves.push(std::mem::take(&mut ready));
            ready = next.into_iter().collect();
        }

        if emitted < links.len() {
            validate_dag(&links)?;
        }
        Ok(waves)
    }
}
