//! Components E and F — dependency graph construction and ordering for
//! both pipeline variants: the acyclic single-pass (SPS) graph with a
//! three-color topological sort, and the cyclic multi-pass (MPS) graph
//! with Tarjan SCC discovery and execution-group sequencing.

use nlink_result::{NexusError, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// A missing dependency found during the scan in [`Graph::missing_dependencies`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub consumer_id: String,
    pub missing_id: String,
    pub version_constraint: Option<String>,
    pub optional: bool,
}

#[derive(Debug, Clone)]
struct Edge {
    target: String,
    version_constraint: Option<String>,
    optional: bool,
}

/// The acyclic (SPS) dependency graph: one node per component id, each
/// with an ordered list of dependency edges.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    order: Vec<String>,
    edges: HashMap<String, Vec<Edge>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.edges.entry(id.clone()).or_default();
        if !self.order.contains(&id) {
            self.order.push(id);
        }
    }

    pub fn add_edge(
        &mut self,
        consumer: impl Into<String>,
        dependency: impl Into<String>,
        version_constraint: Option<String>,
        optional: bool,
    ) {
        let consumer = consumer.into();
        self.add_node(consumer.clone());
        self.edges.entry(consumer).or_default().push(Edge {
            target: dependency.into(),
            version_constraint,
            optional,
        });
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Reports every edge whose target isn't a node in the graph.
    pub fn missing_dependencies(&self) -> Vec<MissingDependency> {
        let mut missing = Vec::new();
        for consumer in &self.order {
            for edge in &self.edges[consumer] {
                if !self.edges.contains_key(&edge.target) {
                    missing.push(MissingDependency {
                        consumer_id: consumer.clone(),
                        missing_id: edge.target.clone(),
                        version_constraint: edge.version_constraint.clone(),
                        optional: edge.optional,
                    });
                }
            }
        }
        missing
    }

    /// Fails with `MissingRequiredDependency` if any reported gap isn't
    /// marked optional.
    pub fn validate_dependencies_present(&self) -> Result<()> {
        for gap in self.missing_dependencies() {
            if !gap.optional {
                return Err(NexusError::MissingRequiredDependency {
                    consumer_id: gap.consumer_id,
                    missing_id: gap.missing_id,
                });
            }
        }
        Ok(())
    }

    /// Three-color DFS topological sort. Returns the load/execution
    /// sequence such that every dependency precedes its consumer.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<&str, Color> =
            self.order.iter().map(|id| (id.as_str(), Color::White)).collect();
        let mut order = Vec::with_capacity(self.order.len());

        for start in &self.order {
            if color[start.as_str()] != Color::White {
                continue;
            }
            let mut stack = vec![(start.as_str(), 0usize)];
            color.insert(start.as_str(), Color::Gray);

            while let Some((node, next_edge)) = stack.pop() {
                let edges = &self.edges[node];
                if next_edge < edges.len() {
                    let target = edges[next_edge].target.as_str();
                    stack.push((node, next_edge + 1));
                    match color.get(target).copied() {
                        Some(Color::White) => {
                            color.insert(target, Color::Gray);
                            stack.push((target, 0));
                        }
                        Some(Color::Gray) => {
                            return Err(NexusError::DependencyCycle {
                                consumer: node.to_string(),
                                dependency: target.to_string(),
                            });
                        }
                        Some(Color::Black) | None => {}
                    }
                } else {
                    color.insert(node, Color::Black);
                    order.push(node.to_string());
                }
            }
        }

        debug!(count = order.len(), "topological order computed");
        Ok(order)
    }
}

// --- MPS: cyclic graph, Tarjan SCC, execution groups -----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Forward,
    Backward,
    Bidirectional,
}

#[derive(Debug, Clone)]
pub struct TypedEdge {
    pub target: String,
    pub direction: EdgeDirection,
    pub data_format: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReentrantGraph {
    order: Vec<String>,
    reentrance_capable: HashSet<String>,
    edges: HashMap<String, Vec<TypedEdge>>,
}

impl ReentrantGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>, supports_reentrance: bool) {
        let id = id.into();
        self.edges.entry(id.clone()).or_default();
        if supports_reentrance {
            self.reentrance_capable.insert(id.clone());
        }
        if !self.order.contains(&id) {
            self.order.push(id);
        }
    }

    pub fn add_edge(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        direction: EdgeDirection,
        data_format: impl Into<String>,
    ) {
        let source = source.into();
        self.add_node(source.clone(), self.reentrance_capable.contains(&source));
        self.edges.entry(source).or_default().push(TypedEdge {
            target: target.into(),
            direction,
            data_format: data_format.into(),
        });
    }

    /// Every outgoing edge's target, regardless of direction tag —
    /// direction governs execution-order semantics, not graph
    /// connectivity, so SCC discovery must follow every edge.
    fn neighbors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.edges[id].iter().map(|e| e.target.as_str())
    }

    /// Tarjan's algorithm. Singleton components with no self-loop are
    /// trivial SCCs; everything else is a genuine cycle.
    pub fn strongly_connected_components(&self) -> Vec<Vec<String>> {
        struct TarjanState<'g> {
            graph: &'g ReentrantGraph,
            index_of: HashMap<&'g str, usize>,
            lowlink: HashMap<&'g str, usize>,
            on_stack: HashSet<&'g str>,
            stack: Vec<&'g str>,
            next_index: usize,
            sccs: Vec<Vec<String>>,
        }

        impl<'g> TarjanState<'g> {
            fn visit(&mut self, v: &'g str) {
                self.index_of.insert(v, self.next_index);
                self.lowlink.insert(v, self.next_index);
                self.next_index += 1;
                self.stack.push(v);
                self.on_stack.insert(v);

                for w in self.graph.neighbors(v) {
                    if !self.index_of.contains_key(w) {
                        self.visit(w);
                        let w_low = self.lowlink[w];
                        let v_low = self.lowlink[v];
                        self.lowlink.insert(v, v_low.min(w_low));
                    } else if self.on_stack.contains(w) {
                        let w_idx = self.index_of[w];
                        let v_low = self.lowlink[v];
                        self.lowlink.insert(v, v_low.min(w_idx));
                    }
                }

                if self.lowlink[v] == self.index_of[v] {
                    let mut component = Vec::new();
                    loop {
                        let w = self.stack.pop().unwrap();
                        self.on_stack.remove(w);
                        component.push(w.to_string());
                        if w == v {
                            break;
                        }
                    }
                    self.sccs.push(component);
                }
            }
        }

        let mut state = TarjanState {
            graph: self,
            index_of: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            next_index: 0,
            sccs: Vec::new(),
        };
        for id in &self.order {
            if !state.index_of.contains_key(id.as_str()) {
                state.visit(id.as_str());
            }
        }
        state.sccs
    }

    fn has_self_loop(&self, id: &str) -> bool {
        self.edges[id].iter().any(|e| e.target == id)
    }

    fn all_edges_forward(&self, id: &str) -> bool {
        self.edges[id]
            .iter()
            .all(|e| matches!(e.direction, EdgeDirection::Forward))
            && self
                .order
                .iter()
                .filter(|other| other.as_str() != id)
                .all(|other| {
                    self.edges[other.as_str()]
                        .iter()
                        .filter(|e| e.target == id)
                        .all(|e| matches!(e.direction, EdgeDirection::Forward))
                })
    }

    /// Rejects reentrance violations: any component in a non-trivial SCC
    /// must be flagged reentrance-capable, and a bidirectional edge is
    /// only legal between two reentrance-capable components.
    pub fn validate_reentrance(&self, sccs: &[Vec<String>]) -> Result<()> {
        for scc in sccs {
            let is_cycle = scc.len() > 1 || self.has_self_loop(&scc[0]);
            if !is_cycle {
                continue;
            }
            for id in scc {
                if !self.reentrance_capable.contains(id) {
                    return Err(NexusError::NonReentrantCycle(id.clone()));
                }
            }
        }
        for (source, edges) in &self.edges {
            for edge in edges {
                if matches!(edge.direction, EdgeDirection::Bidirectional)
                    && (!self.reentrance_capable.contains(source)
                        || !self.reentrance_capable.contains(&edge.target))
                {
                    return Err(NexusError::NonReentrantCycle(source.clone()));
                }
            }
        }
        Ok(())
    }

    /// Forms one execution group per non-trivial SCC (`has_cycles = true`)
    /// and one per trivial singleton whose incident edges are all
    /// forward-direction (`is_forward_only = true`), ordered by the
    /// topological order of the SCC condensation.
    pub fn execution_groups(&self) -> Result<Vec<ExecutionGroup>> {
        let sccs = self.strongly_connected_components();
        self.validate_reentrance(&sccs)?;

        let scc_of: HashMap<&str, usize> = sccs
            .iter()
            .enumerate()
            .flat_map(|(idx, members)| members.iter().map(move |m| (m.as_str(), idx)))
            .collect();

        let mut condensation: Graph = Graph::new();
        for idx in 0..sccs.len() {
            condensation.add_node(idx.to_string());
        }
        for (source, edges) in &self.edges {
            let source_scc = scc_of[source.as_str()];
            for edge in edges {
                let target_scc = scc_of[edge.target.as_str()];
                if source_scc != target_scc {
                    // Reverse the direction: Graph::topological_sort orders
                    // dependencies before consumers, so the condensation
                    // edge points from the later group to the earlier one.
                    condensation.add_edge(target_scc.to_string(), source_scc.to_string(), None, false);
                }
            }
        }
        let scc_order = condensation.topological_sort().map_err(|_| {
            NexusError::DependencyCycle {
                consumer: "<condensation>".to_string(),
                dependency: "<condensation>".to_string(),
            }
        })?;

        let mut groups = Vec::with_capacity(sccs.len());
        for idx_str in scc_order {
            let idx: usize = idx_str.parse().expect("condensation node ids are indices");
            let members = sccs[idx].clone();
            let has_cycles = members.len() > 1 || self.has_self_loop(&members[0]);
            let is_forward_only = !has_cycles && self.all_edges_forward(&members[0]);
            groups.push(ExecutionGroup {
                members,
                has_cycles,
                is_forward_only,
            });
        }
        Ok(groups)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub members: Vec<String>,
    pub has_cycles: bool,
    pub is_forward_only: bool,
}

/// Builds the SPS dependency graph from an ordered component id list.
pub struct GraphBuilder;

impl GraphBuilder {
    /// The placeholder construction this was generalized from: component
    /// *i* depends on component *i-1*.
    pub fn positional(component_ids: &[String]) -> Graph {
        let mut graph = Graph::new();
        for id in component_ids {
            graph.add_node(id.clone());
        }
        for pair in component_ids.windows(2) {
            graph.add_edge(pair[1].clone(), pair[0].clone(), None, false);
        }
        graph
    }

    /// Builds the graph from explicit `(consumer, dependency)` pairs
    /// instead of assuming positional adjacency.
    pub fn from_declared_edges(
        component_ids: &[String],
        declared: &[(String, String, Option<String>, bool)],
    ) -> Graph {
        let mut graph = Graph::new();
        for id in component_ids {
            graph.add_node(id.clone());
        }
        for (consumer, dependency, constraint, optional) in declared {
            graph.add_edge(consumer.clone(), dependency.clone(), constraint.clone(), *optional);
        }
        graph
    }
}

pub fn log_missing_dependencies(missing: &[MissingDependency]) {
    for gap in missing {
        if gap.optional {
            debug!(consumer = gap.consumer_id, missing = gap.missing_id, "optional dependency absent");
        } else {
            warn!(consumer = gap.consumer_id, missing = gap.missing_id, "required dependency absent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sps_topological_sort_respects_dependency_order() {
        let ids = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let graph = GraphBuilder::positional(&ids);
        let order = graph.topological_sort().unwrap();
        let index_of = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(index_of("A") < index_of("B"));
        assert!(index_of("B") < index_of("C"));
    }

    #[test]
    fn sps_dependency_cycle_is_rejected() {
        let mut graph = Graph::new();
        graph.add_edge("X", "Y", None, false);
        graph.add_edge("Y", "Z", None, false);
        graph.add_edge("Z", "X", None, false);
        let result = graph.topological_sort();
        assert!(matches!(result, Err(NexusError::DependencyCycle { .. })));
    }

    #[test]
    fn missing_optional_dependency_does_not_fail_validation() {
        let mut graph = Graph::new();
        graph.add_edge("A", "ghost", None, true);
        assert!(graph.validate_dependencies_present().is_ok());
        assert_eq!(graph.missing_dependencies().len(), 1);
    }

    #[test]
    fn missing_required_dependency_fails_validation() {
        let mut graph = Graph::new();
        graph.add_edge("A", "ghost", None, false);
        assert!(matches!(
            graph.validate_dependencies_present(),
            Err(NexusError::MissingRequiredDependency { .. })
        ));
    }

    #[test]
    fn mps_two_node_cycle_forms_one_execution_group() {
        let mut graph = ReentrantGraph::new();
        graph.add_node("P", true);
        graph.add_node("Q", true);
        graph.add_edge("P", "Q", EdgeDirection::Forward, "binary");
        graph.add_edge("Q", "P", EdgeDirection::Backward, "binary");

        let sccs = graph.strongly_connected_components();
        assert_eq!(sccs.len(), 1);
        let mut members = sccs[0].clone();
        members.sort();
        assert_eq!(members, vec!["P".to_string(), "Q".to_string()]);

        let groups = graph.execution_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].has_cycles);
        assert!(!groups[0].is_forward_only);
    }

    #[test]
    fn non_reentrant_component_in_cycle_is_rejected() {
        let mut graph = ReentrantGraph::new();
        graph.add_node("P", false);
        graph.add_node("Q", true);
        graph.add_edge("P", "Q", EdgeDirection::Forward, "binary");
        graph.add_edge("Q", "P", EdgeDirection::Backward, "binary");
        let sccs = graph.strongly_connected_components();
        assert!(matches!(
            graph.validate_reentrance(&sccs),
            Err(NexusError::NonReentrantCycle(_))
        ));
    }

    #[test]
    fn forward_only_singleton_group_is_flagged() {
        let mut graph = ReentrantGraph::new();
        graph.add_node("A", false);
        graph.add_node("B", false);
        graph.add_edge("A", "B", EdgeDirection::Forward, "binary");
        let groups = graph.execution_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| !g.has_cycles && g.is_forward_only));
    }

    #[test]
    fn every_cycle_lands_in_exactly_one_execution_group() {
        let mut graph = ReentrantGraph::new();
        graph.add_node("P", true);
        graph.add_node("Q", true);
        graph.add_node("R", false);
        graph.add_edge("P", "Q", EdgeDirection::Forward, "binary");
        graph.add_edge("Q", "P", EdgeDirection::Backward, "binary");
        graph.add_edge("Q", "R", EdgeDirection::Forward, "binary");

        let groups = graph.execution_groups().unwrap();
        let cyclic_groups: Vec<&ExecutionGroup> = groups.iter().filter(|g| g.has_cycles).collect();
        assert_eq!(cyclic_groups.len(), 1);
        let mut members = cyclic_groups[0].members.clone();
        members.sort();
        assert_eq!(members, vec!["P".to_string(), "Q".to_string()]);
    }
}
