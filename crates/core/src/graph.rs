//! Workflow graph implementation
//!
//! Workflows are represented as directed multigraphs where:
//! - Nodes are tasks (scheduling identity `id`, display `name`)
//! - Edges are keyed transitions carrying criteria and context-update
//!   directives; parallel edges between the same pair of tasks are
//!   disambiguated by a non-negative integer key
//!
//! The graph is composed once from a workflow spec and never mutated during
//! conduction.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskNode {
    /// Scheduling identity, unique within the workflow
    pub id: String,
    /// Display name; may repeat across nodes
    pub name: String,
    /// Join barrier, if the node is a join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier: Option<Barrier>,
}

/// Join barrier for a node with multiple inbound transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// All inbound transitions must be satisfied
    All,
    /// A minimum count of satisfied inbound transitions
    Count(usize),
}

impl Serialize for Barrier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Barrier::All => serializer.serialize_str("*"),
            Barrier::Count(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Barrier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::String(s) if s == "*" => Ok(Barrier::All),
            Value::Number(n) => n
                .as_u64()
                .map(|n| Barrier::Count(n as usize))
                .ok_or_else(|| serde::de::Error::custom("barrier count must be a non-negative integer")),
            _ => Err(serde::de::Error::custom("barrier must be \"*\" or an integer")),
        }
    }
}

/// A transition edge between two tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    /// Key disambiguating parallel edges between the same task pair
    pub key: usize,
    /// Criteria expressions; all must be truthy for the transition to fire
    pub criteria: Vec<String>,
    /// Context-update directives applied when the transition fires
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub publish: serde_json::Map<String, Value>,
}

/// An outbound or inbound transition paired with its endpoints
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRef {
    /// Source task id
    pub source: String,
    /// Target task id
    pub target: String,
    /// Parallel-edge key
    pub key: usize,
    /// Criteria expressions on the edge
    pub criteria: Vec<String>,
    /// Context-update directives on the edge
    pub publish: serde_json::Map<String, Value>,
}

impl TransitionRef {
    /// The transition id recorded on the source task's flow entry
    pub fn transition_id(&self) -> String {
        format!("{}__{}", self.target, self.key)
    }
}

/// The workflow graph structure
pub struct WorkflowGraph {
    /// The underlying multigraph
    graph: DiGraph<TaskNode, Transition>,
    /// Map from task id to graph index
    node_indices: HashMap<String, NodeIndex>,
    /// Ids of nodes that lie on at least one directed cycle
    cycles: OnceLock<HashSet<String>>,
}

impl WorkflowGraph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_indices: HashMap::new(),
            cycles: OnceLock::new(),
        }
    }

    /// Add a task node to the graph
    pub fn add_task(&mut self, id: &str, name: &str) -> Result<(), GraphError> {
        if self.node_indices.contains_key(id) {
            return Err(GraphError::DuplicateTask(id.to_string()));
        }

        let index = self.graph.add_node(TaskNode {
            id: id.to_string(),
            name: name.to_string(),
            barrier: None,
        });
        self.node_indices.insert(id.to_string(), index);

        Ok(())
    }

    /// Set the join barrier on a task
    pub fn set_barrier(&mut self, id: &str, barrier: Barrier) -> Result<(), GraphError> {
        let index = self.index_of(id)?;
        if let Some(node) = self.graph.node_weight_mut(index) {
            node.barrier = Some(barrier);
        }
        Ok(())
    }

    /// Add a transition edge; the parallel-edge key is assigned automatically
    pub fn add_transition(
        &mut self,
        source: &str,
        target: &str,
        criteria: Vec<String>,
        publish: serde_json::Map<String, Value>,
    ) -> Result<usize, GraphError> {
        let source_idx = self.index_of(source)?;
        let target_idx = self.index_of(target)?;

        let key = self
            .graph
            .edges(source_idx)
            .filter(|edge| edge.target() == target_idx)
            .count();

        self.graph.add_edge(
            source_idx,
            target_idx,
            Transition {
                key,
                criteria,
                publish,
            },
        );

        Ok(key)
    }

    /// Check if a task exists
    pub fn has_task(&self, id: &str) -> bool {
        self.node_indices.contains_key(id)
    }

    /// Get a task node by id
    pub fn get_task(&self, id: &str) -> Option<&TaskNode> {
        self.node_indices
            .get(id)
            .and_then(|idx| self.graph.node_weight(*idx))
    }

    /// Tasks with no inbound transitions, in insertion order
    pub fn roots(&self) -> Vec<&TaskNode> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Inbound transitions of a task
    pub fn get_prev_transitions(&self, id: &str) -> Vec<TransitionRef> {
        self.transitions_directed(id, Direction::Incoming)
    }

    /// Outbound transitions of a task
    pub fn get_next_transitions(&self, id: &str) -> Vec<TransitionRef> {
        self.transitions_directed(id, Direction::Outgoing)
    }

    fn transitions_directed(&self, id: &str, dir: Direction) -> Vec<TransitionRef> {
        let Some(idx) = self.node_indices.get(id) else {
            return Vec::new();
        };

        let mut transitions: Vec<TransitionRef> = self
            .graph
            .edges_directed(*idx, dir)
            .filter_map(|edge| {
                let source = self.graph.node_weight(edge.source())?;
                let target = self.graph.node_weight(edge.target())?;
                Some(TransitionRef {
                    source: source.id.clone(),
                    target: target.id.clone(),
                    key: edge.weight().key,
                    criteria: edge.weight().criteria.clone(),
                    publish: edge.weight().publish.clone(),
                })
            })
            .collect();

        // Edge iteration order is not stable across construction paths;
        // normalize for deterministic conduction.
        transitions.sort_by(|a, b| {
            (&a.source, &a.target, a.key).cmp(&(&b.source, &b.target, b.key))
        });

        transitions
    }

    /// Check if a task lies on at least one directed cycle
    pub fn in_cycle(&self, id: &str) -> bool {
        self.cycles
            .get_or_init(|| {
                let mut cyclic = HashSet::new();

                for component in petgraph::algo::tarjan_scc(&self.graph) {
                    let is_cycle = component.len() > 1
                        || component
                            .first()
                            .is_some_and(|&idx| self.graph.find_edge(idx, idx).is_some());

                    if is_cycle {
                        for idx in component {
                            if let Some(node) = self.graph.node_weight(idx) {
                                cyclic.insert(node.id.clone());
                            }
                        }
                    }
                }

                cyclic
            })
            .contains(id)
    }

    /// Check if a task declares a join barrier
    pub fn has_barrier(&self, id: &str) -> bool {
        self.get_task(id).is_some_and(|node| node.barrier.is_some())
    }

    /// Get the join barrier of a task
    pub fn get_barrier(&self, id: &str) -> Option<Barrier> {
        self.get_task(id).and_then(|node| node.barrier)
    }

    /// Number of tasks in the graph
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of transitions in the graph
    pub fn transition_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn index_of(&self, id: &str) -> Result<NodeIndex, GraphError> {
        self.node_indices
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::TaskNotFound(id.to_string()))
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("tasks", &self.graph.node_count())
            .field("transitions", &self.graph.edge_count())
            .finish()
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Wire form: node list plus adjacency rows parallel to it
#[derive(Serialize, Deserialize)]
struct GraphRepr {
    directed: bool,
    multigraph: bool,
    #[serde(default)]
    graph: serde_json::Map<String, Value>,
    nodes: Vec<TaskNode>,
    adjacency: Vec<Vec<AdjacencyRepr>>,
}

#[derive(Serialize, Deserialize)]
struct AdjacencyRepr {
    /// Target task id
    id: String,
    key: usize,
    criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    publish: serde_json::Map<String, Value>,
}

impl Serialize for WorkflowGraph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let nodes: Vec<TaskNode> = self
            .graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect();

        let adjacency: Vec<Vec<AdjacencyRepr>> = self
            .graph
            .node_indices()
            .map(|idx| {
                let mut row: Vec<AdjacencyRepr> = self
                    .graph
                    .edges(idx)
                    .filter_map(|edge| {
                        let target = self.graph.node_weight(edge.target())?;
                        Some(AdjacencyRepr {
                            id: target.id.clone(),
                            key: edge.weight().key,
                            criteria: edge.weight().criteria.clone(),
                            publish: edge.weight().publish.clone(),
                        })
                    })
                    .collect();
                row.sort_by(|a, b| (&a.id, a.key).cmp(&(&b.id, b.key)));
                row
            })
            .collect();

        GraphRepr {
            directed: true,
            multigraph: true,
            graph: serde_json::Map::new(),
            nodes,
            adjacency,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = GraphRepr::deserialize(deserializer)?;

        if repr.adjacency.len() != repr.nodes.len() {
            return Err(serde::de::Error::custom(
                "adjacency rows must parallel the node list",
            ));
        }

        let mut graph = WorkflowGraph::new();

        for node in &repr.nodes {
            graph
                .add_task(&node.id, &node.name)
                .map_err(serde::de::Error::custom)?;
            if let Some(barrier) = node.barrier {
                graph
                    .set_barrier(&node.id, barrier)
                    .map_err(serde::de::Error::custom)?;
            }
        }

        for (row, node) in repr.adjacency.iter().zip(&repr.nodes) {
            for edge in row {
                graph
                    .add_transition(&node.id, &edge.id, edge.criteria.clone(), edge.publish.clone())
                    .map_err(serde::de::Error::custom)?;
            }
        }

        Ok(graph)
    }
}

/// Graph-related errors
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        for id in ["task1", "task2", "task3", "task4"] {
            graph.add_task(id, id).unwrap();
        }
        graph.add_transition("task1", "task2", vec![], Default::default()).unwrap();
        graph.add_transition("task1", "task3", vec![], Default::default()).unwrap();
        graph.add_transition("task2", "task4", vec![], Default::default()).unwrap();
        graph.add_transition("task3", "task4", vec![], Default::default()).unwrap();
        graph
    }

    #[test]
    fn test_roots() {
        let graph = diamond();
        let roots: Vec<&str> = graph.roots().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(roots, vec!["task1"]);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut graph = WorkflowGraph::new();
        graph.add_task("task1", "task1").unwrap();
        assert!(matches!(
            graph.add_task("task1", "other"),
            Err(GraphError::DuplicateTask(_))
        ));
    }

    #[test]
    fn test_parallel_edge_keys() {
        let mut graph = WorkflowGraph::new();
        graph.add_task("a", "a").unwrap();
        graph.add_task("b", "b").unwrap();
        let first = graph.add_transition("a", "b", vec![], Default::default()).unwrap();
        let second = graph.add_transition("a", "b", vec![], Default::default()).unwrap();
        assert_eq!((first, second), (0, 1));

        let outbound = graph.get_next_transitions("a");
        assert_eq!(outbound.len(), 2);
        assert_eq!(outbound[0].transition_id(), "b__0");
        assert_eq!(outbound[1].transition_id(), "b__1");
    }

    #[test]
    fn test_prev_and_next_transitions() {
        let graph = diamond();
        let into_join = graph.get_prev_transitions("task4");
        assert_eq!(into_join.len(), 2);
        assert!(into_join.iter().all(|t| t.target == "task4"));

        let out_of_root = graph.get_next_transitions("task1");
        let targets: Vec<&str> = out_of_root.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, vec!["task2", "task3"]);
    }

    #[test]
    fn test_cycle_membership() {
        let mut graph = WorkflowGraph::new();
        for id in ["a", "b", "c", "d"] {
            graph.add_task(id, id).unwrap();
        }
        graph.add_transition("a", "b", vec![], Default::default()).unwrap();
        graph.add_transition("b", "c", vec![], Default::default()).unwrap();
        graph.add_transition("c", "b", vec![], Default::default()).unwrap();
        graph.add_transition("c", "d", vec![], Default::default()).unwrap();

        assert!(!graph.in_cycle("a"));
        assert!(graph.in_cycle("b"));
        assert!(graph.in_cycle("c"));
        assert!(!graph.in_cycle("d"));
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let mut graph = WorkflowGraph::new();
        graph.add_task("a", "a").unwrap();
        graph.add_transition("a", "a", vec![], Default::default()).unwrap();
        assert!(graph.in_cycle("a"));
    }

    #[test]
    fn test_barrier() {
        let mut graph = diamond();
        assert!(!graph.has_barrier("task4"));
        graph.set_barrier("task4", Barrier::All).unwrap();
        assert!(graph.has_barrier("task4"));
        assert_eq!(graph.get_barrier("task4"), Some(Barrier::All));
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut graph = diamond();
        graph.set_barrier("task4", Barrier::All).unwrap();

        let encoded = serde_json::to_value(&graph).unwrap();
        assert_eq!(encoded["directed"], true);
        assert_eq!(encoded["multigraph"], true);
        assert_eq!(encoded["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(encoded["nodes"][3]["barrier"], "*");

        let decoded: WorkflowGraph = serde_json::from_value(encoded.clone()).unwrap();
        let recoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(encoded, recoded);
    }

    #[test]
    fn test_barrier_count_serialization() {
        let encoded = serde_json::to_value(Barrier::Count(2)).unwrap();
        assert_eq!(encoded, serde_json::json!(2));
        let decoded: Barrier = serde_json::from_value(serde_json::json!("*")).unwrap();
        assert_eq!(decoded, Barrier::All);
    }
}
