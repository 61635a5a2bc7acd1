/// Compiled workflow graph
///
/// An arena of operator and data nodes addressed by integer id (the petgraph
/// `NodeIndex`), with edges data → operator for inputs and operator → data for
/// outputs. Never mutated after compilation.

use super::operators::{Operator, OperatorParams};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNode {
    pub operator: Operator,
    pub params: OperatorParams,
    /// Input variables in argument order.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// 1-based statement the node was compiled from.
    pub statement: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Operator(OperatorNode),
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn as_operator(&self) -> Option<&OperatorNode> {
        match &self.kind {
            NodeKind::Operator(op) => Some(op),
            NodeKind::Data => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Operator(_) => "operator",
            NodeKind::Data => "data",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    inner: DiGraph<Node, ()>,
    data_nodes: HashMap<String, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_operator(&mut self, op: OperatorNode) -> NodeId {
        let name = format!("{}_{}", op.operator, op.statement);
        self.inner
            .add_node(Node {
                name,
                kind: NodeKind::Operator(op),
            })
            .index()
    }

    /// Data node for `variable`, reusing the existing one when the variable is rebound.
    pub fn data_node(&mut self, variable: &str) -> NodeId {
        if let Some(idx) = self.data_nodes.get(variable) {
            return idx.index();
        }
        let idx = self.inner.add_node(Node {
            name: variable.to_string(),
            kind: NodeKind::Data,
        });
        self.data_nodes.insert(variable.to_string(), idx);
        idx.index()
    }

    pub fn add_edge(&mut self, origin: NodeId, destination: NodeId) {
        self.inner
            .update_edge(NodeIndex::new(origin), NodeIndex::new(destination), ());
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.inner.node_weight(NodeIndex::new(id))
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.inner
            .node_indices()
            .map(move |idx| (idx.index(), &self.inner[idx]))
    }

    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.inner
            .edge_indices()
            .filter_map(move |e| self.inner.edge_endpoints(e))
            .map(|(a, b)| (a.index(), b.index()))
    }

    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.inner
            .neighbors_directed(NodeIndex::new(id), Direction::Outgoing)
            .map(|idx| idx.index())
    }

    /// Indegree per node id. The scheduler works on a copy of this.
    pub fn indegrees(&self) -> Vec<usize> {
        self.inner
            .node_indices()
            .map(|idx| {
                self.inner
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
            })
            .collect()
    }

    /// Rebuild from persisted rows. Ids must be dense and in insertion order.
    pub fn from_parts(nodes: Vec<Node>, edges: &[(NodeId, NodeId)]) -> Self {
        let mut graph = Graph::new();
        for node in nodes {
            let is_data = matches!(node.kind, NodeKind::Data);
            let name = node.name.clone();
            let idx = graph.inner.add_node(node);
            if is_data {
                graph.data_nodes.insert(name, idx);
            }
        }
        for &(a, b) in edges {
            if a < graph.node_count() && b < graph.node_count() {
                graph.add_edge(a, b);
            }
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(statement: usize, out: &str) -> OperatorNode {
        OperatorNode {
            operator: Operator::ReadTable,
            params: OperatorParams::ReadTable {
                file: "a.csv".into(),
            },
            inputs: vec![],
            outputs: vec![out.into()],
            statement,
        }
    }

    #[test]
    fn data_nodes_are_reused_and_edges_deduplicated() {
        let mut g = Graph::new();
        let op = g.add_operator(read(1, "A"));
        let a1 = g.data_node("A");
        let a2 = g.data_node("A");
        assert_eq!(a1, a2);
        g.add_edge(op, a1);
        g.add_edge(op, a1);
        assert_eq!(g.edges().count(), 1);
        assert_eq!(g.node(op).unwrap().name, "read_table_1");
        assert_eq!(g.indegrees(), vec![0, 1]);
    }

    #[test]
    fn node_serializes_with_kind_tag() {
        let node = Node {
            name: "A".into(),
            kind: NodeKind::Data,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "data");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
