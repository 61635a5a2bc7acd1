/// Topological scheduling (Kahn's algorithm)
///
/// Works on a cloned indegree array; the graph itself is left untouched. The
/// frontier is a min-heap so ties always resolve to the lowest node id.

use super::graph::{Graph, NodeId};
use super::CompileError;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Full topological order over every node.
pub fn topological_order(graph: &Graph) -> Result<Vec<NodeId>, CompileError> {
    let mut indegree = graph.indegrees();
    let mut frontier: BinaryHeap<Reverse<NodeId>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| Reverse(id))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(id)) = frontier.pop() {
        order.push(id);
        for next in graph.successors(id) {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                frontier.push(Reverse(next));
            }
        }
    }

    if order.len() != graph.node_count() {
        let nodes = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .filter_map(|(id, _)| graph.node(id).map(|n| n.name.clone()))
            .collect();
        return Err(CompileError::Cycle { nodes });
    }
    Ok(order)
}

/// Operator nodes only, in execution order. Position in the returned vector is
/// the persisted schedule position.
pub fn operator_schedule(graph: &Graph) -> Result<Vec<NodeId>, CompileError> {
    Ok(topological_order(graph)?
        .into_iter()
        .filter(|&id| graph.node(id).and_then(|n| n.as_operator()).is_some())
        .collect())
}
