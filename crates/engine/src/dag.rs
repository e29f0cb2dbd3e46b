//! Model validation: run this before storing or executing a process model.
//!
//! Rules enforced:
//! 1. Predecessor and successor sets reference existing nodes and mirror
//!    each other.
//! 2. Exactly one start node, without predecessors.
//! 3. End nodes have no successors; only joins have more than one
//!    predecessor; joins do not follow splits directly.
//! 4. Split and join cardinalities are consistent.
//! 5. The graph is acyclic (topological sort must succeed).
//! 6. At least one end node is reachable from the start node.
//!
//! Returns the node ids in topological order on success.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::models::{NodeKind, ProcessModel};
use crate::EngineError;

fn invalid(node_id: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidNode { node_id: node_id.to_string(), reason: reason.into() }
}

/// Validate `model` and return its nodes in topological order.
///
/// # Errors
/// - [`EngineError::UnknownNodeReference`] for dangling or asymmetric edges.
/// - [`EngineError::MissingStartNode`] / [`EngineError::MultipleStartNodes`].
/// - [`EngineError::InvalidNode`] for misplaced edges or bad cardinalities.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
/// - [`EngineError::NoReachableEnd`] if no end node can be reached.
pub fn validate_model(model: &ProcessModel) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Edge endpoints and symmetry
    // -----------------------------------------------------------------------
    for node in model.nodes.values() {
        for succ in &node.successors {
            let target = model.nodes.get(succ).ok_or_else(|| EngineError::UnknownNodeReference {
                node_id: succ.clone(),
                side: "successor",
            })?;
            if !target.predecessors.contains(&node.id) {
                return Err(invalid(succ, format!("does not list '{}' as predecessor", node.id)));
            }
        }
        for pred in &node.predecessors {
            let source = model.nodes.get(pred).ok_or_else(|| EngineError::UnknownNodeReference {
                node_id: pred.clone(),
                side: "predecessor",
            })?;
            if !source.successors.contains(&node.id) {
                return Err(invalid(pred, format!("does not list '{}' as successor", node.id)));
            }
        }
    }

    // -----------------------------------------------------------------------
    // 2. Start node
    // -----------------------------------------------------------------------
    let starts: Vec<&str> = model
        .nodes
        .values()
        .filter(|n| n.kind == NodeKind::Start)
        .map(|n| n.id.as_str())
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(EngineError::MissingStartNode),
        [only] => *only,
        many => return Err(EngineError::MultipleStartNodes(many.iter().map(|s| s.to_string()).collect())),
    };

    // -----------------------------------------------------------------------
    // 3 + 4. Per-node shape
    // -----------------------------------------------------------------------
    for node in model.nodes.values() {
        let preds = node.predecessors.len();
        let succs = node.successors.len();
        match &node.kind {
            NodeKind::Start if preds > 0 => return Err(invalid(&node.id, "start node has predecessors")),
            NodeKind::End if succs > 0 => return Err(invalid(&node.id, "end node has successors")),
            NodeKind::Split { min, max } => {
                if max < min || *max == 0 {
                    return Err(invalid(&node.id, format!("split cardinality {min}..{max} is empty")));
                }
                if *min > succs {
                    return Err(invalid(&node.id, format!("split needs {min} of only {succs} successors")));
                }
                for succ in &node.successors {
                    if model.nodes.get(succ).is_some_and(|s| s.is_join()) {
                        return Err(invalid(succ, "join directly follows a split"));
                    }
                }
            }
            NodeKind::Join { min, max } => {
                if *min == 0 || max < min || *max > preds {
                    return Err(invalid(
                        &node.id,
                        format!("join cardinality {min}..{max} does not fit {preds} predecessors"),
                    ));
                }
            }
            _ => {}
        }
        if preds > 1 && !node.is_join() {
            return Err(invalid(&node.id, "only joins may have more than one predecessor"));
        }
        if node.kind != NodeKind::Start && preds == 0 {
            return Err(invalid(&node.id, "node is unreachable: no predecessors"));
        }
    }

    // -----------------------------------------------------------------------
    // 5. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut in_degree: BTreeMap<&str, usize> = model
        .nodes
        .values()
        .map(|n| (n.id.as_str(), n.predecessors.len()))
        .collect();

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(model.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        for succ in &model.nodes[node_id].successors {
            if let Some(deg) = in_degree.get_mut(succ.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(succ.as_str());
                }
            }
        }
    }

    if sorted.len() != model.nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    // -----------------------------------------------------------------------
    // 6. Reachable end
    // -----------------------------------------------------------------------
    let mut reachable: BTreeSet<&str> = BTreeSet::new();
    let mut frontier = vec![start];
    while let Some(id) = frontier.pop() {
        if reachable.insert(id) {
            frontier.extend(model.nodes[id].successors.iter().map(String::as_str));
        }
    }
    if !model.end_nodes().any(|end| reachable.contains(end.id.as_str())) {
        return Err(EngineError::NoReachableEnd);
    }

    Ok(sorted)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::models::{ActivityDefinition, ModelBuilder, NodeId};

    fn no_successors() -> std::iter::Empty<NodeId> {
        std::iter::empty()
    }

    fn act() -> NodeKind {
        NodeKind::Activity(ActivityDefinition::new("tasklist-1".into(), "work"))
    }

    #[test]
    fn valid_linear_model_returns_sorted_order() {
        // start → a → end
        let model = ModelBuilder::new("linear", "alice".into())
            .start("start", ["a"])
            .node("a", act(), ["end"])
            .end("end")
            .build()
            .expect("should be valid");

        assert_eq!(validate_model(&model).unwrap(), vec!["start", "a", "end"]);
    }

    #[test]
    fn valid_diamond_model() {
        //     start
        //       |
        //     split
        //     /   \
        //    a     b
        //     \   /
        //     join
        //       |
        //      end
        let model = ModelBuilder::new("diamond", "alice".into())
            .start("start", ["split"])
            .split("split", 1, 2, ["a", "b"])
            .node("a", act(), ["join"])
            .node("b", act(), ["join"])
            .join("join", 2, 2, ["end"])
            .end("end")
            .build()
            .expect("should be valid");

        let sorted = validate_model(&model).unwrap();
        assert_eq!(sorted.first().unwrap(), "start");
        assert_eq!(sorted.last().unwrap(), "end");
        assert_eq!(sorted.len(), 6);
    }

    #[test]
    fn cycle_is_detected() {
        // join → a → join (back-edge), fed from start
        let mut model = ModelBuilder::new("cycle", "alice".into())
            .start("start", ["join"])
            .join("join", 1, 1, ["a"])
            .node("a", act(), ["end"])
            .end("end")
            .build()
            .unwrap();
        model.nodes.get_mut("a").unwrap().successors.insert("join".into());
        model.nodes.get_mut("join").unwrap().predecessors.insert("a".into());
        assert!(matches!(validate_model(&model), Err(EngineError::CycleDetected)));
    }

    #[test]
    fn start_node_is_required_and_unique() {
        let mut model = ModelBuilder::new("m", "alice".into()).start("s", ["e"]).end("e").build().unwrap();
        model.nodes.get_mut("s").unwrap().kind = NodeKind::Split { min: 1, max: 1 };
        assert!(matches!(validate_model(&model), Err(EngineError::MissingStartNode)));

        let result = ModelBuilder::new("m", "alice".into())
            .start("s1", ["e"])
            .start("s2", ["e"])
            .end("e")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn only_joins_merge() {
        let result = ModelBuilder::new("m", "alice".into())
            .start("s", ["split"])
            .split("split", 1, 2, ["a", "b"])
            .node("a", act(), ["e"])
            .node("b", act(), ["e"])
            .end("e")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidNode { node_id, .. }) if node_id == "e"));
    }

    #[test]
    fn end_without_successors_and_reachable() {
        let mut model = ModelBuilder::new("m", "alice".into()).start("s", ["e"]).end("e").build().unwrap();
        model.nodes.get_mut("e").unwrap().successors = BTreeSet::from(["s".to_string()]);
        assert!(validate_model(&model).is_err());

        let result = ModelBuilder::new("m", "alice".into())
            .start("s", ["a"])
            .node("a", NodeKind::Split { min: 0, max: 1 }, no_successors())
            .build();
        assert!(matches!(result, Err(EngineError::NoReachableEnd)));
    }

    #[test]
    fn cardinalities_are_checked() {
        let result = ModelBuilder::new("m", "alice".into())
            .start("s", ["split"])
            .split("split", 3, 3, ["e"])
            .end("e")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidNode { node_id, .. }) if node_id == "split"));

        let result = ModelBuilder::new("m", "alice".into())
            .start("s", ["j"])
            .join("j", 1, 2, ["e"])
            .end("e")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidNode { node_id, .. }) if node_id == "j"));
    }

    #[test]
    fn join_after_split_is_rejected() {
        let result = ModelBuilder::new("m", "alice".into())
            .start("s", ["split"])
            .split("split", 1, 1, ["j"])
            .join("j", 1, 1, ["e"])
            .end("e")
            .build();
        assert!(matches!(result, Err(EngineError::InvalidNode { node_id, .. }) if node_id == "j"));
    }
}
