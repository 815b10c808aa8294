use std::collections::HashSet;

use crate::graph::Graph;
use crate::optimizer::Pass;
use crate::types::NodeId;

/// Marks every Node transitively reachable from the graph's declared
/// outputs and removes the rest.
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead_code_elimination"
    }

    fn dependencies(&self) -> &[&str] {
        &["constant_folding"]
    }

    fn run(&self, graph: &mut Graph) -> anyhow::Result<()> {
        let mut reachable: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = graph
            .declared_outputs()
            .iter()
            .filter_map(|&id| graph.value(id).and_then(|v| v.producer))
            .collect();

        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = graph.node(id) {
                for &input_id in &node.inputs {
                    if let Some(producer) = graph.value(input_id).and_then(|v| v.producer) {
                        stack.push(producer);
                    }
                }
            }
        }

        let dead: Vec<NodeId> = graph.nodes().map(|n| n.id).filter(|id| !reachable.contains(id)).collect();
        for id in dead {
            graph.remove_node(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeBag;
    use crate::tensor::Tensor;

    #[test]
    fn removes_a_node_not_feeding_any_declared_output() {
        let mut graph = Graph::new();
        let a = graph.add_value();
        graph.push_declared_input(a);

        let kept_out = graph.add_value();
        graph.add_node("Relu", "kept", &[a], &[kept_out], AttributeBag::new()).unwrap();
        graph.push_declared_output(kept_out);

        let dead_out = graph.add_value();
        graph.add_node("Relu", "dead", &[a], &[dead_out], AttributeBag::new()).unwrap();

        DeadCodeElimination.run(&mut graph).unwrap();

        assert_eq!(graph.node_count(), 1);
        assert!(graph.nodes().any(|n| n.name == "kept"));
        assert!(!graph.nodes().any(|n| n.name == "dead"));
    }

    #[test]
    fn running_twice_is_idempotent() {
        let mut graph = Graph::new();
        let a = graph.add_initializer("a", Tensor::zeros_f32(&[2]));
        graph.push_declared_input(a);
        let out = graph.add_value();
        graph.add_node("Relu", "r0", &[a], &[out], AttributeBag::new()).unwrap();
        graph.push_declared_output(out);

        DeadCodeElimination.run(&mut graph).unwrap();
        let first = graph.node_count();
        DeadCodeElimination.run(&mut graph).unwrap();
        assert_eq!(graph.node_count(), first);
    }
}
