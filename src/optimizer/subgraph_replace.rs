use crate::graph::Graph;
use crate::optimizer::Pass;
use crate::types::{NodeId, ValueId};

const MAX_ITERATIONS: usize = 5;
const ZERO_TOLERANCE: f32 = 1e-6;

/// Simplifies `Add(0, X)` and `Add(X, 0)` into a direct reference to
/// `X`, where the zero side is an initializer whose every element is
/// within `ZERO_TOLERANCE` of zero. Runs to a fixpoint, capped at
/// `MAX_ITERATIONS` rewrites.
#[derive(Default)]
pub struct SubgraphReplacement;

impl Pass for SubgraphReplacement {
    fn name(&self) -> &str {
        "subgraph_replacement"
    }

    fn dependencies(&self) -> &[&str] {
        &["dead_code_elimination"]
    }

    fn run(&self, graph: &mut Graph) -> anyhow::Result<()> {
        for _ in 0..MAX_ITERATIONS {
            if !self.run_one_pass(graph)? {
                break;
            }
        }
        Ok(())
    }
}

impl SubgraphReplacement {
    fn run_one_pass(&self, graph: &mut Graph) -> anyhow::Result<bool> {
        let candidates: Vec<NodeId> = graph.nodes().filter(|n| n.op_type == "Add").map(|n| n.id).collect();

        for id in candidates {
            let node = graph.node(id).unwrap().clone();
            if node.inputs.len() != 2 || node.outputs.len() != 1 {
                continue;
            }
            let Some(zero_idx) = node.inputs.iter().position(|&vid| is_elementwise_zero(graph, vid)) else {
                continue;
            };
            let keep = node.inputs[1 - zero_idx];
            let produced = node.outputs[0];

            graph.remove_node(id)?;
            replace_value_everywhere(graph, produced, keep)?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn is_elementwise_zero(graph: &Graph, id: ValueId) -> bool {
    let Some(value) = graph.value(id) else { return false };
    if !value.is_initializer {
        return false;
    }
    let Some(tensor) = &value.tensor else { return false };
    match tensor.to_f32() {
        Ok(arr) => arr.iter().all(|&v| v.abs() <= ZERO_TOLERANCE),
        Err(_) => false,
    }
}

/// Rewrites every consumer of `old` to consume `new` instead, then
/// tombstones `old` (no node references it any more, so this cannot
/// violate connectivity).
fn replace_value_everywhere(graph: &mut Graph, old: ValueId, new: ValueId) -> anyhow::Result<()> {
    let consumer_ids: Vec<NodeId> = graph.value(old).map(|v| v.consumers.clone()).unwrap_or_default();

    for node_id in consumer_ids {
        if let Some(node) = graph.node_mut(node_id) {
            for input in node.inputs.iter_mut() {
                if *input == old {
                    *input = new;
                }
            }
        }
        if let Some(new_value) = graph.value_mut(new) {
            if !new_value.consumers.contains(&node_id) {
                new_value.consumers.push(node_id);
            }
        }
    }

    if graph.declared_outputs().contains(&old) {
        let outputs: Vec<ValueId> = graph.declared_outputs().iter().map(|&v| if v == old { new } else { v }).collect();
        graph.set_declared_outputs(outputs);
    }

    graph.remove_value(old)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeBag;
    use crate::tensor::Tensor;

    #[test]
    fn add_with_zero_initializer_collapses_to_the_other_input() {
        let mut graph = Graph::new();
        let x = graph.add_value();
        graph.push_declared_input(x);
        let zero = graph.add_initializer("zero", Tensor::zeros_f32(&[2]));
        let out = graph.add_value();
        graph.add_node("Add", "add0", &[x, zero], &[out], AttributeBag::new()).unwrap();
        graph.push_declared_output(out);

        SubgraphReplacement.run(&mut graph).unwrap();

        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.declared_outputs(), &[x]);
    }

    #[test]
    fn add_without_a_zero_side_is_left_alone() {
        let mut graph = Graph::new();
        let x = graph.add_value();
        let y = graph.add_value();
        graph.push_declared_input(x);
        graph.push_declared_input(y);
        let out = graph.add_value();
        graph.add_node("Add", "add0", &[x, y], &[out], AttributeBag::new()).unwrap();
        graph.push_declared_output(out);

        SubgraphReplacement.run(&mut graph).unwrap();
        assert_eq!(graph.node_count(), 1);
    }
}
