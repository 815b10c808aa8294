use crate::attribute::AttributeBag;
use crate::graph::Graph;
use crate::optimizer::Pass;
use crate::types::{NodeId, ValueId};

const MAX_ITERATIONS: usize = 10;

struct FusionPattern {
    chain: &'static [&'static str],
    fused_name: &'static str,
}

/// Longer chains are listed first so `Conv -> BatchNormalization ->
/// Relu` is recognized whole rather than only its `Conv -> ...` prefix
/// matching a shorter pattern.
const PATTERNS: &[FusionPattern] = &[
    FusionPattern { chain: &["Conv", "BatchNormalization", "Relu"], fused_name: "FusedConvBNReLU" },
    FusionPattern { chain: &["Conv", "Relu"], fused_name: "FusedConvReLU" },
    FusionPattern { chain: &["BatchNormalization", "Relu"], fused_name: "FusedBNReLU" },
    FusionPattern { chain: &["MatMul", "Add"], fused_name: "FusedMatMulAdd" },
];

/// Collapses the four recognized elementwise/compute chains into a
/// single fused Node, where legal: every intermediate Value in the
/// chain must be consumed by exactly the next node in the pattern and
/// must not itself be a declared graph output. Runs to a fixpoint,
/// capped at `MAX_ITERATIONS` rewrites.
#[derive(Default)]
pub struct OperatorFusion;

impl Pass for OperatorFusion {
    fn name(&self) -> &str {
        "operator_fusion"
    }

    fn dependencies(&self) -> &[&str] {
        &["subgraph_replacement"]
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

impl OperatorFusion {
    fn run_one_pass(&self, graph: &mut Graph) -> anyhow::Result<bool> {
        let order = graph.topological_sort()?;
        for &start_id in &order {
            for pattern in PATTERNS {
                if let Some(chain) = match_chain(graph, start_id, pattern.chain) {
                    fuse_chain(graph, &chain, pattern.fused_name)?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn match_chain(graph: &Graph, start_id: NodeId, ops: &[&str]) -> Option<Vec<NodeId>> {
    let mut chain = Vec::with_capacity(ops.len());
    let mut current = start_id;

    for (i, &op) in ops.iter().enumerate() {
        let node = graph.node(current)?;
        if node.op_type != op {
            return None;
        }
        chain.push(current);

        if i + 1 < ops.len() {
            if node.outputs.len() != 1 {
                return None;
            }
            let out_id = node.outputs[0];
            if graph.declared_outputs().contains(&out_id) {
                return None;
            }
            let out_value = graph.value(out_id)?;
            if out_value.consumers.len() != 1 {
                return None;
            }
            current = out_value.consumers[0];
        }
    }
    Some(chain)
}

/// Builds the fused Node's input list as the first node's inputs
/// followed by every later node's non-chained inputs (the parameters
/// it adds: BatchNormalization's scale/bias/mean/var, Add's bias
/// operand), and replaces the whole chain with one Node producing the
/// last node's outputs.
fn fuse_chain(graph: &mut Graph, chain: &[NodeId], fused_name: &str) -> anyhow::Result<()> {
    let nodes: Vec<_> = chain.iter().map(|&id| graph.node(id).unwrap().clone()).collect();
    let first = &nodes[0];
    let last = nodes.last().unwrap();

    let mut inputs: Vec<ValueId> = first.inputs.clone();
    for node in &nodes[1..] {
        inputs.extend(node.inputs.iter().skip(1).copied());
    }
    let outputs = last.outputs.clone();
    let name = format!("{}_fused", first.name);

    for &id in chain {
        graph.remove_node(id)?;
    }

    graph.add_node(fused_name, name, &inputs, &outputs, AttributeBag::new())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn fuses_matmul_followed_by_add() {
        let mut graph = Graph::new();
        let a = graph.add_value();
        let b = graph.add_initializer("b", Tensor::zeros_f32(&[3, 4]));
        let bias = graph.add_initializer("bias", Tensor::zeros_f32(&[4]));
        graph.push_declared_input(a);

        let mm_out = graph.add_value();
        graph.add_node("MatMul", "mm0", &[a, b], &[mm_out], AttributeBag::new()).unwrap();
        let add_out = graph.add_value();
        graph.add_node("Add", "add0", &[mm_out, bias], &[add_out], AttributeBag::new()).unwrap();
        graph.push_declared_output(add_out);

        OperatorFusion.run(&mut graph).unwrap();

        assert_eq!(graph.node_count(), 1);
        let fused = graph.nodes().next().unwrap();
        assert_eq!(fused.op_type, "FusedMatMulAdd");
        assert_eq!(fused.inputs, vec![a, b, bias]);
        assert_eq!(fused.outputs, vec![add_out]);
    }

    #[test]
    fn does_not_fuse_when_the_intermediate_value_has_another_consumer() {
        let mut graph = Graph::new();
        let a = graph.add_value();
        let b = graph.add_initializer("b", Tensor::zeros_f32(&[3, 4]));
        let bias = graph.add_initializer("bias", Tensor::zeros_f32(&[4]));
        graph.push_declared_input(a);

        let mm_out = graph.add_value();
        graph.add_node("MatMul", "mm0", &[a, b], &[mm_out], AttributeBag::new()).unwrap();
        let add_out = graph.add_value();
        graph.add_node("Add", "add0", &[mm_out, bias], &[add_out], AttributeBag::new()).unwrap();
        let extra_out = graph.add_value();
        graph.add_node("Relu", "also_reads_mm", &[mm_out], &[extra_out], AttributeBag::new()).unwrap();
        graph.push_declared_output(add_out);
        graph.push_declared_output(extra_out);

        OperatorFusion.run(&mut graph).unwrap();
        assert_eq!(graph.node_count(), 3);
    }
}
