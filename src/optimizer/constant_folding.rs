use tracing::warn;

use crate::graph::Graph;
use crate::operators::{self, OpContext};
use crate::optimizer::Pass;
use crate::tensor::Tensor;

/// Folds any Node whose inputs are all already materialized. Runs to
/// fixpoint: folding one node can make its consumer's inputs
/// materialized in turn. A fold failure (unregistered op, `execute`
/// error) leaves the node in place and is not a pass error.
pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &str {
        "constant_folding"
    }

    fn run(&self, graph: &mut Graph) -> anyhow::Result<()> {
        loop {
            let order = graph.topological_sort()?;
            let mut folded_any = false;

            for node_id in order {
                let Some(node) = graph.node(node_id).cloned() else { continue };
                if node.inputs.is_empty() {
                    continue;
                }

                let materialized: Option<Vec<Tensor>> =
                    node.inputs.iter().map(|&id| graph.value(id).and_then(|v| v.tensor.clone())).collect();
                let Some(inputs) = materialized else { continue };

                let Some(op) = operators::instantiate(&node.op_type, &node.attributes) else { continue };
                let refs: Vec<&Tensor> = inputs.iter().collect();

                let shapes = match op.infer_output_shape(&refs) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let mut outputs: Vec<Tensor> = match shapes.iter().map(|s| s.as_usize_dims()).collect::<Result<Vec<_>, _>>() {
                    Ok(dims) => dims.into_iter().map(|d| Tensor::zeros_f32(&d)).collect(),
                    Err(_) => continue,
                };

                let ctx = OpContext { node_name: &node.name };
                if let Err(err) = op.execute(&refs, &mut outputs, &ctx) {
                    warn!(node = %node.name, %err, "constant folding: execute failed, leaving node in place");
                    continue;
                }

                for (&out_id, tensor) in node.outputs.iter().zip(outputs) {
                    if let Some(value) = graph.value_mut(out_id) {
                        value.dtype = tensor.dtype();
                        value.shape = Some(tensor.shape().clone());
                        value.layout = tensor.layout();
                        value.tensor = Some(tensor);
                        value.is_initializer = true;
                    }
                }
                graph.remove_node(node.id)?;
                folded_any = true;
            }

            if !folded_any {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeBag;
    use crate::types::DType;

    #[test]
    fn folds_add_of_two_initializers() {
        let mut graph = Graph::new();
        let a = graph.add_initializer("a", Tensor::from_f32_array(ndarray::arr1(&[1.0, 2.0]).into_dyn()));
        let b = graph.add_initializer("b", Tensor::from_f32_array(ndarray::arr1(&[3.0, 4.0]).into_dyn()));
        let out = graph.add_value();
        graph.add_node("Add", "add0", &[a, b], &[out], AttributeBag::new()).unwrap();
        graph.push_declared_input(a);
        graph.push_declared_output(out);

        ConstantFolding.run(&mut graph).unwrap();

        assert_eq!(graph.node_count(), 0);
        let value = graph.value(out).unwrap();
        assert!(value.is_initializer);
        assert_eq!(value.tensor.as_ref().unwrap().to_f32().unwrap().into_raw_vec(), vec![4.0, 6.0]);
        let _ = DType::Float32;
    }

    #[test]
    fn folding_twice_is_a_no_op() {
        let mut graph = Graph::new();
        let a = graph.add_initializer("a", Tensor::zeros_f32(&[2]));
        let b = graph.add_initializer("b", Tensor::zeros_f32(&[2]));
        let out = graph.add_value();
        graph.add_node("Add", "add0", &[a, b], &[out], AttributeBag::new()).unwrap();
        graph.push_declared_input(a);
        graph.push_declared_output(out);

        ConstantFolding.run(&mut graph).unwrap();
        let count_after_first = graph.node_count();
        ConstantFolding.run(&mut graph).unwrap();
        assert_eq!(graph.node_count(), count_after_first);
    }
}
