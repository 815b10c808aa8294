//! Static shape propagation: walks the graph in topological order,
//! instantiating each node's Operator to call `infer_output_shape`
//! and writing the result back onto the output Values. Unregistered
//! op-types are skipped (pass-through, resolved later by the backend);
//! a failure on one node is logged and does not abort the walk.
//!
//! A node's declared input shapes are checked against
//! `Operator::reject_unhandleable_dynamic_dim` before a `-1` is ever
//! stood in with a concrete placeholder value (see
//! [`placeholder_tensor`]) — by the time a placeholder exists, the `-1`
//! that made a dimension dynamic is gone, so an operator that actually
//! needs to reject it has to see the raw declared Shape first.

use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::graph::Graph;
use crate::operators;
use crate::tensor::Tensor;
use crate::types::{DType, ValueId};

/// Propagates shapes through every Value reachable from the graph's
/// declared inputs and initializers. Returns an error only if the graph
/// is not a valid DAG; per-node inference failures are logged as
/// warnings and do not abort the load flow.
pub fn infer_shapes(graph: &mut Graph) -> EngineResult<()> {
    let order = graph.topological_sort()?;

    for node_id in order {
        let node = graph
            .node(node_id)
            .expect("topological_sort returned a live node id")
            .clone();

        let Some(op) = operators::instantiate(&node.op_type, &node.attributes) else {
            continue;
        };

        let declared_shapes: Vec<Option<&crate::types::Shape>> =
            node.inputs.iter().map(|&id| graph.value(id).and_then(|v| v.shape.as_ref())).collect();
        if let Err(err) = op.reject_unhandleable_dynamic_dim(&declared_shapes) {
            warn!(node = %node.name, op = %node.op_type, %err, "shape inference: node cannot handle a declared dynamic dimension, skipping node");
            continue;
        }

        let inputs = match node
            .inputs
            .iter()
            .map(|&id| placeholder_tensor(graph, id))
            .collect::<EngineResult<Vec<Tensor>>>()
        {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(node = %node.name, op = %node.op_type, %err, "shape inference: could not build placeholder inputs, skipping node");
                continue;
            }
        };

        let refs: Vec<&Tensor> = inputs.iter().collect();
        match op.infer_output_shape(&refs) {
            Ok(shapes) => {
                let dtype = inputs.first().map(|t| t.dtype()).unwrap_or(DType::Float32);
                for (&out_id, shape) in node.outputs.iter().zip(shapes) {
                    if let Err(err) = graph.set_value_shape(out_id, shape, dtype) {
                        warn!(node = %node.name, %err, "shape inference: could not write inferred shape");
                    }
                }
            }
            Err(err) => {
                warn!(node = %node.name, op = %node.op_type, %err, "shape inference failed for node, leaving its outputs unresolved");
            }
        }
    }

    Ok(())
}

/// Builds a concrete stand-in `Tensor` for a Value consumed during shape
/// inference: the Value's own Tensor if it already has one (an
/// initializer or an already-folded constant), otherwise a zero-filled
/// tensor of its declared Shape. A dynamic dimension (`-1`) is stood in
/// with `1` so a concrete `ndarray` buffer can back the placeholder;
/// the `-1` itself is not observable past this point, since no shipped
/// operator branches on symbolic dimensions.
fn placeholder_tensor(graph: &Graph, id: ValueId) -> EngineResult<Tensor> {
    let value = graph
        .value(id)
        .ok_or_else(|| EngineError::invalid_model(format!("shape inference: value {id} does not exist")))?;

    if let Some(tensor) = &value.tensor {
        return Ok(tensor.clone());
    }

    let shape = value
        .shape
        .as_ref()
        .ok_or_else(|| EngineError::invalid_argument(format!("value {id} has no declared shape for shape inference")))?;
    let dims: Vec<usize> = shape.dims().iter().map(|&d| if d < 0 { 1 } else { d as usize }).collect();
    Ok(Tensor::zeros_f32(&dims))
}
