use std::collections::HashMap;

use crate::attribute::{AttributeBag, AttributeValue};
use crate::graph::Graph;
use crate::optimizer::Pass;
use crate::types::{NodeId, TensorLayout};

fn prefers_nchw(op_type: &str) -> bool {
    matches!(op_type, "Conv" | "MaxPool" | "AveragePool" | "BatchNormalization")
}

fn perm_for(from: TensorLayout, to: TensorLayout) -> Option<Vec<i64>> {
    match (from, to) {
        (TensorLayout::Nchw, TensorLayout::Nhwc) => Some(vec![0, 2, 3, 1]),
        (TensorLayout::Nhwc, TensorLayout::Nchw) => Some(vec![0, 3, 1, 2]),
        _ => None,
    }
}

/// Assigns each Node a preferred layout (convolution/pooling/batchnorm
/// kernels want NCHW; everything else inherits its first input's
/// layout) and inserts a `Transpose` Node with an explicit `perm`
/// attribute wherever a 4-D input Value's current layout disagrees
/// with its consumer's preferred one. Graph-boundary Values (declared
/// inputs/outputs) are left as-is.
#[derive(Debug, Default)]
pub struct MemoryLayout;

impl Pass for MemoryLayout {
    fn name(&self) -> &str {
        "memory_layout"
    }

    fn dependencies(&self) -> &[&str] {
        &["operator_fusion"]
    }

    fn run(&self, graph: &mut Graph) -> anyhow::Result<()> {
        let order = graph.topological_sort()?;

        let mut node_layout: HashMap<NodeId, TensorLayout> = HashMap::new();
        for &node_id in &order {
            let node = graph.node(node_id).unwrap();
            let layout = if prefers_nchw(&node.op_type) {
                TensorLayout::Nchw
            } else if let Some(&first_input) = node.inputs.first() {
                graph.value(first_input).map(|v| v.layout).unwrap_or_default()
            } else {
                TensorLayout::default()
            };
            node_layout.insert(node_id, layout);
        }

        for &node_id in &order {
            let preferred = node_layout[&node_id];
            let node = graph.node(node_id).unwrap().clone();

            for (slot, &input_id) in node.inputs.iter().enumerate() {
                let (layout, rank) = {
                    let value = graph.value(input_id).unwrap();
                    (value.layout, value.shape.as_ref().map(|s| s.rank()).unwrap_or(0))
                };
                if layout == preferred || rank != 4 {
                    continue;
                }
                if graph.declared_inputs().contains(&input_id) || graph.declared_outputs().contains(&input_id) {
                    continue;
                }
                let Some(perm) = perm_for(layout, preferred) else { continue };

                let transposed = graph.add_value();
                if let Some(v) = graph.value_mut(transposed) {
                    v.layout = preferred;
                }
                let mut attrs = AttributeBag::new();
                attrs.insert("perm", AttributeValue::Ints(perm));
                let transpose_name = format!("{}_layout_transpose", node.name);
                graph.add_node("Transpose", transpose_name, &[input_id], &[transposed], attrs)?;

                if let Some(n) = graph.node_mut(node_id) {
                    n.inputs[slot] = transposed;
                }
                if let Some(old_value) = graph.value_mut(input_id) {
                    old_value.consumers.retain(|&c| c != node_id);
                }
                if let Some(new_value) = graph.value_mut(transposed) {
                    if !new_value.consumers.contains(&node_id) {
                        new_value.consumers.push(node_id);
                    }
                }
            }
        }

        Ok(())
    }
}
