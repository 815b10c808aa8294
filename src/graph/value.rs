use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;
use crate::types::{DType, NodeId, TensorLayout, ValueId};

/// A named edge in the graph, carrying either a materialized [`Tensor`]
/// (for initializers and, transiently, intermediates) or just a
/// shape/dtype slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub name: String,
    pub dtype: DType,
    pub shape: Option<crate::types::Shape>,
    pub layout: TensorLayout,
    pub tensor: Option<Tensor>,
    /// Set once at construction; true only for values created via
    /// `Graph::add_initializer`. Drives clone()'s Tensor-sharing policy:
    /// initializers are shared by reference, execution-produced data is
    /// not.
    pub is_initializer: bool,
    pub producer: Option<NodeId>,
    pub consumers: Vec<NodeId>,
}

impl Value {
    pub fn new(id: ValueId, name: String) -> Self {
        Self {
            id,
            name,
            dtype: DType::Unknown,
            shape: None,
            layout: TensorLayout::default(),
            tensor: None,
            is_initializer: false,
            producer: None,
            consumers: Vec::new(),
        }
    }

    pub fn has_tensor(&self) -> bool {
        self.tensor.is_some()
    }

    pub fn is_graph_input_candidate(&self) -> bool {
        self.producer.is_none() && !self.is_initializer
    }
}
