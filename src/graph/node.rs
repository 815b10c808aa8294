use serde::{Deserialize, Serialize};

use crate::attribute::AttributeBag;
use crate::types::{NodeId, ValueId};

/// A single op invocation in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op_type: String,
    pub name: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attributes: AttributeBag,
    /// Backend provider name assigned at session-prepare time; `None`
    /// until assigned.
    pub provider: Option<String>,
}

impl Node {
    pub fn new(id: NodeId, op_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            op_type: op_type.into(),
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: AttributeBag::new(),
            provider: None,
        }
    }
}
