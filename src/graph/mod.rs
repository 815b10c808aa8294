pub mod node;
pub mod text;
pub mod value;

pub use node::Node;
pub use value::Value;

use std::collections::{BTreeSet, HashMap};

use crate::attribute::AttributeBag;
use crate::error::{EngineError, EngineResult};
use crate::tensor::Tensor;
use crate::types::{DType, NodeId, Shape, ValueId};

/// The in-memory DAG over [`Node`]s and [`Value`]s.
///
/// Nodes and Values are indices into owning slab vectors rather than
/// pointers: `remove_node`/
/// `remove_value` tombstone a slot instead of invalidating other ids,
/// and `clone()` is a plain structural copy.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    values: Vec<Option<Value>>,
    declared_inputs: Vec<ValueId>,
    declared_outputs: Vec<ValueId>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            values: Vec::new(),
            declared_inputs: Vec::new(),
            declared_outputs: Vec::new(),
        }
    }

    // --- construction -----------------------------------------------

    /// Adds a blank value placeholder and returns its fresh, monotonic id.
    pub fn add_value(&mut self) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Some(Value::new(id, format!("value_{}", id.0))));
        id
    }

    pub fn add_named_value(&mut self, name: impl Into<String>) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Some(Value::new(id, name.into())));
        id
    }

    /// Adds a constant Value carrying `tensor` with no producer (an
    /// initializer). Drives the Tensor-sharing clone policy.
    pub fn add_initializer(&mut self, name: impl Into<String>, tensor: Tensor) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        let mut value = Value::new(id, name.into());
        value.dtype = tensor.dtype();
        value.shape = Some(tensor.shape().clone());
        value.layout = tensor.layout();
        value.is_initializer = true;
        value.tensor = Some(tensor);
        self.values.push(Some(value));
        id
    }

    /// Adds a Node and wires producer/consumer edges for its inputs and
    /// outputs. Fails if an output Value already has a producer
    /// (producer-uniqueness invariant).
    pub fn add_node(
        &mut self,
        op_type: impl Into<String>,
        name: impl Into<String>,
        inputs: &[ValueId],
        outputs: &[ValueId],
        attributes: AttributeBag,
    ) -> EngineResult<NodeId> {
        for &out_id in outputs {
            let value = self.value(out_id).ok_or_else(|| {
                EngineError::invalid_model(format!("add_node: output {out_id} does not exist"))
            })?;
            if value.producer.is_some() {
                return Err(EngineError::invalid_model(format!(
                    "producer-uniqueness violated: value {out_id} already has a producer"
                )));
            }
        }
        for &in_id in inputs {
            if self.value(in_id).is_none() {
                return Err(EngineError::invalid_model(format!(
                    "add_node: input {in_id} does not exist"
                )));
            }
        }

        let id = NodeId(self.nodes.len() as u32);
        let mut node = Node::new(id, op_type, name);
        node.inputs = inputs.to_vec();
        node.outputs = outputs.to_vec();
        node.attributes = attributes;

        for &in_id in inputs {
            self.value_mut(in_id).unwrap().consumers.push(id);
        }
        for &out_id in outputs {
            self.value_mut(out_id).unwrap().producer = Some(id);
        }

        self.nodes.push(Some(node));
        Ok(id)
    }

    pub fn set_declared_inputs(&mut self, inputs: Vec<ValueId>) {
        self.declared_inputs = inputs;
    }

    pub fn set_declared_outputs(&mut self, outputs: Vec<ValueId>) {
        self.declared_outputs = outputs;
    }

    pub fn push_declared_input(&mut self, id: ValueId) {
        self.declared_inputs.push(id);
    }

    pub fn push_declared_output(&mut self, id: ValueId) {
        self.declared_outputs.push(id);
    }

    // --- removal -------------------------------------------------------

    /// Disconnects `n`'s input Values' consumer lists and clears any
    /// output Value's producer field, then tombstones the node.
    pub fn remove_node(&mut self, id: NodeId) -> EngineResult<()> {
        let node = self
            .nodes
            .get(id.0 as usize)
            .and_then(|n| n.clone())
            .ok_or_else(|| EngineError::invalid_argument(format!("remove_node: no such node {id}")))?;

        for &in_id in &node.inputs {
            if let Some(v) = self.value_mut(in_id) {
                v.consumers.retain(|&c| c != id);
            }
        }
        for &out_id in &node.outputs {
            if let Some(v) = self.value_mut(out_id) {
                v.producer = None;
            }
        }
        self.nodes[id.0 as usize] = None;
        Ok(())
    }

    /// Removes `v` from producer/consumer bookkeeping and from the
    /// declared input/output lists if present, then tombstones the
    /// value. The caller is responsible for first removing any Node that
    /// still lists `v` as an input or output.
    pub fn remove_value(&mut self, id: ValueId) -> EngineResult<()> {
        if self.value(id).is_none() {
            return Err(EngineError::invalid_argument(format!(
                "remove_value: no such value {id}"
            )));
        }
        self.declared_inputs.retain(|&v| v != id);
        self.declared_outputs.retain(|&v| v != id);
        self.values[id.0 as usize] = None;
        Ok(())
    }

    // --- accessors -------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.0 as usize).and_then(|v| v.as_ref())
    }

    pub fn value_mut(&mut self, id: ValueId) -> Option<&mut Value> {
        self.values.get_mut(id.0 as usize).and_then(|v| v.as_mut())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(|n| n.as_ref())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Size of the value id slab, including tombstoned slots (used by
    /// the text deserializer to grow the slab to a specific id).
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().filter_map(|v| v.as_ref())
    }

    pub fn declared_inputs(&self) -> &[ValueId] {
        &self.declared_inputs
    }

    pub fn declared_outputs(&self) -> &[ValueId] {
        &self.declared_outputs
    }

    // --- structural analysis -----------------------------------------

    /// Kahn's algorithm over node in-degree computed from value-producer
    /// edges; ties are broken by ascending [`NodeId`] for a deterministic
    /// order.
    pub fn topological_sort(&self) -> EngineResult<Vec<NodeId>> {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for node in self.nodes() {
            indegree.entry(node.id).or_insert(0);
        }

        for node in self.nodes() {
            for &input_id in &node.inputs {
                if let Some(value) = self.value(input_id) {
                    if let Some(producer) = value.producer {
                        if producer != node.id {
                            successors.entry(producer).or_default().push(node.id);
                            *indegree.entry(node.id).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(indegree.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(&id);
            order.push(id);
            if let Some(succs) = successors.get(&id) {
                for &s in succs {
                    let d = indegree.get_mut(&s).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(s);
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            return Err(EngineError::invalid_model(
                "graph is not acyclic: topological_sort could not order all nodes",
            ));
        }
        Ok(order)
    }

    /// Checks the graph's structural invariants; returns INVALID_MODEL
    /// naming the violated invariant on failure.
    pub fn validate(&self) -> EngineResult<()> {
        if self.declared_inputs.is_empty() || self.declared_outputs.is_empty() {
            return Err(EngineError::invalid_model(
                "non-empty-boundaries violated: graph must have at least one input and one output",
            ));
        }

        for &id in self.declared_inputs.iter().chain(self.declared_outputs.iter()) {
            if self.value(id).is_none() {
                return Err(EngineError::invalid_model(format!(
                    "declared input/output {id} does not exist in the value table"
                )));
            }
        }

        for node in self.nodes() {
            for &in_id in &node.inputs {
                let value = self.value(in_id).ok_or_else(|| {
                    EngineError::invalid_model(format!(
                        "connectivity violated: node {} references missing value {in_id}",
                        node.id
                    ))
                })?;
                let is_graph_input = self.declared_inputs.contains(&in_id);
                let is_initializer = value.is_initializer && value.tensor.is_some();
                let is_produced = value.producer.is_some();
                if !(is_graph_input || is_initializer || is_produced) {
                    return Err(EngineError::invalid_model(format!(
                        "connectivity violated: value {in_id} feeding node {} ({}) has no producer, \
                         is not a declared input, and is not an initializer",
                        node.id, node.op_type
                    )));
                }
            }
        }

        for value in self.values() {
            if let Some(producer_id) = value.producer {
                let producer = self.node(producer_id).ok_or_else(|| {
                    EngineError::invalid_model(format!(
                        "producer-consistency violated: value {} names missing producer {producer_id}",
                        value.id
                    ))
                })?;
                if !producer.outputs.contains(&value.id) {
                    return Err(EngineError::invalid_model(format!(
                        "producer-consistency violated: {} claims producer {} but {} does not list it as an output",
                        value.id, producer_id, producer_id
                    )));
                }
            }
            for &consumer_id in &value.consumers {
                let consumer = self.node(consumer_id).ok_or_else(|| {
                    EngineError::invalid_model(format!(
                        "consumer-consistency violated: value {} names missing consumer {consumer_id}",
                        value.id
                    ))
                })?;
                if !consumer.inputs.contains(&value.id) {
                    return Err(EngineError::invalid_model(format!(
                        "consumer-consistency violated: {} lists consumer {} but {} does not take it as input",
                        value.id, consumer_id, consumer_id
                    )));
                }
            }
        }

        let order = self.topological_sort()?;
        if order.len() != self.node_count() {
            return Err(EngineError::invalid_model(
                "acyclicity violated: topological_sort did not cover every node",
            ));
        }

        Ok(())
    }

    /// Structural copy. Initializer Tensors are shared behind the
    /// `Tensor`'s internal `Arc` (cheap, avoids duplicating weight
    /// buffers); any cached intermediate Tensor on a non-initializer
    /// Value is dropped so the clone is a structural template for that
    /// value — cloned Values share no Tensor with the source for
    /// execution-produced data.
    pub fn clone_structural(&self) -> Graph {
        let values = self
            .values
            .iter()
            .map(|slot| {
                slot.as_ref().map(|v| {
                    let mut copy = v.clone();
                    if !v.is_initializer {
                        copy.tensor = None;
                    }
                    copy
                })
            })
            .collect();

        Graph {
            nodes: self.nodes.clone(),
            values,
            declared_inputs: self.declared_inputs.clone(),
            declared_outputs: self.declared_outputs.clone(),
        }
    }

    pub fn to_text(&self) -> String {
        text::serialize(self)
    }

    pub fn from_text(input: &str) -> EngineResult<Graph> {
        text::deserialize(input)
    }

    /// Sets a Value's known dtype/shape (used by shape inference and by
    /// the ONNX-to-Graph conversion for declared-shape inputs).
    pub fn set_value_shape(&mut self, id: ValueId, shape: Shape, dtype: DType) -> EngineResult<()> {
        let value = self
            .value_mut(id)
            .ok_or_else(|| EngineError::invalid_argument(format!("no such value {id}")))?;
        value.shape = Some(shape);
        value.dtype = dtype;
        Ok(())
    }
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        self.clone_structural()
    }
}
