use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeBag, AttributeValue};
use crate::error::{EngineError, EngineResult};
use crate::graph::Graph;
use crate::tensor::Tensor;
use crate::types::{DType, Shape, ValueId};

/// One declared graph input: name, raw ONNX dtype enum, and dims (a
/// negative entry marks a dynamic dimension).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleOnnxInput {
    pub name: String,
    pub data_type: i32,
    pub dims: Vec<i64>,
}

/// One initializer: a named constant Tensor stored as raw bytes in its
/// declared dtype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleOnnxInitializer {
    pub name: String,
    pub data_type: i32,
    pub dims: Vec<i64>,
    pub raw_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleOnnxNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, AttributeValue)>,
}

/// The reduced, in-memory model that stands between a protobuf parser
/// (out of scope here) and the Graph IR — the parser-to-core contract
/// of an ONNX-format load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleOnnxModel {
    pub model_version: i64,
    pub input_infos: Vec<SimpleOnnxInput>,
    pub output_names: Vec<String>,
    pub initializers: Vec<SimpleOnnxInitializer>,
    pub nodes: Vec<SimpleOnnxNode>,
}

impl SimpleOnnxModel {
    /// Converts to a [`Graph`] following the fixed, order-sensitive
    /// algorithm: initializers first, then declared inputs not already
    /// covered by an initializer, then nodes (creating placeholder
    /// Values for any input edge not seen yet), then declared outputs,
    /// finally `validate()`.
    pub fn to_graph(&self) -> EngineResult<Graph> {
        let mut graph = Graph::new();
        let mut by_name: HashMap<String, ValueId> = HashMap::new();

        for initializer in &self.initializers {
            let dtype = DType::from_onnx_enum(initializer.data_type);
            let shape = Shape::new(initializer.dims.clone());
            let tensor = Tensor::from_raw_bytes(dtype, shape, &initializer.raw_data)?;
            let id = graph.add_initializer(initializer.name.clone(), tensor);
            by_name.insert(initializer.name.clone(), id);
        }

        for input in &self.input_infos {
            if by_name.contains_key(&input.name) {
                continue;
            }
            let dtype = DType::from_onnx_enum(input.data_type);
            let id = graph.add_named_value(input.name.clone());
            graph.set_value_shape(id, Shape::new(input.dims.clone()), dtype)?;
            if input.dims.iter().all(|&d| d >= 0) {
                let dims: Vec<usize> = input.dims.iter().map(|&d| d as usize).collect();
                graph.value_mut(id).unwrap().tensor = Some(Tensor::zeros_f32(&dims));
            }
            graph.push_declared_input(id);
            by_name.insert(input.name.clone(), id);
        }

        for node in &self.nodes {
            let mut attributes = AttributeBag::new();
            for (name, value) in &node.attributes {
                attributes.insert(name.clone(), value.clone());
            }

            let input_ids: Vec<ValueId> = node
                .inputs
                .iter()
                .map(|name| {
                    *by_name.entry(name.clone()).or_insert_with(|| {
                        let id = graph.add_named_value(name.clone());
                        id
                    })
                })
                .collect();

            let output_ids: Vec<ValueId> = node
                .outputs
                .iter()
                .map(|name| {
                    let id = graph.add_named_value(name.clone());
                    by_name.insert(name.clone(), id);
                    id
                })
                .collect();

            graph.add_node(node.op_type.clone(), node.name.clone(), &input_ids, &output_ids, attributes)?;
        }

        for name in &self.output_names {
            let id = by_name
                .get(name)
                .copied()
                .ok_or_else(|| EngineError::invalid_model(format!("output_name '{name}' does not name a known value")))?;
            graph.push_declared_output(id);
        }

        graph.validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_a_minimal_single_node_model() {
        let model = SimpleOnnxModel {
            model_version: 1,
            input_infos: vec![SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![2, 3] }],
            output_names: vec!["y".into()],
            initializers: vec![],
            nodes: vec![SimpleOnnxNode {
                name: "relu0".into(),
                op_type: "Relu".into(),
                inputs: vec!["x".into()],
                outputs: vec!["y".into()],
                attributes: vec![],
            }],
        };

        let graph = model.to_graph().unwrap();
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.declared_inputs().len(), 1);
        assert_eq!(graph.declared_outputs().len(), 1);
    }

    #[test]
    fn initializer_names_are_not_duplicated_as_declared_inputs() {
        let model = SimpleOnnxModel {
            model_version: 1,
            input_infos: vec![
                SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![2] },
                SimpleOnnxInput { name: "w".into(), data_type: 1, dims: vec![2] },
            ],
            output_names: vec!["y".into()],
            initializers: vec![SimpleOnnxInitializer {
                name: "w".into(),
                data_type: 1,
                dims: vec![2],
                raw_data: vec![0; 8],
            }],
            nodes: vec![SimpleOnnxNode {
                name: "add0".into(),
                op_type: "Add".into(),
                inputs: vec!["x".into(), "w".into()],
                outputs: vec!["y".into()],
                attributes: vec![],
            }],
        };

        let graph = model.to_graph().unwrap();
        assert_eq!(graph.declared_inputs().len(), 1);
    }

    #[test]
    fn unknown_output_name_is_an_invalid_model_error() {
        let model = SimpleOnnxModel {
            model_version: 1,
            input_infos: vec![SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![2] }],
            output_names: vec!["ghost".into()],
            initializers: vec![],
            nodes: vec![],
        };
        assert!(model.to_graph().is_err());
    }
}
