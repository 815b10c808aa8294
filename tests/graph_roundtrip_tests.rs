//! Graph persistence round trip: `to_text` then `from_text` reproduces a
//! graph that passes `validate()` — the contract is "validates", not
//! field-for-field equality (see `src/graph/text.rs`), except for
//! initializer tensor bytes, which are carried through exactly since
//! nothing can recompute them.

use inferlite::attribute::AttributeBag;
use inferlite::graph::Graph;
use inferlite::model::{SimpleOnnxInitializer, SimpleOnnxInput, SimpleOnnxModel, SimpleOnnxNode};
use inferlite::tensor::Tensor;

fn hand_built_graph() -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_named_value("x");
    let w = graph.add_initializer("w", Tensor::from_f32_array(ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn()));
    graph.push_declared_input(x);

    let y = graph.add_named_value("y");
    graph.add_node("MatMul", "mm0", &[x, w], &[y], AttributeBag::new()).unwrap();
    graph.push_declared_output(y);
    graph
}

#[test]
fn serialize_then_deserialize_reproduces_a_valid_graph() {
    let graph = hand_built_graph();
    graph.validate().unwrap();

    let text = graph.to_text();
    let restored = Graph::from_text(&text).unwrap();
    restored.validate().unwrap();

    assert_eq!(restored.node_count(), graph.node_count());
    assert_eq!(restored.value_count(), graph.value_count());
    assert_eq!(restored.declared_inputs(), graph.declared_inputs());
    assert_eq!(restored.declared_outputs(), graph.declared_outputs());

    let original_topo = graph.topological_sort().unwrap();
    let restored_topo = restored.topological_sort().unwrap();
    assert_eq!(original_topo.len(), restored_topo.len());
}

#[test]
fn round_trip_preserves_initializer_tensor_data() {
    let graph = hand_built_graph();
    let restored = Graph::from_text(&graph.to_text()).unwrap();

    let original_w = graph.values().find(|v| v.name == "w").unwrap();
    let restored_w = restored.values().find(|v| v.name == "w").unwrap();

    assert!(restored_w.is_initializer);
    assert_eq!(
        restored_w.tensor.as_ref().unwrap().to_f32().unwrap().into_raw_vec(),
        original_w.tensor.as_ref().unwrap().to_f32().unwrap().into_raw_vec(),
    );
}

#[test]
fn round_trip_survives_a_graph_produced_from_an_onnx_model() {
    let model = SimpleOnnxModel {
        model_version: 1,
        input_infos: vec![SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![1, 4] }],
        output_names: vec!["y".into()],
        initializers: vec![SimpleOnnxInitializer {
            name: "w".into(),
            data_type: 1,
            dims: vec![4, 2],
            raw_data: [1.0f32; 8].iter().flat_map(|v| v.to_le_bytes()).collect(),
        }],
        nodes: vec![SimpleOnnxNode {
            name: "mm0".into(),
            op_type: "MatMul".into(),
            inputs: vec!["x".into(), "w".into()],
            outputs: vec!["y".into()],
            attributes: vec![],
        }],
    };

    let graph = model.to_graph().unwrap();
    let restored = Graph::from_text(&graph.to_text()).unwrap();
    restored.validate().unwrap();
}
