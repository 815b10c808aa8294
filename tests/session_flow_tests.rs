//! Whole-Session load/run flows: build a `SimpleOnnxModel` by hand (the
//! seam a protobuf parser would otherwise fill), load a `Session` from
//! it, and drive `run`/`run_by_name`/introspection the way a real
//! caller would.

use std::collections::HashMap;

use inferlite::model::{SimpleOnnxInitializer, SimpleOnnxInput, SimpleOnnxModel, SimpleOnnxNode};
use inferlite::session::{GraphOptimizationLevel, SessionOptions};
use inferlite::{Session, Tensor};

fn relu_after_add_model() -> SimpleOnnxModel {
    SimpleOnnxModel {
        model_version: 1,
        input_infos: vec![
            SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![2, 3] },
            SimpleOnnxInput { name: "y".into(), data_type: 1, dims: vec![2, 3] },
        ],
        output_names: vec!["out".into()],
        initializers: vec![],
        nodes: vec![
            SimpleOnnxNode {
                name: "add0".into(),
                op_type: "Add".into(),
                inputs: vec!["x".into(), "y".into()],
                outputs: vec!["sum".into()],
                attributes: vec![],
            },
            SimpleOnnxNode {
                name: "relu0".into(),
                op_type: "Relu".into(),
                inputs: vec!["sum".into()],
                outputs: vec!["out".into()],
                attributes: vec![],
            },
        ],
    }
}

#[test]
fn session_loads_and_runs_a_two_node_graph() {
    let model = relu_after_add_model();
    let mut session = Session::new(&model, SessionOptions::default()).unwrap();

    assert_eq!(session.input_count(), 2);
    assert_eq!(session.output_count(), 1);
    assert_eq!(session.input_names(), vec!["x".to_string(), "y".to_string()]);
    assert_eq!(session.output_names(), vec!["out".to_string()]);

    let x = Tensor::from_f32_array(ndarray::arr2(&[[-1.0, 2.0, -3.0], [4.0, -5.0, 6.0]]).into_dyn());
    let y = Tensor::from_f32_array(ndarray::arr2(&[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]).into_dyn());
    let outputs = session.run(vec![x, y]).unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].to_f32().unwrap().into_raw_vec(), vec![0.0, 2.0, 0.0, 4.0, 0.0, 6.0]);
}

#[test]
fn run_by_name_round_trips_through_named_maps() {
    let model = relu_after_add_model();
    let mut session = Session::new(&model, SessionOptions::default()).unwrap();

    let mut inputs = HashMap::new();
    inputs.insert("x".to_string(), Tensor::zeros_f32(&[2, 3]));
    inputs.insert("y".to_string(), Tensor::zeros_f32(&[2, 3]));

    let outputs = session.run_by_name(inputs).unwrap();
    assert!(outputs.contains_key("out"));
    assert_eq!(outputs["out"].shape().dims(), &[2i64, 3i64]);
}

#[test]
fn run_rejects_a_mismatched_input_count() {
    let model = relu_after_add_model();
    let mut session = Session::new(&model, SessionOptions::default()).unwrap();
    assert!(session.run(vec![Tensor::zeros_f32(&[2, 3])]).is_err());
}

#[test]
fn session_applies_constant_folding_at_load_when_requested() {
    let model = SimpleOnnxModel {
        model_version: 1,
        input_infos: vec![SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![2] }],
        output_names: vec!["y".into()],
        initializers: vec![
            SimpleOnnxInitializer {
                name: "c1".into(),
                data_type: 1,
                dims: vec![2],
                raw_data: [1.0f32, 2.0f32].iter().flat_map(|v| v.to_le_bytes()).collect(),
            },
            SimpleOnnxInitializer {
                name: "c2".into(),
                data_type: 1,
                dims: vec![2],
                raw_data: [3.0f32, 4.0f32].iter().flat_map(|v| v.to_le_bytes()).collect(),
            },
        ],
        nodes: vec![
            SimpleOnnxNode {
                name: "const_add".into(),
                op_type: "Add".into(),
                inputs: vec!["c1".into(), "c2".into()],
                outputs: vec!["folded".into()],
                attributes: vec![],
            },
            SimpleOnnxNode {
                name: "add_x".into(),
                op_type: "Add".into(),
                inputs: vec!["x".into(), "folded".into()],
                outputs: vec!["y".into()],
                attributes: vec![],
            },
        ],
    };

    let options = SessionOptions { graph_optimization_level: GraphOptimizationLevel::Basic, ..Default::default() };
    let session = Session::new(&model, options).unwrap();

    // Constant folding removes `const_add`, leaving only `add_x`.
    assert_eq!(session.graph().node_count(), 1);

    let mut session = session;
    let x = Tensor::from_f32_array(ndarray::arr1(&[0.0, 0.0]).into_dyn());
    let outputs = session.run(vec![x]).unwrap();
    assert_eq!(outputs[0].to_f32().unwrap().into_raw_vec(), vec![4.0, 6.0]);
}

#[test]
fn run_batched_stacks_independent_samples_and_splits_outputs() {
    let model = relu_after_add_model();
    let mut session = Session::new(&model, SessionOptions::default()).unwrap();

    let sample1 = vec![
        Tensor::from_f32_array(ndarray::arr2(&[[1.0, -1.0, 2.0]]).into_dyn()),
        Tensor::from_f32_array(ndarray::arr2(&[[0.0, 0.0, 0.0]]).into_dyn()),
    ];
    let sample2 = vec![
        Tensor::from_f32_array(ndarray::arr2(&[[-5.0, 5.0, -5.0]]).into_dyn()),
        Tensor::from_f32_array(ndarray::arr2(&[[0.0, 0.0, 0.0]]).into_dyn()),
    ];

    let results = session.run_batched(vec![sample1, sample2]).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0][0].to_f32().unwrap().into_raw_vec(), vec![1.0, 0.0, 2.0]);
    assert_eq!(results[1][0].to_f32().unwrap().into_raw_vec(), vec![0.0, 5.0, 0.0]);
}
