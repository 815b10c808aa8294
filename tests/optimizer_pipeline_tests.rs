//! `PassManager::default_pipeline()` exercised end-to-end over a
//! hand-built graph, the way `Session::new` drives it internally.

use inferlite::attribute::AttributeBag;
use inferlite::graph::Graph;
use inferlite::optimizer::PassManager;
use inferlite::tensor::Tensor;

fn matmul_add_graph() -> (Graph, inferlite::types::ValueId) {
    let mut graph = Graph::new();
    let a = graph.add_value();
    let w = graph.add_initializer("w", Tensor::zeros_f32(&[4, 8]));
    let bias = graph.add_initializer("bias", Tensor::zeros_f32(&[8]));
    graph.push_declared_input(a);

    let mm_out = graph.add_value();
    graph.add_node("MatMul", "mm0", &[a, w], &[mm_out], AttributeBag::new()).unwrap();
    let add_out = graph.add_value();
    graph.add_node("Add", "add0", &[mm_out, bias], &[add_out], AttributeBag::new()).unwrap();

    // A dead branch the same pipeline's DCE pass should remove: reads
    // `mm_out` too, but feeds nothing reachable from the declared output.
    let dead_out = graph.add_value();
    graph.add_node("Relu", "dead_relu", &[mm_out], &[dead_out], AttributeBag::new()).unwrap();

    graph.push_declared_output(add_out);
    (graph, add_out)
}

#[test]
fn default_pipeline_fuses_matmul_add_and_drops_the_dead_branch() {
    let (mut graph, add_out) = matmul_add_graph();
    assert_eq!(graph.node_count(), 3);

    let manager = PassManager::default_pipeline();
    manager.run_all(&mut graph).unwrap();

    // dead_relu is gone and mm0/add0 collapsed into one fused node.
    assert_eq!(graph.node_count(), 1);
    let fused = graph.nodes().next().unwrap();
    assert_eq!(fused.op_type, "FusedMatMulAdd");
    assert_eq!(fused.outputs, vec![add_out]);

    graph.validate().unwrap();
}

#[test]
fn default_pipeline_is_idempotent_on_a_second_run() {
    let (mut graph, _) = matmul_add_graph();

    let manager = PassManager::default_pipeline();
    manager.run_all(&mut graph).unwrap();
    let node_count_after_first = graph.node_count();

    manager.run_all(&mut graph).unwrap();
    assert_eq!(graph.node_count(), node_count_after_first);
    graph.validate().unwrap();
}

#[test]
fn default_pipeline_folds_constants_ahead_of_fusion() {
    let mut graph = Graph::new();
    let c1 = graph.add_initializer("c1", Tensor::from_f32_array(ndarray::arr1(&[1.0, 2.0]).into_dyn()));
    let c2 = graph.add_initializer("c2", Tensor::from_f32_array(ndarray::arr1(&[3.0, 4.0]).into_dyn()));

    let sum = graph.add_value();
    graph.add_node("Add", "const_add", &[c1, c2], &[sum], AttributeBag::new()).unwrap();
    graph.push_declared_output(sum);

    let manager = PassManager::default_pipeline();
    manager.run_all(&mut graph).unwrap();

    assert_eq!(graph.node_count(), 0);
    let folded = graph.value(sum).unwrap();
    assert!(folded.is_initializer);
    assert_eq!(folded.tensor.as_ref().unwrap().to_f32().unwrap().into_raw_vec(), vec![4.0, 6.0]);
}
