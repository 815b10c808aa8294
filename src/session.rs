//! Session: the entry point a caller actually constructs. Owns the
//! Graph, the configured [`ExecutionProvider`]s, the pass manager, and
//! the [`Executor`]; exposes load/run/introspection.

use std::collections::HashMap;

use ndarray::{Axis, Slice};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{CpuProvider, ExecutionContext, ExecutionProvider};
use crate::engine::executor::Executor;
use crate::engine::scheduler::{Scheduler, TopologicalScheduler};
use crate::error::{EngineError, EngineResult};
use crate::graph::Graph;
use crate::model::SimpleOnnxModel;
use crate::operators;
use crate::optimizer::{
    constant_folding::ConstantFolding, dce::DeadCodeElimination, fusion::OperatorFusion,
    memory_layout::MemoryLayout, subgraph_replace::SubgraphReplacement, Pass, PassManager,
};
use crate::shape_inference;
use crate::tensor::Tensor;
use crate::types::Shape;

/// Optimization effort, from none (fastest load, widest applicability
/// for debugging) through the full stock pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphOptimizationLevel {
    None,
    Basic,
    Extended,
    All,
}

impl Default for GraphOptimizationLevel {
    fn default() -> Self {
        GraphOptimizationLevel::Basic
    }
}

/// Session-wide configuration. `execution_providers` names providers in
/// preference order; an empty list falls back to every provider the
/// registry knows about, in registry order (today just
/// `CPUExecutionProvider`). Deserializable so it can be loaded from a
/// JSON config file via [`SessionOptions::from_json`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub execution_providers: Vec<String>,
    pub graph_optimization_level: GraphOptimizationLevel,
    pub enable_operator_fusion: bool,
    pub enable_profiling: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            execution_providers: Vec::new(),
            graph_optimization_level: GraphOptimizationLevel::Basic,
            enable_operator_fusion: true,
            enable_profiling: false,
        }
    }
}

impl SessionOptions {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::invalid_argument(format!("bad session options JSON: {e}")))
    }
}

/// A `Pass` with `OperatorFusion`'s name and dependency but a no-op
/// body, so `MemoryLayout` (which depends on `"operator_fusion"`
/// having run) can still be scheduled when `enable_operator_fusion` is
/// `false` without inventing a separate dependency graph per toggle
/// (DESIGN.md records this resolution).
struct DisabledFusion;

impl Pass for DisabledFusion {
    fn name(&self) -> &str {
        "operator_fusion"
    }

    fn dependencies(&self) -> &[&str] {
        &["subgraph_replacement"]
    }

    fn run(&self, _graph: &mut Graph) -> anyhow::Result<()> {
        Ok(())
    }
}

fn build_pass_manager(level: GraphOptimizationLevel, enable_fusion: bool) -> PassManager {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    if level == GraphOptimizationLevel::None {
        return PassManager::new(passes);
    }

    passes.push(Box::new(ConstantFolding));
    passes.push(Box::new(DeadCodeElimination));

    if level == GraphOptimizationLevel::Extended || level == GraphOptimizationLevel::All {
        passes.push(Box::new(SubgraphReplacement::default()));
    }

    if level == GraphOptimizationLevel::All {
        if enable_fusion {
            passes.push(Box::new(OperatorFusion::default()));
        } else {
            passes.push(Box::new(DisabledFusion));
        }
        passes.push(Box::new(MemoryLayout));
    }

    PassManager::new(passes)
}

fn make_provider(name: &str) -> EngineResult<Box<dyn ExecutionProvider>> {
    match name {
        "CPUExecutionProvider" => Ok(Box::new(CpuProvider)),
        other => Err(EngineError::not_found(format!("no execution provider registered under name '{other}'"))),
    }
}

/// Owns the prepared [`Graph`] and drives `Run` calls against it. The
/// scheduler used by `run`/`run_by_name`/`run_batched` can be swapped
/// per call via the `_with_scheduler` variants; the default is the
/// serial, deterministic [`TopologicalScheduler`].
pub struct Session {
    graph: Graph,
    options: SessionOptions,
    executor: Executor,
}

impl Session {
    /// Load flow: convert the neutral ONNX model to a `Graph`, validate,
    /// infer shapes (warning, not failing, on per-node failure),
    /// optimize if requested, then assign providers
    /// and run each one's `prepare`.
    pub fn new(model: &SimpleOnnxModel, options: SessionOptions) -> EngineResult<Self> {
        operators::init_operators();

        let mut graph = model.to_graph()?;
        graph.validate()?;

        if let Err(err) = shape_inference::infer_shapes(&mut graph) {
            warn!(%err, "shape inference failed during load, proceeding with unresolved shapes");
        }

        let pass_manager = build_pass_manager(options.graph_optimization_level, options.enable_operator_fusion);
        pass_manager.run_all(&mut graph)?;

        let providers = if options.execution_providers.is_empty() {
            vec![Box::new(CpuProvider) as Box<dyn ExecutionProvider>]
        } else {
            options
                .execution_providers
                .iter()
                .map(|name| make_provider(name))
                .collect::<EngineResult<Vec<_>>>()?
        };

        let executor = Executor::prepare(&graph, providers, 0)?;

        Ok(Self { graph, options, executor })
    }

    /// Parses `json` into [`SessionOptions`] and loads `model` with it
    /// — the "load configuration from a file" entry point.
    pub fn with_config_json(json: &str, model: &SimpleOnnxModel) -> EngineResult<Self> {
        let options = SessionOptions::from_json(json)?;
        Self::new(model, options)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    // --- introspection --------------------------------------------------

    pub fn input_count(&self) -> usize {
        self.graph.declared_inputs().len()
    }

    pub fn output_count(&self) -> usize {
        self.graph.declared_outputs().len()
    }

    /// Declared input names, falling back to `"input_<i>"` for any
    /// Value that never received a real name.
    pub fn input_names(&self) -> Vec<String> {
        self.graph
            .declared_inputs()
            .iter()
            .enumerate()
            .map(|(i, &id)| self.display_name(id, "input", i))
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.graph
            .declared_outputs()
            .iter()
            .enumerate()
            .map(|(i, &id)| self.display_name(id, "output", i))
            .collect()
    }

    pub fn input_shapes(&self) -> Vec<Option<Shape>> {
        self.graph.declared_inputs().iter().map(|&id| self.graph.value(id).and_then(|v| v.shape.clone())).collect()
    }

    pub fn output_shapes(&self) -> Vec<Option<Shape>> {
        self.graph.declared_outputs().iter().map(|&id| self.graph.value(id).and_then(|v| v.shape.clone())).collect()
    }

    fn display_name(&self, id: crate::types::ValueId, prefix: &str, idx: usize) -> String {
        match self.graph.value(id) {
            Some(v) if !v.name.is_empty() && !v.name.starts_with("value_") => v.name.clone(),
            _ => format!("{prefix}_{idx}"),
        }
    }

    // --- run --------------------------------------------------------

    /// Run flow: validate input count, bind each Tensor to its declared
    /// input Value, execute with the default scheduler, collect declared
    /// outputs.
    pub fn run(&mut self, inputs: Vec<Tensor>) -> EngineResult<Vec<Tensor>> {
        self.run_with_scheduler(inputs, &TopologicalScheduler)
    }

    pub fn run_with_scheduler(&mut self, inputs: Vec<Tensor>, scheduler: &dyn Scheduler) -> EngineResult<Vec<Tensor>> {
        let declared = self.graph.declared_inputs().to_vec();
        if inputs.len() != declared.len() {
            return Err(EngineError::invalid_argument(format!(
                "run: expected {} input(s), got {}",
                declared.len(),
                inputs.len()
            )));
        }

        for (&id, tensor) in declared.iter().zip(inputs) {
            let value = self
                .graph
                .value_mut(id)
                .ok_or_else(|| EngineError::invalid_model(format!("declared input {id} does not exist")))?;
            value.tensor = Some(tensor);
        }

        let ctx = if self.options.enable_profiling {
            ExecutionContext { profiling: Some(Default::default()) }
        } else {
            ExecutionContext::default()
        };

        self.executor.run(&mut self.graph, scheduler, &ctx)?;

        self.graph
            .declared_outputs()
            .iter()
            .map(|&id| {
                self.graph
                    .value(id)
                    .and_then(|v| v.tensor.clone())
                    .ok_or_else(|| EngineError::invalid_argument(format!("declared output {id} has no tensor after run")))
            })
            .collect()
    }

    /// Maps `{name -> Tensor}` onto the declared inputs by
    /// [`Session::input_names`], in declared order; a missing name is
    /// `NOT_FOUND`.
    pub fn run_by_name(&mut self, inputs: HashMap<String, Tensor>) -> EngineResult<HashMap<String, Tensor>> {
        let names = self.input_names();
        let mut ordered = Vec::with_capacity(names.len());
        let mut inputs = inputs;
        for name in &names {
            let tensor = inputs
                .remove(name)
                .ok_or_else(|| EngineError::not_found(format!("run_by_name: missing input named '{name}'")))?;
            ordered.push(tensor);
        }

        let outputs = self.run(ordered)?;
        let out_names = self.output_names();
        Ok(out_names.into_iter().zip(outputs).collect())
    }

    /// Batched run: stacks `samples.len()` unbatched inputs along dim 0
    /// into one merged input per declared input, runs once, and splits
    /// every output evenly back into one Tensor per sample.
    /// Every input and output must have dim 0 as its batch dimension;
    /// samples must agree in count and rank of inputs or this rejects.
    pub fn run_batched(&mut self, samples: Vec<Vec<Tensor>>) -> EngineResult<Vec<Vec<Tensor>>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let n = samples.len();
        let num_inputs = samples[0].len();
        if num_inputs != self.input_count() {
            return Err(EngineError::invalid_argument(format!(
                "run_batched: expected {} input(s) per sample, got {}",
                self.input_count(),
                num_inputs
            )));
        }
        for sample in &samples {
            if sample.len() != num_inputs {
                return Err(EngineError::invalid_argument(
                    "run_batched: every sample must supply the same number of inputs",
                ));
            }
        }

        let mut merged_inputs = Vec::with_capacity(num_inputs);
        for j in 0..num_inputs {
            let arrays = samples
                .iter()
                .map(|s| s[j].as_f32())
                .collect::<EngineResult<Vec<_>>>()?;
            if arrays.iter().any(|a| a.ndim() == 0) {
                return Err(EngineError::invalid_argument(
                    "run_batched: every input must have dim 0 as its batch dimension (found a scalar)",
                ));
            }
            let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
            let merged = ndarray::concatenate(Axis(0), &views)
                .map_err(|e| EngineError::invalid_argument(format!("run_batched: could not stack input {j}: {e}")))?;
            merged_inputs.push(Tensor::from_f32_array(merged));
        }

        let outputs = self.run(merged_inputs)?;

        let mut per_sample: Vec<Vec<Tensor>> = (0..n).map(|_| Vec::with_capacity(outputs.len())).collect();
        for out in outputs {
            let arr = out.to_f32()?;
            if arr.ndim() == 0 || arr.shape()[0] % n != 0 {
                return Err(EngineError::invalid_argument(
                    "run_batched: an output's dim 0 does not evenly split into the sample count",
                ));
            }
            let per = arr.shape()[0] / n;
            for i in 0..n {
                let slice = arr.slice_axis(Axis(0), Slice::from((i * per) as isize..((i + 1) * per) as isize)).to_owned();
                per_sample[i].push(Tensor::from_f32_array(slice));
            }
        }
        Ok(per_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SimpleOnnxInput, SimpleOnnxModel, SimpleOnnxNode};

    fn add_model() -> SimpleOnnxModel {
        SimpleOnnxModel {
            model_version: 1,
            input_infos: vec![
                SimpleOnnxInput { name: "a".into(), data_type: 1, dims: vec![2, 3] },
                SimpleOnnxInput { name: "b".into(), data_type: 1, dims: vec![2, 3] },
            ],
            output_names: vec!["y".into()],
            initializers: vec![],
            nodes: vec![SimpleOnnxNode {
                name: "add0".into(),
                op_type: "Add".into(),
                inputs: vec!["a".into(), "b".into()],
                outputs: vec!["y".into()],
                attributes: vec![],
            }],
        }
    }

    #[test]
    fn end_to_end_add_of_ones_and_twos() {
        let model = add_model();
        let mut session = Session::new(&model, SessionOptions::default()).unwrap();

        let a = Tensor::from_f32_array(ndarray::arr2(&[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]).into_dyn());
        let b = Tensor::from_f32_array(ndarray::arr2(&[[2.0, 2.0, 2.0], [2.0, 2.0, 2.0]]).into_dyn());
        let outputs = session.run(vec![a, b]).unwrap();

        assert_eq!(outputs.len(), 1);
        let result = outputs[0].to_f32().unwrap();
        assert_eq!(result.into_raw_vec(), vec![3.0; 6]);
    }

    #[test]
    fn run_rejects_wrong_input_count() {
        let model = add_model();
        let mut session = Session::new(&model, SessionOptions::default()).unwrap();
        let a = Tensor::zeros_f32(&[2, 3]);
        assert!(session.run(vec![a]).is_err());
    }

    #[test]
    fn run_by_name_maps_declared_names() {
        let model = add_model();
        let mut session = Session::new(&model, SessionOptions::default()).unwrap();

        let mut inputs = HashMap::new();
        inputs.insert("a".to_string(), Tensor::zeros_f32(&[2, 3]));
        inputs.insert("b".to_string(), Tensor::zeros_f32(&[2, 3]));
        let outputs = session.run_by_name(inputs).unwrap();
        assert!(outputs.contains_key("y"));
    }

    #[test]
    fn run_by_name_rejects_missing_input_name() {
        let model = add_model();
        let mut session = Session::new(&model, SessionOptions::default()).unwrap();
        let mut inputs = HashMap::new();
        inputs.insert("a".to_string(), Tensor::zeros_f32(&[2, 3]));
        assert!(session.run_by_name(inputs).is_err());
    }

    #[test]
    fn run_batched_stacks_and_splits_along_dim_zero() {
        let model = add_model();
        let mut session = Session::new(&model, SessionOptions::default()).unwrap();

        let sample_a = Tensor::from_f32_array(ndarray::arr2(&[[1.0, 1.0, 1.0]]).into_dyn());
        let sample_b = Tensor::from_f32_array(ndarray::arr2(&[[2.0, 2.0, 2.0]]).into_dyn());
        let samples = vec![vec![sample_a.clone(), sample_b.clone()], vec![sample_a, sample_b]];

        let results = session.run_batched(samples).unwrap();
        assert_eq!(results.len(), 2);
        for sample_out in &results {
            assert_eq!(sample_out.len(), 1);
            assert_eq!(sample_out[0].to_f32().unwrap().into_raw_vec(), vec![3.0, 3.0, 3.0]);
        }
    }

    #[test]
    fn optimization_level_none_skips_constant_folding() {
        let model = SimpleOnnxModel {
            model_version: 1,
            input_infos: vec![SimpleOnnxInput { name: "x".into(), data_type: 1, dims: vec![2] }],
            output_names: vec!["y".into()],
            initializers: vec![crate::model::SimpleOnnxInitializer {
                name: "c1".into(),
                data_type: 1,
                dims: vec![2],
                raw_data: [1.0f32, 1.0f32].iter().flat_map(|v| v.to_le_bytes()).collect(),
            }],
            nodes: vec![SimpleOnnxNode {
                name: "add0".into(),
                op_type: "Add".into(),
                inputs: vec!["x".into(), "c1".into()],
                outputs: vec!["y".into()],
                attributes: vec![],
            }],
        };

        let options = SessionOptions { graph_optimization_level: GraphOptimizationLevel::None, ..Default::default() };
        let session = Session::new(&model, options).unwrap();
        assert_eq!(session.graph().node_count(), 1);
    }

    #[test]
    fn unknown_execution_provider_name_is_not_found() {
        let model = add_model();
        let options = SessionOptions { execution_providers: vec!["GhostProvider".into()], ..Default::default() };
        assert!(Session::new(&model, options).is_err());
    }
}
