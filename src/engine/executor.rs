use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::backend::{ExecutionContext, ExecutionProvider};
use crate::engine::scheduler::Scheduler;
use crate::error::{EngineError, EngineResult};
use crate::graph::Graph;
use crate::memory::{lifetime, BlockId, Lifetime, MemoryPool};
use crate::tensor::Tensor;
use crate::types::{NodeId, ValueId};

/// Runs a prepared Graph to completion using a [`Scheduler`]'s grouping
/// and a pre-assigned provider per Node, chosen at load time.
pub struct Executor {
    providers: Vec<Box<dyn ExecutionProvider>>,
    assignment: HashMap<NodeId, usize>,
    pool: MemoryPool,
    node_index: HashMap<NodeId, i64>,
    lifetimes: HashMap<ValueId, Lifetime>,
    blocks: Mutex<HashMap<ValueId, BlockId>>,
}

impl Executor {
    /// Runs every provider's `prepare` once, then assigns each Node the
    /// first provider (in preference order) whose `supports_operator`
    /// matches. A Node with no matching provider is a load-time error.
    ///
    /// Takes ownership of `providers` so a [`crate::session::Session`]
    /// can hold the `Executor` directly instead of threading a
    /// borrow-checker lifetime through its own struct.
    pub fn prepare(graph: &Graph, providers: Vec<Box<dyn ExecutionProvider>>, pool_max_size: usize) -> EngineResult<Self> {
        for provider in &providers {
            provider.prepare(graph)?;
        }

        let order = graph.topological_sort()?;
        let mut assignment = HashMap::new();
        for &node_id in &order {
            let node = graph.node(node_id).expect("topological_sort returned a live node id");
            let provider_idx = providers
                .iter()
                .position(|p| p.supports_operator(&node.op_type))
                .ok_or_else(|| EngineError::not_found(format!("no execution provider supports op_type '{}'", node.op_type)))?;
            assignment.insert(node_id, provider_idx);
        }

        let node_index = order.iter().enumerate().map(|(i, &id)| (id, i as i64)).collect();
        let lifetimes = lifetime::analyze(graph, &order);

        Ok(Self {
            providers,
            assignment,
            pool: MemoryPool::new(pool_max_size),
            node_index,
            lifetimes,
            blocks: Mutex::new(HashMap::new()),
        })
    }

    /// Runs every group from the scheduler's plan in order; within a
    /// group, Nodes are computed against a read-only view of the graph
    /// (so it is safe to fan them out across a worker pool when the
    /// `rayon` feature is enabled) and their outputs are written back to
    /// the graph serially once the whole group has finished.
    pub fn run(&self, graph: &mut Graph, scheduler: &dyn Scheduler, ctx: &ExecutionContext) -> EngineResult<()> {
        let groups = scheduler.plan(graph)?;

        for group in groups {
            #[cfg(feature = "rayon")]
            let results: Vec<EngineResult<(NodeId, Vec<(ValueId, Tensor)>)>> =
                group.par_iter().map(|&id| self.compute_node(graph, id, ctx)).collect();
            #[cfg(not(feature = "rayon"))]
            let results: Vec<EngineResult<(NodeId, Vec<(ValueId, Tensor)>)>> =
                group.iter().map(|&id| self.compute_node(graph, id, ctx)).collect();

            for result in results {
                let (node_id, outputs) = result?;
                for (out_id, tensor) in outputs {
                    if let Some(value) = graph.value_mut(out_id) {
                        value.tensor = Some(tensor);
                    }
                }
                self.reclaim(graph, node_id);
            }
        }
        Ok(())
    }

    /// Per-node execution procedure: collect input Tensors (every input
    /// must already carry one), check out each output's storage from the
    /// pool according to its resolved Shape (the returned Tensor's
    /// backing buffer IS the pool block, not an independent allocation),
    /// and execute.
    fn compute_node(
        &self,
        graph: &Graph,
        node_id: NodeId,
        ctx: &ExecutionContext,
    ) -> EngineResult<(NodeId, Vec<(ValueId, Tensor)>)> {
        let node = graph.node(node_id).ok_or_else(|| EngineError::not_found(format!("no such node {node_id}")))?;
        let provider_idx = *self
            .assignment
            .get(&node_id)
            .ok_or_else(|| EngineError::not_found(format!("node {node_id} has no assigned provider")))?;
        let provider = &self.providers[provider_idx];

        let input_tensors: Vec<Tensor> = node
            .inputs
            .iter()
            .map(|&id| {
                graph
                    .value(id)
                    .and_then(|v| v.tensor.clone())
                    .ok_or_else(|| EngineError::invalid_argument(format!("value {id} has no tensor at execution time")))
            })
            .collect::<EngineResult<_>>()?;
        let input_refs: Vec<&Tensor> = input_tensors.iter().collect();

        let mut outputs = Vec::with_capacity(node.outputs.len());
        for &out_id in &node.outputs {
            let shape = graph
                .value(out_id)
                .and_then(|v| v.shape.clone())
                .ok_or_else(|| EngineError::invalid_model(format!("value {out_id} has no shape resolved before execution")))?;
            let dims = shape.as_usize_dims()?;
            let (block, tensor) = self.pool.allocate_tensor_f32(&dims)?;
            self.blocks.lock().expect("executor block map lock poisoned").insert(out_id, block);
            outputs.push(tensor);
        }

        let start = Instant::now();
        provider.execute_node(node, &input_refs, &mut outputs, ctx)?;
        if let Some(sink) = &ctx.profiling {
            sink.record(&node.name, start.elapsed());
        }

        Ok((node_id, node.outputs.iter().copied().zip(outputs).collect()))
    }

    /// Frees pool blocks for any Value whose lifetime ends at this
    /// Node's topological index — Values that feed a later Node, or a
    /// declared graph output, stay resident. The dead Value's Tensor is
    /// taken out of the graph (nothing will read it again) and its
    /// storage handed back to the pool block, so the block's next reuse
    /// starts from real prior storage instead of a fresh allocation.
    fn reclaim(&self, graph: &mut Graph, node_id: NodeId) {
        let Some(&idx) = self.node_index.get(&node_id) else { return };
        let dead: Vec<ValueId> =
            self.lifetimes.iter().filter(|(_, l)| l.death == idx).map(|(&id, _)| id).collect();

        let mut blocks = self.blocks.lock().expect("executor block map lock poisoned");
        for value_id in dead {
            if let Some(block) = blocks.remove(&value_id) {
                match graph.value_mut(value_id).and_then(|v| v.tensor.take()) {
                    Some(tensor) => {
                        let _ = self.pool.free_tensor_f32(block, tensor);
                    }
                    None => {
                        let _ = self.pool.free(block);
                    }
                }
            }
        }
    }
}
