pub mod cpu;

pub use cpu::CpuProvider;

use std::sync::Mutex;
use std::time::Duration;

use crate::error::EngineResult;
use crate::graph::{Graph, Node};
use crate::operators::OpContext;
use crate::tensor::Tensor;

/// Per-run state handed to every `execute_node` call. Carries an
/// optional profiling sink populated only when
/// `SessionOptions.enable_profiling` is set.
#[derive(Default)]
pub struct ExecutionContext {
    pub profiling: Option<ProfilingSink>,
}

#[derive(Default)]
pub struct ProfilingSink {
    samples: Mutex<Vec<(String, Duration)>>,
}

impl ProfilingSink {
    pub fn record(&self, node_name: &str, elapsed: Duration) {
        self.samples.lock().expect("profiling sink lock poisoned").push((node_name.to_string(), elapsed));
    }

    pub fn samples(&self) -> Vec<(String, Duration)> {
        self.samples.lock().expect("profiling sink lock poisoned").clone()
    }
}

/// A backend capable of executing a subset of op-types. The CPU
/// provider is the only one required; the trait is the extension point
/// for a future non-CPU provider.
pub trait ExecutionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    fn supports_operator(&self, op_type: &str) -> bool;

    /// Backend-specific compilation/memory setup, called once at session
    /// prepare time.
    fn prepare(&self, graph: &Graph) -> EngineResult<()> {
        let _ = graph;
        Ok(())
    }

    fn execute_node(
        &self,
        node: &Node,
        inputs: &[&Tensor],
        outputs: &mut [Tensor],
        ctx: &ExecutionContext,
    ) -> EngineResult<()>;
}

pub(crate) fn op_context(node: &Node) -> OpContext<'_> {
    OpContext { node_name: &node.name }
}
