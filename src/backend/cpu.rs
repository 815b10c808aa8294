use crate::backend::{op_context, ExecutionContext, ExecutionProvider};
use crate::error::EngineError;
use crate::graph::{Graph, Node};
use crate::operators;
use crate::tensor::Tensor;

/// The CPU backend: every registered operator in [`operators`] can run
/// here. Required; the only provider this crate ships — GPU execution
/// is out of scope.
#[derive(Debug, Default)]
pub struct CpuProvider;

impl ExecutionProvider for CpuProvider {
    fn name(&self) -> &str {
        "CPUExecutionProvider"
    }

    fn supports_operator(&self, op_type: &str) -> bool {
        operators::is_registered(op_type)
    }

    fn prepare(&self, _graph: &Graph) -> crate::error::EngineResult<()> {
        operators::init_operators();
        Ok(())
    }

    #[tracing::instrument(skip(self, inputs, outputs, _ctx), fields(node = %node.name, op = %node.op_type))]
    fn execute_node(
        &self,
        node: &Node,
        inputs: &[&Tensor],
        outputs: &mut [Tensor],
        _ctx: &ExecutionContext,
    ) -> crate::error::EngineResult<()> {
        let op = operators::instantiate(&node.op_type, &node.attributes)
            .ok_or_else(|| EngineError::not_found(format!("no operator registered for op_type '{}'", node.op_type)))?;
        op.validate_inputs(inputs)?;
        let ctx = op_context(node);
        op.execute(inputs, outputs, &ctx)
    }
}
