//! The Operator contract and the process-wide op-type registry.
//!
//! Registration happens once, behind a [`std::sync::Once`], instead of
//! via pre-main static constructors: languages without pre-main
//! initialization need an explicit `init_operators()` entry point,
//! called from Session
//! construction"). The registry is read-only after that point.

pub mod activations;
pub mod conv;
pub mod fused;
pub mod math;
pub mod norm;
pub mod shape_ops;

use std::collections::HashMap;
use std::sync::{Once, RwLock};

use crate::attribute::AttributeBag;
use crate::error::EngineResult;
use crate::tensor::Tensor;
use crate::types::Shape;

/// Per-node execution state handed to `Operator::execute`, scoped to a
/// single node rather than a whole run — the run-level context lives in
/// [`crate::engine::ExecutionContext`].
pub struct OpContext<'a> {
    pub node_name: &'a str,
}

/// Logic for one op-type. A fresh instance is produced by the
/// registry's factory for every node, every run: instances are never
/// shared across threads and never assumed `Sync`.
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Rejects wrong input count, dtype, or rank. Must not read tensor
    /// data.
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()>;

    /// Pure function of input shapes/dtypes to output shapes.
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>>;

    /// Rejects a `-1` (unresolved dynamic dimension) sitting on an axis
    /// this operator's own `infer_output_shape`/`execute` does
    /// arithmetic on, checked against each input's *declared* Shape
    /// before shape inference stands a concrete placeholder value in
    /// for it. Most operators only copy dims through and have nothing
    /// to reject; the default accepts any declared shape.
    fn reject_unhandleable_dynamic_dim(&self, _declared: &[Option<&Shape>]) -> EngineResult<()> {
        Ok(())
    }

    /// Reads `inputs`, writes into the already-allocated `outputs`
    /// (shapes were fixed by `infer_output_shape` and the pool already
    /// sized them — `execute` must not reallocate).
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &OpContext) -> EngineResult<()>;
}

type OperatorFactory = Box<dyn Fn(AttributeBag) -> Box<dyn Operator> + Send + Sync>;

static INIT: Once = Once::new();

fn registry() -> &'static RwLock<HashMap<String, OperatorFactory>> {
    static REGISTRY: std::sync::OnceLock<RwLock<HashMap<String, OperatorFactory>>> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers the minimum operator set. Idempotent and safe to call more
/// than once (only the first call has any effect), invoked transparently
/// by [`crate::session::Session::new`] and by any path that needs the
/// registry populated.
pub fn init_operators() {
    INIT.call_once(|| {
        let mut reg = registry().write().expect("operator registry lock poisoned");
        macro_rules! register {
            ($name:expr, $ctor:expr) => {
                reg.insert($name.to_string(), Box::new($ctor));
            };
        }

        register!("Relu", |_attrs| Box::new(activations::Relu) as Box<dyn Operator>);
        register!("Sigmoid", |_attrs| Box::new(activations::Sigmoid) as Box<dyn Operator>);
        register!("Tanh", |_attrs| Box::new(activations::Tanh) as Box<dyn Operator>);
        register!("Gelu", |_attrs| Box::new(activations::Gelu) as Box<dyn Operator>);
        register!("Silu", |_attrs| Box::new(activations::Silu) as Box<dyn Operator>);

        register!("Add", |_attrs| Box::new(math::Add) as Box<dyn Operator>);
        register!("Sub", |_attrs| Box::new(math::Sub) as Box<dyn Operator>);
        register!("Mul", |_attrs| Box::new(math::Mul) as Box<dyn Operator>);
        register!("Div", |_attrs| Box::new(math::Div) as Box<dyn Operator>);
        register!("MatMul", |_attrs| Box::new(math::MatMul) as Box<dyn Operator>);

        register!("Conv", |attrs| Box::new(conv::Conv::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("MaxPool", |attrs| Box::new(conv::MaxPool::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("AveragePool", |attrs| Box::new(conv::AveragePool::from_attrs(&attrs)) as Box<dyn Operator>);

        register!("BatchNormalization", |attrs| {
            Box::new(norm::BatchNormalization::from_attrs(&attrs)) as Box<dyn Operator>
        });
        register!("LayerNormalization", |attrs| {
            Box::new(norm::LayerNormalization::from_attrs(&attrs)) as Box<dyn Operator>
        });
        register!("RMSNorm", |attrs| Box::new(norm::RMSNorm::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("Softmax", |attrs| Box::new(norm::Softmax::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("LogSoftmax", |attrs| Box::new(norm::LogSoftmax::from_attrs(&attrs)) as Box<dyn Operator>);

        register!("Reshape", |_attrs| Box::new(shape_ops::Reshape) as Box<dyn Operator>);
        register!("Concat", |attrs| Box::new(shape_ops::Concat::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("Split", |attrs| Box::new(shape_ops::Split::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("Transpose", |attrs| Box::new(shape_ops::Transpose::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("Gather", |attrs| Box::new(shape_ops::Gather::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("Slice", |attrs| Box::new(shape_ops::Slice::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("Embedding", |_attrs| Box::new(shape_ops::Embedding) as Box<dyn Operator>);

        register!("FusedConvBNReLU", |attrs| {
            Box::new(fused::FusedConvBnReLU::from_attrs(&attrs)) as Box<dyn Operator>
        });
        register!("FusedConvReLU", |attrs| {
            Box::new(fused::FusedConvReLU::from_attrs(&attrs)) as Box<dyn Operator>
        });
        register!("FusedBNReLU", |attrs| Box::new(fused::FusedBnReLU::from_attrs(&attrs)) as Box<dyn Operator>);
        register!("FusedMatMulAdd", |_attrs| Box::new(fused::FusedMatMulAdd) as Box<dyn Operator>);
    });
}

/// Looks up `op_type` and instantiates a fresh [`Operator`] carrying a
/// copy of `attributes`. Returns `None` if no operator is registered —
/// callers decide whether that is pass-through (shape inference) or a
/// hard NOT_FOUND (scheduler).
pub fn instantiate(op_type: &str, attributes: &AttributeBag) -> Option<Box<dyn Operator>> {
    init_operators();
    let reg = registry().read().expect("operator registry lock poisoned");
    reg.get(op_type).map(|factory| factory(attributes.clone()))
}

pub fn is_registered(op_type: &str) -> bool {
    init_operators();
    registry().read().expect("operator registry lock poisoned").contains_key(op_type)
}
