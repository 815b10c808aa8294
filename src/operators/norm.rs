use crate::attribute::AttributeBag;
use crate::error::{EngineError, EngineResult};
use crate::operators::{OpContext, Operator};
use crate::tensor::Tensor;
use crate::types::Shape;

fn unary_shape(inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
    Ok(vec![inputs[0].shape().clone()])
}

/// Inference-mode batch norm over running mean/var. Inputs:
/// `[x, scale, bias, mean, var]`, all per-channel (dim 1 of NCHW `x`).
pub struct BatchNormalization {
    epsilon: f32,
}

impl BatchNormalization {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            epsilon: attrs.get_float("epsilon", 1e-5),
        }
    }
}

impl Operator for BatchNormalization {
    fn name(&self) -> &str {
        "BatchNormalization"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 5 {
            return Err(EngineError::invalid_argument(
                "BatchNormalization requires [x, scale, bias, mean, var]",
            ));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        unary_shape(inputs)
    }
    #[tracing::instrument(skip_all, name = "kernel_batch_norm")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let scale = inputs[1].to_f32()?;
        let bias = inputs[2].to_f32()?;
        let mean = inputs[3].to_f32()?;
        let var = inputs[4].to_f32()?;
        if x.ndim() < 2 {
            return Err(EngineError::invalid_argument("BatchNormalization requires rank >= 2 input (N, C, ...)"));
        }

        let mut out = x.clone();
        for (idx, value) in out.indexed_iter_mut() {
            let c = idx[1];
            let denom = (var[[c]] + self.epsilon).sqrt();
            *value = (*value - mean[[c]]) / denom * scale[[c]] + bias[[c]];
        }
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

/// Normalizes over the last axis: `(x - mean) / sqrt(var + eps) * scale
/// + bias`.
pub struct LayerNormalization {
    epsilon: f32,
}

impl LayerNormalization {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            epsilon: attrs.get_float("epsilon", 1e-5),
        }
    }
}

impl Operator for LayerNormalization {
    fn name(&self) -> &str {
        "LayerNormalization"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() < 3 {
            return Err(EngineError::invalid_argument(
                "LayerNormalization requires [x, scale, bias]",
            ));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        unary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let scale = inputs[1].to_f32()?;
        let bias = inputs[2].to_f32()?;
        let axis = x.ndim() - 1;
        let last = x.shape()[axis];

        let mut out = x.clone();
        for mut lane in out.lanes_mut(ndarray::Axis(axis)) {
            let mean = lane.iter().sum::<f32>() / last as f32;
            let var = lane.iter().map(|&v| (v - mean).powi(2)).sum::<f32>() / last as f32;
            let denom = (var + self.epsilon).sqrt();
            for (i, v) in lane.iter_mut().enumerate() {
                let s = scale.iter().nth(i).copied().unwrap_or(1.0);
                let b = bias.iter().nth(i).copied().unwrap_or(0.0);
                *v = (*v - mean) / denom * s + b;
            }
        }
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

/// RMSNorm clamps `rms^2 + eps` to a positive floor of `eps`.
pub struct RMSNorm {
    epsilon: f32,
}

impl RMSNorm {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            epsilon: attrs.get_float("epsilon", 1e-6),
        }
    }
}

impl Operator for RMSNorm {
    fn name(&self) -> &str {
        "RMSNorm"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() < 2 {
            return Err(EngineError::invalid_argument("RMSNorm requires [x, scale]"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        unary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let scale = inputs[1].to_f32()?;
        let axis = x.ndim() - 1;
        let last = x.shape()[axis];

        let mut out = x.clone();
        for mut lane in out.lanes_mut(ndarray::Axis(axis)) {
            let mean_sq = lane.iter().map(|&v| v * v).sum::<f32>() / last as f32;
            let floored = (mean_sq + self.epsilon).max(self.epsilon);
            let denom = floored.sqrt();
            for (i, v) in lane.iter_mut().enumerate() {
                let s = scale.iter().nth(i).copied().unwrap_or(1.0);
                *v = *v / denom * s;
            }
        }
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

fn axis_softmax(x: &ndarray::ArrayD<f32>, axis: usize, log: bool) -> ndarray::ArrayD<f32> {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(ndarray::Axis(axis)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v = if log { (*v / sum).ln() } else { *v / sum };
        }
    }
    out
}

/// Subtracts the per-axis max before exponentiation for numerical
/// stability.
pub struct Softmax {
    axis: i64,
}

impl Softmax {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            axis: attrs.get_int("axis", -1),
        }
    }

    fn resolved_axis(&self, rank: usize) -> usize {
        if self.axis < 0 {
            (rank as i64 + self.axis).max(0) as usize
        } else {
            self.axis as usize
        }
    }
}

impl Operator for Softmax {
    fn name(&self) -> &str {
        "Softmax"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 1 {
            return Err(EngineError::invalid_argument("Softmax expects exactly 1 input"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let axis = self.resolved_axis(x.ndim());
        outputs[0] = Tensor::from_f32_array(axis_softmax(&x, axis, false));
        Ok(())
    }
}

pub struct LogSoftmax {
    axis: i64,
}

impl LogSoftmax {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            axis: attrs.get_int("axis", -1),
        }
    }

    fn resolved_axis(&self, rank: usize) -> usize {
        if self.axis < 0 {
            (rank as i64 + self.axis).max(0) as usize
        } else {
            self.axis as usize
        }
    }
}

impl Operator for LogSoftmax {
    fn name(&self) -> &str {
        "LogSoftmax"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 1 {
            return Err(EngineError::invalid_argument("LogSoftmax expects exactly 1 input"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let axis = self.resolved_axis(x.ndim());
        outputs[0] = Tensor::from_f32_array(axis_softmax(&x, axis, true));
        Ok(())
    }
}
