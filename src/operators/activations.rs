use crate::error::{EngineError, EngineResult};
use crate::operators::{OpContext, Operator};
use crate::tensor::Tensor;
use crate::types::Shape;

fn unary_shape(inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
    if inputs.len() != 1 {
        return Err(EngineError::invalid_argument(format!(
            "expected 1 input, got {}",
            inputs.len()
        )));
    }
    Ok(vec![inputs[0].shape().clone()])
}

fn unary_validate(inputs: &[&Tensor]) -> EngineResult<()> {
    if inputs.len() != 1 {
        return Err(EngineError::invalid_argument(format!(
            "expected 1 input, got {}",
            inputs.len()
        )));
    }
    Ok(())
}

pub struct Relu;
impl Operator for Relu {
    fn name(&self) -> &str {
        "Relu"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        unary_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    #[tracing::instrument(skip_all, name = "kernel_relu")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let y = x.mapv(|v| v.max(0.0));
        outputs[0] = Tensor::from_f32_array(y);
        Ok(())
    }
}

pub struct Sigmoid;
impl Operator for Sigmoid {
    fn name(&self) -> &str {
        "Sigmoid"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        unary_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    #[tracing::instrument(skip_all, name = "kernel_sigmoid")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let y = x.mapv(|v| 1.0 / (1.0 + (-v).exp()));
        outputs[0] = Tensor::from_f32_array(y);
        Ok(())
    }
}

pub struct Tanh;
impl Operator for Tanh {
    fn name(&self) -> &str {
        "Tanh"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        unary_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let y = x.mapv(|v| v.tanh());
        outputs[0] = Tensor::from_f32_array(y);
        Ok(())
    }
}

/// tanh-approximation GELU:
/// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`.
pub struct Gelu;
const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_6; // sqrt(2/pi)
const GELU_COEFF: f32 = 0.044715;

impl Operator for Gelu {
    fn name(&self) -> &str {
        "Gelu"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        unary_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    #[tracing::instrument(skip_all, name = "kernel_gelu")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let y = x.mapv(|v| {
            let inner = GELU_SQRT_2_OVER_PI * (v + GELU_COEFF * v.powi(3));
            0.5 * v * (1.0 + inner.tanh())
        });
        outputs[0] = Tensor::from_f32_array(y);
        Ok(())
    }
}

/// `x * sigmoid(x)`.
pub struct Silu;
impl Operator for Silu {
    fn name(&self) -> &str {
        "Silu"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        unary_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        unary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let y = x.mapv(|v| v * (1.0 / (1.0 + (-v).exp())));
        outputs[0] = Tensor::from_f32_array(y);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_matches_scenario_2() {
        let x = Tensor::from_f32_array(ndarray::arr1(&[-2.0, -1.0, 0.0, 1.0, 2.0, 3.0]).into_dyn());
        let mut out = vec![Tensor::zeros_f32(&[6])];
        Relu.execute(&[&x], &mut out, &OpContext { node_name: "relu" }).unwrap();
        assert_eq!(out[0].to_f32().unwrap().into_raw_vec(), vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }
}
