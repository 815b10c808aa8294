use crate::attribute::AttributeBag;
use crate::error::{EngineError, EngineResult};
use crate::operators::conv::Conv;
use crate::operators::math::MatMul;
use crate::operators::norm::BatchNormalization;
use crate::operators::{OpContext, Operator};
use crate::tensor::Tensor;
use crate::types::Shape;

fn relu_inplace(t: Tensor) -> EngineResult<Tensor> {
    let arr = t.to_f32()?.mapv(|v| v.max(0.0));
    Ok(Tensor::from_f32_array(arr))
}

/// Replaces a `Conv -> BatchNormalization -> Relu` chain (operator
/// fusion pattern). Inputs: `[x, w, scale, bias, mean, var]`; the
/// convolution itself carries no bias term since the batch norm affine
/// shift subsumes it.
pub struct FusedConvBnReLU {
    conv: Conv,
    bn: BatchNormalization,
}

impl FusedConvBnReLU {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            conv: Conv::from_attrs(attrs),
            bn: BatchNormalization::from_attrs(attrs),
        }
    }
}

impl Operator for FusedConvBnReLU {
    fn name(&self) -> &str {
        "FusedConvBNReLU"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 6 {
            return Err(EngineError::invalid_argument(
                "FusedConvBNReLU requires [x, w, scale, bias, mean, var]",
            ));
        }
        self.conv.validate_inputs(&inputs[0..2])
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        self.conv.infer_output_shape(&inputs[0..2])
    }
    #[tracing::instrument(skip_all, name = "kernel_fused_conv_bn_relu")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &OpContext) -> EngineResult<()> {
        let conv_shape = self.conv.infer_output_shape(&inputs[0..2])?;
        let mut conv_out = vec![Tensor::zeros_f32(&conv_shape[0].as_usize_dims()?)];
        self.conv.execute(&inputs[0..2], &mut conv_out, ctx)?;

        let bn_inputs: Vec<&Tensor> = std::iter::once(&conv_out[0]).chain(inputs[2..6].iter().copied()).collect();
        let mut bn_out = vec![Tensor::zeros_f32(&conv_shape[0].as_usize_dims()?)];
        self.bn.execute(&bn_inputs, &mut bn_out, ctx)?;

        outputs[0] = relu_inplace(bn_out.into_iter().next().unwrap())?;
        Ok(())
    }
}

/// Replaces a `Conv -> Relu` chain.
pub struct FusedConvReLU {
    conv: Conv,
}

impl FusedConvReLU {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self { conv: Conv::from_attrs(attrs) }
    }
}

impl Operator for FusedConvReLU {
    fn name(&self) -> &str {
        "FusedConvReLU"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        self.conv.validate_inputs(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.conv.infer_output_shape(inputs)
    }
    #[tracing::instrument(skip_all, name = "kernel_fused_conv_relu")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &OpContext) -> EngineResult<()> {
        let conv_shape = self.conv.infer_output_shape(inputs)?;
        let mut conv_out = vec![Tensor::zeros_f32(&conv_shape[0].as_usize_dims()?)];
        self.conv.execute(inputs, &mut conv_out, ctx)?;
        outputs[0] = relu_inplace(conv_out.into_iter().next().unwrap())?;
        Ok(())
    }
}

/// Replaces a `BatchNormalization -> Relu` chain.
pub struct FusedBnReLU {
    bn: BatchNormalization,
}

impl FusedBnReLU {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self { bn: BatchNormalization::from_attrs(attrs) }
    }
}

impl Operator for FusedBnReLU {
    fn name(&self) -> &str {
        "FusedBNReLU"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        self.bn.validate_inputs(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.bn.infer_output_shape(inputs)
    }
    #[tracing::instrument(skip_all, name = "kernel_fused_bn_relu")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &OpContext) -> EngineResult<()> {
        let shape = self.bn.infer_output_shape(inputs)?;
        let mut bn_out = vec![Tensor::zeros_f32(&shape[0].as_usize_dims()?)];
        self.bn.execute(inputs, &mut bn_out, ctx)?;
        outputs[0] = relu_inplace(bn_out.into_iter().next().unwrap())?;
        Ok(())
    }
}

/// Replaces a `MatMul -> Add` chain. Inputs: `[a, b, bias]`, with bias
/// broadcast onto the matmul result the same way a plain `Add` would.
pub struct FusedMatMulAdd;

impl Operator for FusedMatMulAdd {
    fn name(&self) -> &str {
        "FusedMatMulAdd"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 3 {
            return Err(EngineError::invalid_argument("FusedMatMulAdd requires [a, b, bias]"));
        }
        MatMul.validate_inputs(&inputs[0..2])
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        MatMul.infer_output_shape(&inputs[0..2])
    }
    #[tracing::instrument(skip_all, name = "kernel_fused_matmul_add")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], ctx: &OpContext) -> EngineResult<()> {
        let mm_shape = MatMul.infer_output_shape(&inputs[0..2])?;
        let mut mm_out = vec![Tensor::zeros_f32(&mm_shape[0].as_usize_dims()?)];
        MatMul.execute(&inputs[0..2], &mut mm_out, ctx)?;

        let bias = inputs[2].to_f32()?;
        let lhs = mm_out[0].to_f32()?;
        let bias_b = bias
            .broadcast(lhs.raw_dim())
            .ok_or_else(|| EngineError::invalid_argument("FusedMatMulAdd bias is not broadcastable onto the matmul result"))?;
        let out = &lhs + &bias_b;
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fused_matmul_add_matches_scenario_6() {
        let a = Tensor::from_f32_array(ndarray::arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]).into_dyn());
        let b = Tensor::from_f32_array(
            ndarray::arr2(&[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0, 10.0, 11.0, 12.0]]).into_dyn(),
        );
        let bias = Tensor::from_f32_array(ndarray::arr1(&[1.0, 1.0, 1.0, 1.0]).into_dyn());
        let op = FusedMatMulAdd;
        let mut out = vec![Tensor::zeros_f32(&[2, 4])];
        op.execute(&[&a, &b, &bias], &mut out, &OpContext { node_name: "fused" }).unwrap();
        let arr = out[0].to_f32().unwrap();
        assert_eq!(arr.into_raw_vec(), vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn fused_conv_relu_clamps_negative_output() {
        let input = Tensor::from_f32_array(ndarray::Array4::<f32>::ones((1, 1, 2, 2)).into_dyn());
        let weight = Tensor::from_f32_array(ndarray::Array4::from_elem((1, 1, 1, 1), -1.0).into_dyn());
        let op = FusedConvReLU::from_attrs(&AttributeBag::new());
        let mut out = vec![Tensor::zeros_f32(&[1, 1, 2, 2])];
        op.execute(&[&input, &weight], &mut out, &OpContext { node_name: "fused_conv_relu" }).unwrap();
        assert!(out[0].to_f32().unwrap().iter().all(|&v| v == 0.0));
    }
}
