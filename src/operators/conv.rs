use ndarray::Array4;

use crate::attribute::AttributeBag;
use crate::error::{EngineError, EngineResult};
use crate::operators::{OpContext, Operator};
use crate::tensor::Tensor;
use crate::types::Shape;

fn as_pair(attrs: &AttributeBag, name: &str, default: i64) -> (usize, usize) {
    match attrs.get_ints(name) {
        Some([h, w]) => (*h as usize, *w as usize),
        Some([v]) => (*v as usize, *v as usize),
        _ => (default as usize, default as usize),
    }
}

/// Naive direct NCHW convolution, groups=1. Rank < 4 on the input is
/// INVALID_ARGUMENT.
pub struct Conv {
    stride: (usize, usize),
    padding: (usize, usize),
}

impl Conv {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            stride: as_pair(attrs, "strides", 1),
            padding: as_pair(attrs, "pads", 0),
        }
    }
}

impl Operator for Conv {
    fn name(&self) -> &str {
        "Conv"
    }

    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() < 2 {
            return Err(EngineError::invalid_argument("Conv requires input and weight tensors"));
        }
        if inputs[0].shape().rank() < 4 || inputs[1].shape().rank() < 4 {
            return Err(EngineError::invalid_argument("Conv requires rank >= 4 input/weight"));
        }
        Ok(())
    }

    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let x = inputs[0].shape().dims();
        let w = inputs[1].shape().dims();
        let (n, _ci, h, wi) = (x[0], x[1], x[2], x[3]);
        let (co, _ci_w, kh, kw) = (w[0], w[1], w[2], w[3]);
        let oh = (h + 2 * self.padding.0 as i64 - kh) / self.stride.0 as i64 + 1;
        let ow = (wi + 2 * self.padding.1 as i64 - kw) / self.stride.1 as i64 + 1;
        Ok(vec![Shape::new(vec![n, co, oh, ow])])
    }

    #[tracing::instrument(skip_all, name = "kernel_conv")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let input = inputs[0].to_f32()?;
        let weight = inputs[1].to_f32()?;
        let bias = inputs.get(2).map(|t| t.to_f32()).transpose()?;

        let input4 = input
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| EngineError::invalid_argument(format!("Conv input not 4-D: {e}")))?;
        let weight4 = weight
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| EngineError::invalid_argument(format!("Conv weight not 4-D: {e}")))?;

        let (n, ci, h, w) = input4.dim();
        let (co, _ci_w, kh, kw) = weight4.dim();
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;
        let oh = (h + 2 * ph - kh) / sh + 1;
        let ow = (w + 2 * pw - kw) / sw + 1;

        let mut out = Array4::<f32>::zeros((n, co, oh, ow));
        for ni in 0..n {
            for coi in 0..co {
                let b = bias.as_ref().map(|b| b[[coi]]).unwrap_or(0.0);
                for hi in 0..oh {
                    for wi in 0..ow {
                        let mut sum = b;
                        for cii in 0..ci {
                            for khi in 0..kh {
                                for kwi in 0..kw {
                                    let in_h = (hi * sh) as i64 + khi as i64 - ph as i64;
                                    let in_w = (wi * sw) as i64 + kwi as i64 - pw as i64;
                                    if in_h >= 0 && (in_h as usize) < h && in_w >= 0 && (in_w as usize) < w {
                                        sum += input4[[ni, cii, in_h as usize, in_w as usize]]
                                            * weight4[[coi, cii, khi, kwi]];
                                    }
                                }
                            }
                        }
                        out[[ni, coi, hi, wi]] = sum;
                    }
                }
            }
        }
        outputs[0] = Tensor::from_f32_array(out.into_dyn());
        Ok(())
    }
}

fn pool_output_shape(input: &[i64], kernel: (usize, usize), stride: (usize, usize)) -> Vec<i64> {
    let (n, c, h, w) = (input[0], input[1], input[2], input[3]);
    let oh = (h - kernel.0 as i64) / stride.0 as i64 + 1;
    let ow = (w - kernel.1 as i64) / stride.1 as i64 + 1;
    vec![n, c, oh, ow]
}

fn pool_validate(inputs: &[&Tensor]) -> EngineResult<()> {
    if inputs.len() != 1 {
        return Err(EngineError::invalid_argument("pooling expects exactly 1 input"));
    }
    if inputs[0].shape().rank() != 4 {
        return Err(EngineError::invalid_argument("pooling requires a rank-4 NCHW input"));
    }
    Ok(())
}

pub struct MaxPool {
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl MaxPool {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            kernel: as_pair(attrs, "kernel_shape", 1),
            stride: as_pair(attrs, "strides", 1),
        }
    }
}

impl Operator for MaxPool {
    fn name(&self) -> &str {
        "MaxPool"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        pool_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        pool_validate(inputs)?;
        Ok(vec![Shape::new(pool_output_shape(
            inputs[0].shape().dims(),
            self.kernel,
            self.stride,
        ))])
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let input4 = inputs[0]
            .to_f32()?
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| EngineError::invalid_argument(format!("MaxPool input not 4-D: {e}")))?;
        let (n, c, h, w) = input4.dim();
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let oh = (h - kh) / sh + 1;
        let ow = (w - kw) / sw + 1;
        let mut out = Array4::<f32>::zeros((n, c, oh, ow));
        for ni in 0..n {
            for ci in 0..c {
                for hi in 0..oh {
                    for wi in 0..ow {
                        let mut max_val = f32::NEG_INFINITY;
                        for khi in 0..kh {
                            for kwi in 0..kw {
                                let v = input4[[ni, ci, hi * sh + khi, wi * sw + kwi]];
                                if v > max_val {
                                    max_val = v;
                                }
                            }
                        }
                        out[[ni, ci, hi, wi]] = max_val;
                    }
                }
            }
        }
        outputs[0] = Tensor::from_f32_array(out.into_dyn());
        Ok(())
    }
}

/// Uniform-averaging pool.
pub struct AveragePool {
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl AveragePool {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            kernel: as_pair(attrs, "kernel_shape", 1),
            stride: as_pair(attrs, "strides", 1),
        }
    }
}

impl Operator for AveragePool {
    fn name(&self) -> &str {
        "AveragePool"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        pool_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        pool_validate(inputs)?;
        Ok(vec![Shape::new(pool_output_shape(
            inputs[0].shape().dims(),
            self.kernel,
            self.stride,
        ))])
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let input4 = inputs[0]
            .to_f32()?
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| EngineError::invalid_argument(format!("AveragePool input not 4-D: {e}")))?;
        let (n, c, h, w) = input4.dim();
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let oh = (h - kh) / sh + 1;
        let ow = (w - kw) / sw + 1;
        let count = (kh * kw) as f32;
        let mut out = Array4::<f32>::zeros((n, c, oh, ow));
        for ni in 0..n {
            for ci in 0..c {
                for hi in 0..oh {
                    for wi in 0..ow {
                        let mut sum = 0.0;
                        for khi in 0..kh {
                            for kwi in 0..kw {
                                sum += input4[[ni, ci, hi * sh + khi, wi * sw + kwi]];
                            }
                        }
                        out[[ni, ci, hi, wi]] = sum / count;
                    }
                }
            }
        }
        outputs[0] = Tensor::from_f32_array(out.into_dyn());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn conv_1x1_doubles_input_matches_scenario_4() {
        let input = Tensor::from_f32_array(Array4::<f32>::ones((1, 1, 3, 3)).into_dyn());
        let weight = Tensor::from_f32_array(Array4::from_elem((1, 1, 1, 1), 2.0).into_dyn());
        let op = Conv {
            stride: (1, 1),
            padding: (0, 0),
        };
        let mut out = vec![Tensor::zeros_f32(&[1, 1, 3, 3])];
        op.execute(&[&input, &weight], &mut out, &OpContext { node_name: "conv" }).unwrap();
        assert!(out[0].to_f32().unwrap().iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn conv_3x3_uniform_average_matches_scenario_5() {
        let input = Tensor::from_f32_array(Array4::<f32>::ones((1, 1, 5, 5)).into_dyn());
        let weight = Tensor::from_f32_array(Array4::from_elem((1, 1, 3, 3), 1.0 / 9.0).into_dyn());
        let op = Conv {
            stride: (1, 1),
            padding: (0, 0),
        };
        let mut out = vec![Tensor::zeros_f32(&[1, 1, 3, 3])];
        op.execute(&[&input, &weight], &mut out, &OpContext { node_name: "conv" }).unwrap();
        assert!(out[0].to_f32().unwrap().iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn conv_rejects_rank_below_4() {
        let input = Tensor::zeros_f32(&[1, 1, 3]);
        let weight = Tensor::zeros_f32(&[1, 1, 1, 1]);
        let op = Conv {
            stride: (1, 1),
            padding: (0, 0),
        };
        assert!(op.validate_inputs(&[&input, &weight]).is_err());
    }
}
