use ndarray::{ArrayD, IxDyn};

use crate::error::{EngineError, EngineResult};
use crate::operators::{OpContext, Operator};
use crate::tensor::Tensor;
use crate::types::Shape;

fn binary_validate(inputs: &[&Tensor]) -> EngineResult<()> {
    if inputs.len() != 2 {
        return Err(EngineError::invalid_argument(format!(
            "expected 2 inputs, got {}",
            inputs.len()
        )));
    }
    Ok(())
}

/// Numpy-style broadcast of two shapes, right-aligned — these ops are
/// elementwise-with-broadcast by convention of the ONNX ops they
/// implement.
fn broadcast_shape(a: &[i64], b: &[i64]) -> EngineResult<Vec<i64>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0i64; rank];
    for i in 0..rank {
        let ad = *a.iter().rev().nth(i).unwrap_or(&1);
        let bd = *b.iter().rev().nth(i).unwrap_or(&1);
        out[rank - 1 - i] = if ad == bd {
            ad
        } else if ad == 1 {
            bd
        } else if bd == 1 {
            ad
        } else {
            return Err(EngineError::invalid_argument(format!(
                "cannot broadcast shapes {:?} and {:?}",
                a, b
            )));
        };
    }
    Ok(out)
}

fn binary_shape(inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
    binary_validate(inputs)?;
    let shape = broadcast_shape(inputs[0].shape().dims(), inputs[1].shape().dims())?;
    Ok(vec![Shape::new(shape)])
}

fn elementwise<F: Fn(f32, f32) -> f32>(a: &Tensor, b: &Tensor, f: F) -> EngineResult<Tensor> {
    let a = a.to_f32()?;
    let b = b.to_f32()?;
    let out = if a.shape() == b.shape() {
        ndarray::Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y))
    } else {
        broadcast_apply(&a, &b, f)?
    };
    Ok(Tensor::from_f32_array(out))
}

fn broadcast_apply<F: Fn(f32, f32) -> f32>(a: &ArrayD<f32>, b: &ArrayD<f32>, f: F) -> EngineResult<ArrayD<f32>> {
    let out_shape = broadcast_shape(
        &a.shape().iter().map(|&d| d as i64).collect::<Vec<_>>(),
        &b.shape().iter().map(|&d| d as i64).collect::<Vec<_>>(),
    )?;
    let dims: Vec<usize> = out_shape.iter().map(|&d| d as usize).collect();
    let a_b = a
        .broadcast(IxDyn(&dims))
        .ok_or_else(|| EngineError::invalid_argument("broadcast failed for lhs"))?;
    let b_b = b
        .broadcast(IxDyn(&dims))
        .ok_or_else(|| EngineError::invalid_argument("broadcast failed for rhs"))?;
    Ok(ndarray::Zip::from(&a_b).and(&b_b).map_collect(|&x, &y| f(x, y)))
}

macro_rules! binary_op {
    ($name:ident, $onnx_name:expr, $f:expr) => {
        pub struct $name;
        impl Operator for $name {
            fn name(&self) -> &str {
                $onnx_name
            }
            fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
                binary_validate(inputs)
            }
            fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
                binary_shape(inputs)
            }
            fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
                outputs[0] = elementwise(inputs[0], inputs[1], $f)?;
                Ok(())
            }
        }
    };
}

binary_op!(Add, "Add", |x: f32, y: f32| x + y);
binary_op!(Sub, "Sub", |x: f32, y: f32| x - y);
binary_op!(Mul, "Mul", |x: f32, y: f32| x * y);

/// Integer division by zero writes 0 for that element. Since compute
/// happens in f32, "integer" division by zero is detected by the
/// divisor being exactly zero regardless of declared dtype.
pub struct Div;
impl Operator for Div {
    fn name(&self) -> &str {
        "Div"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        binary_validate(inputs)
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        binary_shape(inputs)
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        outputs[0] = elementwise(inputs[0], inputs[1], |x, y| if y == 0.0 { 0.0 } else { x / y })?;
        Ok(())
    }
}

/// 2-D matrix multiplication; rank < 2 on either input is
/// INVALID_ARGUMENT.
pub struct MatMul;
impl Operator for MatMul {
    fn name(&self) -> &str {
        "MatMul"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        binary_validate(inputs)?;
        if inputs[0].shape().rank() < 2 || inputs[1].shape().rank() < 2 {
            return Err(EngineError::invalid_argument(
                "MatMul requires rank >= 2 on both inputs",
            ));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let a = inputs[0].shape().dims();
        let b = inputs[1].shape().dims();
        let (m, k_a) = (a[a.len() - 2], a[a.len() - 1]);
        let (k_b, n) = (b[b.len() - 2], b[b.len() - 1]);
        if k_a != k_b {
            return Err(EngineError::invalid_argument(format!(
                "MatMul inner dimensions mismatch: {k_a} vs {k_b}"
            )));
        }
        Ok(vec![Shape::new(vec![m, n])])
    }
    /// The contracted dimension is compared for equality, not summed or
    /// otherwise derived, so `-1` on either side would compare equal to
    /// any other `-1` and silently pass a mismatched contraction.
    fn reject_unhandleable_dynamic_dim(&self, declared: &[Option<&Shape>]) -> EngineResult<()> {
        let contracted = |shape: &Shape, from_end: usize| shape.dims().len() >= 2 && shape.dims()[shape.dims().len() - from_end] < 0;
        if declared.first().and_then(|s| *s).is_some_and(|s| contracted(s, 1))
            || declared.get(1).and_then(|s| *s).is_some_and(|s| contracted(s, 2))
        {
            return Err(EngineError::invalid_argument(
                "MatMul cannot compare a declared dynamic (-1) contraction dimension for equality",
            ));
        }
        Ok(())
    }
    #[tracing::instrument(skip_all, name = "kernel_matmul")]
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let a = inputs[0].to_f32()?;
        let b = inputs[1].to_f32()?;
        let a2 = a
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| EngineError::invalid_argument(format!("MatMul lhs not 2-D: {e}")))?;
        let b2 = b
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| EngineError::invalid_argument(format!("MatMul rhs not 2-D: {e}")))?;
        let result = a2.dot(&b2);
        outputs[0] = Tensor::from_f32_array(result.into_dyn());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_matches_scenario_1() {
        let a = Tensor::from_f32_array(ndarray::arr2(&[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]).into_dyn());
        let b = Tensor::from_f32_array(ndarray::arr2(&[[2.0, 2.0, 2.0], [2.0, 2.0, 2.0]]).into_dyn());
        let mut out = vec![Tensor::zeros_f32(&[2, 3])];
        Add.execute(&[&a, &b], &mut out, &OpContext { node_name: "add" }).unwrap();
        assert_eq!(
            out[0].to_f32().unwrap().into_raw_vec(),
            vec![3.0, 3.0, 3.0, 3.0, 3.0, 3.0]
        );
    }

    #[test]
    fn div_by_zero_writes_zero() {
        let a = Tensor::from_f32_array(ndarray::arr1(&[4.0]).into_dyn());
        let b = Tensor::from_f32_array(ndarray::arr1(&[0.0]).into_dyn());
        let mut out = vec![Tensor::zeros_f32(&[1])];
        Div.execute(&[&a, &b], &mut out, &OpContext { node_name: "div" }).unwrap();
        assert_eq!(out[0].to_f32().unwrap().into_raw_vec(), vec![0.0]);
    }

    #[test]
    fn matmul_rejects_rank_below_2() {
        let a = Tensor::from_f32_array(ndarray::arr1(&[1.0, 2.0]).into_dyn());
        let b = Tensor::from_f32_array(ndarray::arr2(&[[1.0], [2.0]]).into_dyn());
        assert!(MatMul.validate_inputs(&[&a, &b]).is_err());
    }

    #[test]
    fn matmul_rejects_a_declared_dynamic_contraction_dimension() {
        let a = Shape::new(vec![2, -1]);
        let b = Shape::new(vec![3, 4]);
        assert!(MatMul.reject_unhandleable_dynamic_dim(&[Some(&a), Some(&b)]).is_err());
    }

    #[test]
    fn matmul_accepts_a_dynamic_dim_outside_the_contraction_axis() {
        let a = Shape::new(vec![-1, 3]);
        let b = Shape::new(vec![3, 4]);
        assert!(MatMul.reject_unhandleable_dynamic_dim(&[Some(&a), Some(&b)]).is_ok());
    }

    #[test]
    fn matmul_identity_matches_scenario_3() {
        let a = Tensor::from_f32_array(ndarray::arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn());
        let ident = Tensor::from_f32_array(
            ndarray::arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).into_dyn(),
        );
        let mut out = vec![Tensor::zeros_f32(&[2, 3])];
        MatMul.execute(&[&a, &ident], &mut out, &OpContext { node_name: "mm" }).unwrap();
        assert_eq!(
            out[0].to_f32().unwrap().into_raw_vec(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }
}
