use ndarray::{Array, ArrayD, Axis, IxDyn};

use crate::attribute::AttributeBag;
use crate::error::{EngineError, EngineResult};
use crate::operators::{OpContext, Operator};
use crate::tensor::Tensor;
use crate::types::Shape;

/// Fills a single `-1` from the total element count; two `-1`s is
/// INVALID_ARGUMENT. The target shape is read from the second input
/// tensor, matching ONNX `Reshape`.
pub struct Reshape;

impl Reshape {
    fn resolve_target(requested: &[i64], numel: usize) -> EngineResult<Vec<i64>> {
        let neg_count = requested.iter().filter(|&&d| d == -1).count();
        if neg_count > 1 {
            return Err(EngineError::invalid_argument(
                "Reshape target shape may contain at most one -1",
            ));
        }
        if neg_count == 0 {
            return Ok(requested.to_vec());
        }
        let known: i64 = requested.iter().filter(|&&d| d != -1).product();
        if known == 0 || numel as i64 % known != 0 {
            return Err(EngineError::invalid_argument(format!(
                "cannot infer -1 dimension: {numel} elements does not divide evenly by {known}"
            )));
        }
        let inferred = numel as i64 / known;
        Ok(requested.iter().map(|&d| if d == -1 { inferred } else { d }).collect())
    }
}

impl Operator for Reshape {
    fn name(&self) -> &str {
        "Reshape"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 2 {
            return Err(EngineError::invalid_argument("Reshape requires [data, shape]"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let requested = inputs[1].to_i64()?;
        let resolved = Self::resolve_target(&requested, inputs[0].numel())?;
        Ok(vec![Shape::new(resolved)])
    }
    /// `resolve_target` infers `-1` from `inputs[0].numel()` — if the
    /// data input's own declared shape already carries a `-1`, that
    /// element count is itself unresolved and the inferred dimension
    /// would be derived from a placeholder number, not a real one.
    fn reject_unhandleable_dynamic_dim(&self, declared: &[Option<&Shape>]) -> EngineResult<()> {
        if declared.first().and_then(|s| *s).is_some_and(|s| s.dims().iter().any(|&d| d < 0)) {
            return Err(EngineError::invalid_argument(
                "Reshape cannot infer a -1 target dimension from a data input whose own declared shape has an unresolved dynamic dimension",
            ));
        }
        Ok(())
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let requested = inputs[1].to_i64()?;
        let resolved = Self::resolve_target(&requested, inputs[0].numel())?;
        outputs[0] = inputs[0].reshaped_view(Shape::new(resolved))?;
        Ok(())
    }
}

fn resolve_axis(axis: i64, rank: usize) -> usize {
    if axis < 0 {
        (rank as i64 + axis).max(0) as usize
    } else {
        axis as usize
    }
}

pub struct Concat {
    axis: i64,
}

impl Concat {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            axis: attrs.get_int("axis", 0),
        }
    }
}

impl Operator for Concat {
    fn name(&self) -> &str {
        "Concat"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.is_empty() {
            return Err(EngineError::invalid_argument("Concat requires at least 1 input"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let rank = inputs[0].shape().rank();
        let axis = resolve_axis(self.axis, rank);
        let mut dims = inputs[0].shape().dims().to_vec();
        dims[axis] = inputs.iter().map(|t| t.shape().dims()[axis]).sum();
        Ok(vec![Shape::new(dims)])
    }
    /// The concat axis's output size is a sum over every input's dim on
    /// that axis; a `-1` there would sum into a nonsensical total rather
    /// than a dimension that is merely unresolved.
    fn reject_unhandleable_dynamic_dim(&self, declared: &[Option<&Shape>]) -> EngineResult<()> {
        for shape in declared.iter().flatten() {
            let axis = resolve_axis(self.axis, shape.dims().len());
            if shape.dims().get(axis).is_some_and(|&d| d < 0) {
                return Err(EngineError::invalid_argument(format!(
                    "Concat cannot sum a declared dynamic (-1) dimension on axis {axis}"
                )));
            }
        }
        Ok(())
    }
    /// Every declared dtype casts through f32 for concatenation,
    /// including FLOAT16.
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let rank = inputs[0].shape().rank();
        let axis = resolve_axis(self.axis, rank);
        let arrays: Vec<ArrayD<f32>> = inputs.iter().map(|t| t.to_f32()).collect::<EngineResult<_>>()?;
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        let out = ndarray::concatenate(Axis(axis), &views)
            .map_err(|e| EngineError::invalid_argument(format!("Concat failed: {e}")))?;
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

pub struct Split {
    axis: i64,
    splits: Option<Vec<i64>>,
}

impl Split {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            axis: attrs.get_int("axis", 0),
            splits: attrs.get_ints("split").map(|s| s.to_vec()),
        }
    }

    fn resolved_splits(&self, total: i64, num_outputs: usize) -> Vec<i64> {
        self.splits.clone().unwrap_or_else(|| {
            let chunk = total / num_outputs as i64;
            vec![chunk; num_outputs]
        })
    }
}

impl Operator for Split {
    fn name(&self) -> &str {
        "Split"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 1 {
            return Err(EngineError::invalid_argument("Split expects exactly 1 input"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let rank = inputs[0].shape().rank();
        let axis = resolve_axis(self.axis, rank);
        let total = inputs[0].shape().dims()[axis];
        let num_outputs = self.splits.as_ref().map(|s| s.len()).unwrap_or(2);
        let splits = self.resolved_splits(total, num_outputs);
        Ok(splits
            .into_iter()
            .map(|sz| {
                let mut dims = inputs[0].shape().dims().to_vec();
                dims[axis] = sz;
                Shape::new(dims)
            })
            .collect())
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let axis = resolve_axis(self.axis, x.ndim());
        let total = x.shape()[axis] as i64;
        let splits = self.resolved_splits(total, outputs.len());

        let mut offset = 0usize;
        for (out, sz) in outputs.iter_mut().zip(splits.iter()) {
            let sz = *sz as usize;
            let slice = x.slice_axis(Axis(axis), ndarray::Slice::from(offset..offset + sz));
            *out = Tensor::from_f32_array(slice.to_owned());
            offset += sz;
        }
        Ok(())
    }
}

pub struct Transpose {
    perm: Option<Vec<i64>>,
}

impl Transpose {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            perm: attrs.get_ints("perm").map(|p| p.to_vec()),
        }
    }

    fn resolved_perm(&self, rank: usize) -> Vec<usize> {
        match &self.perm {
            Some(p) => p.iter().map(|&d| d as usize).collect(),
            None => (0..rank).rev().collect(),
        }
    }
}

impl Operator for Transpose {
    fn name(&self) -> &str {
        "Transpose"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 1 {
            return Err(EngineError::invalid_argument("Transpose expects exactly 1 input"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let perm = self.resolved_perm(inputs[0].shape().rank());
        let dims = inputs[0].shape().dims();
        Ok(vec![Shape::new(perm.iter().map(|&p| dims[p]).collect::<Vec<_>>())])
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let perm = self.resolved_perm(x.ndim());
        let out = x.permuted_axes(IxDyn(&perm)).as_standard_layout().to_owned();
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

/// Out-of-range index is INVALID_ARGUMENT.
pub struct Gather {
    axis: i64,
}

impl Gather {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            axis: attrs.get_int("axis", 0),
        }
    }
}

impl Operator for Gather {
    fn name(&self) -> &str {
        "Gather"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 2 {
            return Err(EngineError::invalid_argument("Gather requires [data, indices]"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let axis = resolve_axis(self.axis, inputs[0].shape().rank());
        let mut dims = inputs[0].shape().dims().to_vec();
        let index_dims = inputs[1].shape().dims();
        let mut out = dims[..axis].to_vec();
        out.extend_from_slice(index_dims);
        out.extend_from_slice(&dims.split_off(axis + 1));
        Ok(vec![Shape::new(out)])
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let axis = resolve_axis(self.axis, x.ndim());
        let indices = inputs[1].to_i64()?;
        let axis_len = x.shape()[axis] as i64;

        let mut rows = Vec::with_capacity(indices.len());
        for &raw_idx in &indices {
            let idx = if raw_idx < 0 { axis_len + raw_idx } else { raw_idx };
            if idx < 0 || idx >= axis_len {
                return Err(EngineError::invalid_argument(format!(
                    "Gather index {raw_idx} out of range for axis of size {axis_len}"
                )));
            }
            rows.push(x.index_axis(Axis(axis), idx as usize).to_owned());
        }
        let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
        let stacked = ndarray::stack(Axis(axis), &views)
            .map_err(|e| EngineError::invalid_argument(format!("Gather failed: {e}")))?;
        outputs[0] = Tensor::from_f32_array(stacked);
        Ok(())
    }
}

/// Negative indices treat `-k` as `dim_size - k`, clamped at boundaries.
/// Attribute-sourced `starts`/`ends`/`axes` take precedence over
/// input-tensor parameters when both are present.
pub struct Slice {
    starts: Option<Vec<i64>>,
    ends: Option<Vec<i64>>,
    axes: Option<Vec<i64>>,
}

impl Slice {
    pub fn from_attrs(attrs: &AttributeBag) -> Self {
        Self {
            starts: attrs.get_ints("starts").map(|v| v.to_vec()),
            ends: attrs.get_ints("ends").map(|v| v.to_vec()),
            axes: attrs.get_ints("axes").map(|v| v.to_vec()),
        }
    }

    fn params(&self, inputs: &[&Tensor]) -> EngineResult<(Vec<i64>, Vec<i64>, Vec<i64>)> {
        if let (Some(starts), Some(ends)) = (&self.starts, &self.ends) {
            let rank = starts.len();
            let axes = self.axes.clone().unwrap_or_else(|| (0..rank as i64).collect());
            return Ok((starts.clone(), ends.clone(), axes));
        }
        if inputs.len() >= 3 {
            let starts = inputs[1].to_i64()?;
            let ends = inputs[2].to_i64()?;
            let axes = if inputs.len() >= 4 {
                inputs[3].to_i64()?
            } else {
                (0..starts.len() as i64).collect()
            };
            return Ok((starts, ends, axes));
        }
        Err(EngineError::invalid_argument(
            "Slice requires starts/ends from attributes or input tensors",
        ))
    }

    fn clamp(idx: i64, dim: i64) -> i64 {
        let resolved = if idx < 0 { dim + idx } else { idx };
        resolved.clamp(0, dim)
    }
}

impl Operator for Slice {
    fn name(&self) -> &str {
        "Slice"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.is_empty() {
            return Err(EngineError::invalid_argument("Slice requires at least 1 input"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let (starts, ends, axes) = self.params(inputs)?;
        let mut dims = inputs[0].shape().dims().to_vec();
        for (i, &axis) in axes.iter().enumerate() {
            let axis = axis as usize;
            let dim = dims[axis];
            let s = Self::clamp(starts[i], dim);
            let e = Self::clamp(ends[i], dim);
            dims[axis] = (e - s).max(0);
        }
        Ok(vec![Shape::new(dims)])
    }
    /// `clamp` calls `i64::clamp(resolved, 0, dim)`, which panics
    /// outright when `dim < 0` (min bound greater than max bound), so a
    /// `-1` on an axis this op actually slices is not a soft "treat as
    /// 1" case like elsewhere — it is a hard crash risk. When
    /// `starts`/`ends` come from attributes the sliced axes are known
    /// ahead of time (`self.axes`, defaulting to every axis); when they
    /// come from input tensors instead, any axis could be picked at
    /// runtime, so every declared dimension on the data input is
    /// checked.
    fn reject_unhandleable_dynamic_dim(&self, declared: &[Option<&Shape>]) -> EngineResult<()> {
        let Some(Some(shape)) = declared.first() else { return Ok(()) };
        let dims = shape.dims();
        let suspect_axes: Vec<usize> = match &self.axes {
            Some(axes) => axes.iter().map(|&a| resolve_axis(a, dims.len())).collect(),
            None => (0..dims.len()).collect(),
        };
        if suspect_axes.iter().any(|&a| dims.get(a).is_some_and(|&d| d < 0)) {
            return Err(EngineError::invalid_argument(
                "Slice cannot clamp starts/ends against a declared dynamic (-1) dimension on an axis it slices",
            ));
        }
        Ok(())
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let x = inputs[0].to_f32()?;
        let (starts, ends, axes) = self.params(inputs)?;
        let mut view = x.view();
        for (i, &axis) in axes.iter().enumerate() {
            let dim = view.shape()[axis as usize] as i64;
            let s = Self::clamp(starts[i], dim);
            let e = Self::clamp(ends[i], dim);
            view = view.slice_axis_move(Axis(axis as usize), ndarray::Slice::from(s as isize..e as isize));
        }
        outputs[0] = Tensor::from_f32_array(view.to_owned());
        Ok(())
    }
}

/// Row-gather over an embedding-table initializer.
pub struct Embedding;

impl Operator for Embedding {
    fn name(&self) -> &str {
        "Embedding"
    }
    fn validate_inputs(&self, inputs: &[&Tensor]) -> EngineResult<()> {
        if inputs.len() != 2 {
            return Err(EngineError::invalid_argument("Embedding requires [table, indices]"));
        }
        if inputs[0].shape().rank() != 2 {
            return Err(EngineError::invalid_argument("Embedding table must be rank 2 [vocab, dim]"));
        }
        Ok(())
    }
    fn infer_output_shape(&self, inputs: &[&Tensor]) -> EngineResult<Vec<Shape>> {
        self.validate_inputs(inputs)?;
        let dim = inputs[0].shape().dims()[1];
        let mut out = inputs[1].shape().dims().to_vec();
        out.push(dim);
        Ok(vec![Shape::new(out)])
    }
    fn execute(&self, inputs: &[&Tensor], outputs: &mut [Tensor], _ctx: &OpContext) -> EngineResult<()> {
        let table = inputs[0].to_f32()?;
        let indices = inputs[1].to_i64()?;
        let vocab = table.shape()[0] as i64;
        let dim = table.shape()[1];

        let mut flat = Vec::with_capacity(indices.len() * dim);
        for &idx in &indices {
            let resolved = if idx < 0 { vocab + idx } else { idx };
            if resolved < 0 || resolved >= vocab {
                return Err(EngineError::invalid_argument(format!(
                    "Embedding index {idx} out of range for vocab size {vocab}"
                )));
            }
            flat.extend(table.index_axis(Axis(0), resolved as usize).iter());
        }
        let mut out_dims = inputs[1].shape().dims().to_vec();
        out_dims.push(dim as i64);
        let out = Array::from_shape_vec(IxDyn(&out_dims.iter().map(|&d| d as usize).collect::<Vec<_>>()), flat)
            .map_err(|e| EngineError::invalid_argument(format!("Embedding reshape failed: {e}")))?;
        outputs[0] = Tensor::from_f32_array(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_infers_single_negative_one() {
        let data = Tensor::zeros_f32(&[2, 3]);
        let bytes: Vec<u8> = [-1i64, 2].iter().flat_map(|v| v.to_le_bytes()).collect();
        let shape_tensor =
            Tensor::from_raw_bytes(crate::types::DType::Int64, Shape::new(vec![2]), &bytes).unwrap();
        let resolved = Reshape::resolve_target(&shape_tensor.to_i64().unwrap(), data.numel()).unwrap();
        assert_eq!(resolved, vec![3, 2]);
    }

    #[test]
    fn reshape_rejects_two_negative_ones() {
        assert!(Reshape::resolve_target(&[-1, -1], 6).is_err());
    }

    #[test]
    fn gather_rejects_out_of_range_index() {
        let data = Tensor::from_f32_array(ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let bytes: Vec<u8> = [5i64].iter().flat_map(|v| v.to_le_bytes()).collect();
        let indices = Tensor::from_raw_bytes(crate::types::DType::Int64, Shape::new(vec![1]), &bytes).unwrap();
        let op = Gather::from_attrs(&AttributeBag::new());
        let mut out = vec![Tensor::zeros_f32(&[1, 2])];
        assert!(op.execute(&[&data, &indices], &mut out, &OpContext { node_name: "gather" }).is_err());
    }

    #[test]
    fn reshape_rejects_a_declared_dynamic_data_shape() {
        let data_shape = Shape::new(vec![-1, 3]);
        assert!(Reshape.reject_unhandleable_dynamic_dim(&[Some(&data_shape), None]).is_err());
    }

    #[test]
    fn concat_rejects_a_dynamic_dimension_on_its_own_axis() {
        let op = Concat { axis: 1 };
        let a = Shape::new(vec![2, -1]);
        let b = Shape::new(vec![2, 3]);
        assert!(op.reject_unhandleable_dynamic_dim(&[Some(&a), Some(&b)]).is_err());
    }

    #[test]
    fn concat_accepts_a_dynamic_dimension_off_its_axis() {
        let op = Concat { axis: 1 };
        let a = Shape::new(vec![-1, 2]);
        let b = Shape::new(vec![-1, 3]);
        assert!(op.reject_unhandleable_dynamic_dim(&[Some(&a), Some(&b)]).is_ok());
    }

    #[test]
    fn slice_rejects_a_dynamic_dimension_on_an_attribute_declared_axis() {
        let mut attrs = AttributeBag::new();
        attrs.insert("starts", crate::attribute::AttributeValue::Ints(vec![0]));
        attrs.insert("ends", crate::attribute::AttributeValue::Ints(vec![2]));
        attrs.insert("axes", crate::attribute::AttributeValue::Ints(vec![0]));
        let op = Slice::from_attrs(&attrs);
        let data_shape = Shape::new(vec![-1, 4]);
        assert!(op.reject_unhandleable_dynamic_dim(&[Some(&data_shape)]).is_err());
    }

    #[test]
    fn slice_accepts_a_dynamic_dimension_on_an_axis_it_does_not_touch() {
        let mut attrs = AttributeBag::new();
        attrs.insert("starts", crate::attribute::AttributeValue::Ints(vec![0]));
        attrs.insert("ends", crate::attribute::AttributeValue::Ints(vec![2]));
        attrs.insert("axes", crate::attribute::AttributeValue::Ints(vec![1]));
        let op = Slice::from_attrs(&attrs);
        let data_shape = Shape::new(vec![-1, 4]);
        assert!(op.reject_unhandleable_dynamic_dim(&[Some(&data_shape)]).is_ok());
    }

    #[test]
    fn slice_clamps_negative_indices() {
        let data = Tensor::from_f32_array(ndarray::arr1(&[1.0, 2.0, 3.0, 4.0, 5.0]).into_dyn());
        let mut attrs = AttributeBag::new();
        attrs.insert("starts", crate::attribute::AttributeValue::Ints(vec![-3]));
        attrs.insert("ends", crate::attribute::AttributeValue::Ints(vec![100]));
        let op = Slice::from_attrs(&attrs);
        let mut out = vec![Tensor::zeros_f32(&[3])];
        op.execute(&[&data], &mut out, &OpContext { node_name: "slice" }).unwrap();
        assert_eq!(out[0].to_f32().unwrap().into_raw_vec(), vec![3.0, 4.0, 5.0]);
    }
}
