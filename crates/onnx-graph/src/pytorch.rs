//! Graph fragments equivalent to common `torch.nn.functional` calls.

use std::sync::Arc;
use crate::Error;
use crate::operators::{Cast, Clip, Div, Gather, Reduce, ReduceOp};
use crate::tensor::{ConstantTensor, DType, Shape, Tensor, TensorData};

pub fn cast(input: Arc<dyn Tensor>, dtype: DType) -> Arc<dyn Tensor> {
    if input.dtype() != dtype {
        Cast::new(None, input, dtype)
    } else {
        input
    }
}

pub fn scalar(value: f32) -> Result<Arc<ConstantTensor>, Error> {
    Ok(ConstantTensor::new(None, TensorData::fill(Shape::scalar(), value)?))
}

/// `nn.EmbeddingBag(mode="mean")` over 2-D `input_ids`: one bag per row,
/// producing `[batch, embedding_dim]` in float32.
pub fn embedding_bag_mean(prefix: Option<&str>, weight: Arc<dyn Tensor>, input_ids: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    if weight.rank() != 2 {
        return Err(Error::InputShapeError(format!("embedding weight must be 2-D, got {}", weight.shape())));
    }
    if input_ids.rank() != 2 {
        return Err(Error::InputShapeError(format!("input_ids must be 2-D, got {}", input_ids.shape())));
    }
    let lookup = Gather::new(prefix.map(|x| format!("{x}.lookup")), weight, input_ids, 0)?;
    let lookup = cast(lookup, DType::F32);
    Ok(Reduce::new(prefix.map(|x| format!("{x}.mean")), ReduceOp::Mean, lookup, vec![1], false)?)
}

/// `F.normalize(x, p=2, dim=-1, eps)`: `x / max(||x||_2, eps)`.
pub fn normalize(input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<Div>, Error> {
    let norm = Reduce::new(None, ReduceOp::L2, input.clone(), vec![-1], true)?;
    let norm = Clip::new(None, norm, scalar(epsilon)?, None)?;
    Div::new(None, input, norm)
}
