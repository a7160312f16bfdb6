use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{int_attribute, ints_attribute, Node, SingleOutputNode};
use crate::tensor::{DType, Dimension, Shape, Tensor};

fn validate_index_dtype(dtype: DType) -> Result<(), Error> {
    if !matches!(dtype, DType::I32 | DType::I64) {
        Err(Error::InvalidDTypeError(dtype))?;
    }
    Ok(())
}

/// Output shape of a reduction over `axes`.
fn reduced_shape(input: &Shape, axes: &[usize], keepdims: bool) -> Shape {
    let mut dims = vec![];
    for (i, dim) in input.dims.iter().enumerate() {
        if axes.contains(&i) {
            if keepdims {
                dims.push(Dimension::new(Some(1), None, None));
            }
        }
        else {
            dims.push(dim.clone());
        }
    }
    Shape::new(dims)
}

/// Numpy-style broadcast of two shapes. Unknown dimensions only broadcast
/// against 1 or against a dimension carrying the same name.
fn broadcast_shape(a: &Shape, b: &Shape) -> Result<Shape, Error> {
    let rank = a.rank().max(b.rank());
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = (i + a.rank()).checked_sub(rank).map(|j| a.dims[j].clone());
        let db = (i + b.rank()).checked_sub(rank).map(|j| b.dims[j].clone());
        let dim = match (da, db) {
            (Some(da), None) => da,
            (None, Some(db)) => db,
            (Some(da), Some(db)) => {
                if da.value == Some(1) {
                    db
                }
                else if db.value == Some(1) || da.as_ref() == db.as_ref() {
                    da
                }
                else {
                    return Err(Error::InputShapeError(format!("cannot broadcast {a} with {b}")));
                }
            }
            (None, None) => unreachable!("index is below the larger rank"),
        };
        dims.push(dim);
    }
    Ok(Shape::new(dims))
}

pub struct Gather {
    name: Option<String>,
    data: Arc<dyn Tensor>,
    indices: Arc<dyn Tensor>,
    axis: i64,
    output_shape: Shape,
    dtype: DType
}

impl Gather {
    pub fn new(name: Option<String>, data: Arc<dyn Tensor>, indices: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        let data_shape = data.shape();
        validate_index_dtype(indices.dtype())?;
        let axis_index = data_shape.normalize_axis(axis)?;

        let mut output_shape = vec![];
        for (i, dim) in data_shape.dims.iter().enumerate() {
            if i == axis_index {
                output_shape.extend_from_slice(&indices.shape().dims);
            }
            else {
                output_shape.push(dim.clone());
            }
        }

        Ok(Arc::new(Self {
            name,
            dtype: data.dtype(),
            data,
            indices,
            axis,
            output_shape: Shape::new(output_shape),
        }))
    }
}

impl Node for Gather {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.data.as_ref(), self.indices.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Gather"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![int_attribute("axis", self.axis)]
    }
}

impl SingleOutputNode for Gather {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast {
            name,
            input,
            to
        })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Cast"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![int_attribute("to", onnx::tensor_proto::DataType::from(self.to) as i64)]
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

/// Which reduction a [`Reduce`] node performs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Mean,
    L2,
}

/// Opset-11 style reduction: `axes` is an attribute, not an input.
pub struct Reduce {
    name: Option<String>,
    op: ReduceOp,
    input: Arc<dyn Tensor>,
    axes: Vec<i64>,
    keepdims: bool,
    output_shape: Shape
}

impl Reduce {
    pub fn new(name: Option<String>, op: ReduceOp, input: Arc<dyn Tensor>, axes: Vec<i64>, keepdims: bool) -> Result<Arc<Self>, Error> {
        if !input.dtype().is_float() {
            return Err(Error::InvalidDTypeError(input.dtype()));
        }
        let resolved_axes = axes.iter()
            .map(|axis| input.shape().normalize_axis(*axis))
            .collect::<Result<Vec<_>, _>>()?;
        let output_shape = reduced_shape(input.shape(), &resolved_axes, keepdims);
        Ok(Arc::new(Self {
            name,
            op,
            input,
            axes,
            keepdims,
            output_shape
        }))
    }
}

impl Node for Reduce {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        match self.op {
            ReduceOp::Mean => "ReduceMean",
            ReduceOp::L2 => "ReduceL2",
        }
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            ints_attribute("axes", self.axes.clone()),
            int_attribute("keepdims", self.keepdims as i64),
        ]
    }
}

impl SingleOutputNode for Reduce {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Opset-11 `Clip`, with `min`/`max` passed as scalar inputs. `max` is
/// the trailing optional input, so it can be left out.
pub struct Clip {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    min: Arc<dyn Tensor>,
    max: Option<Arc<dyn Tensor>>,
}

impl Clip {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, min: Arc<dyn Tensor>, max: Option<Arc<dyn Tensor>>) -> Result<Arc<Self>, Error> {
        for bound in std::iter::once(&min).chain(max.iter()) {
            if bound.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError(input.dtype(), bound.dtype()));
            }
            if bound.rank() != 0 {
                return Err(Error::InputShapeError(format!("clip bound must be a scalar, got {}", bound.shape())));
            }
        }
        Ok(Arc::new(Self { name, input, min, max }))
    }
}

impl Node for Clip {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.min.as_ref()];
        if let Some(max) = &self.max {
            inputs.push(max.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Clip"
    }
}

impl SingleOutputNode for Clip {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Div {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Div {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()));
        }
        let output_shape = broadcast_shape(a.shape(), b.shape())?;
        Ok(Arc::new(Self { name, a, b, output_shape }))
    }
}

impl Node for Div {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Div"
    }
}

impl SingleOutputNode for Div {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::InputTensor;

    fn ids_input() -> Arc<InputTensor> {
        let shape = Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::symbolic("sequence")]);
        InputTensor::new("input_ids".to_string(), DType::I64, shape)
    }

    fn table(rows: usize, cols: usize) -> Arc<InputTensor> {
        InputTensor::new("table".to_string(), DType::F32, Shape::from(vec![rows, cols]))
    }

    #[test]
    fn gather_splices_index_shape() {
        let gather = Gather::new(None, table(10, 4), ids_input(), 0).unwrap();
        assert_eq!(gather.shape().to_string(), "batch_sizexsequencex4");
        assert_eq!(gather.dtype(), DType::F32);
    }

    #[test]
    fn gather_rejects_float_indices() {
        let indices = InputTensor::new("bad".to_string(), DType::F32, Shape::from(vec![3usize]));
        assert!(Gather::new(None, table(10, 4), indices, 0).is_err());
    }

    #[test]
    fn reduce_mean_drops_sequence_axis() {
        let gather = Gather::new(None, table(10, 4), ids_input(), 0).unwrap();
        let mean = Reduce::new(None, ReduceOp::Mean, gather, vec![1], false).unwrap();
        assert_eq!(mean.shape().to_string(), "batch_sizex4");
        let l2 = Reduce::new(None, ReduceOp::L2, mean, vec![-1], true).unwrap();
        assert_eq!(l2.shape().to_string(), "batch_sizex1");
    }

    #[test]
    fn div_broadcasts_keepdims_norm() {
        let gather = Gather::new(None, table(10, 4), ids_input(), 0).unwrap();
        let mean: Arc<dyn Tensor> = Reduce::new(None, ReduceOp::Mean, gather, vec![1], false).unwrap();
        let norm = Reduce::new(None, ReduceOp::L2, mean.clone(), vec![-1], true).unwrap();
        let div = Div::new(None, mean, norm).unwrap();
        assert_eq!(div.shape().to_string(), "batch_sizex4");
    }

    #[test]
    fn div_rejects_incompatible_shapes() {
        let a = InputTensor::new("a".to_string(), DType::F32, Shape::from(vec![2usize, 3]));
        let b = InputTensor::new("b".to_string(), DType::F32, Shape::from(vec![2usize, 4]));
        assert!(Div::new(None, a, b).is_err());
    }
}
