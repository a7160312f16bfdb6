//! A small CPU evaluator for the graphs this crate exports. It runs the
//! handful of ONNX operators the converter emits, which is enough to check an
//! exported file against the model it came from without an ONNX runtime.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::trace;
use ndarray::{ArrayD, Axis, IxDyn};
use onnx_graph::onnx::{self, tensor_proto::DataLocation, tensor_proto::DataType};
use onnx_graph::tensor::{DType, TensorDataValue};
use prost::Message;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Failed to read {0}: {1}")]
    IoError(PathBuf, std::io::Error),
    #[error("Failed to decode ONNX model: {0}")]
    DecodeError(#[from] prost::DecodeError),
    #[error("Model has no graph")]
    NoGraph,
    #[error("Unsupported operator: {0}")]
    UnsupportedOp(String),
    #[error("Unsupported data type {0}")]
    UnsupportedDType(i32),
    #[error("Value {0} is not available")]
    MissingValue(String),
    #[error("Node {0} is missing attribute {1}")]
    MissingAttribute(String, String),
    #[error("Index {0} is out of range for a dimension of {1}")]
    IndexOutOfRange(i64, usize),
    #[error("Axis {0} is out of range for rank {1}")]
    InvalidAxis(i64, usize),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("External data for {0} is incomplete")]
    ExternalDataError(String),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(transparent)]
    OnnxGraphError(#[from] onnx_graph::Error),
}

/// A runtime tensor value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    F32(ArrayD<f32>),
    F16(ArrayD<half::f16>),
    BF16(ArrayD<half::bf16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
}

impl Value {
    pub fn shape(&self) -> &[usize] {
        match self {
            Value::F32(a) => a.shape(),
            Value::F16(a) => a.shape(),
            Value::BF16(a) => a.shape(),
            Value::I32(a) => a.shape(),
            Value::I64(a) => a.shape(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::F32(_) => DType::F32,
            Value::F16(_) => DType::F16,
            Value::BF16(_) => DType::BF16,
            Value::I32(_) => DType::I32,
            Value::I64(_) => DType::I64,
        }
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>, EvalError> {
        match self {
            Value::F32(a) => Ok(a),
            other => Err(EvalError::TypeMismatch(format!("expected F32, got {}", other.dtype()))),
        }
    }

    pub fn into_f32(self) -> Result<ArrayD<f32>, EvalError> {
        match self {
            Value::F32(a) => Ok(a),
            other => Err(EvalError::TypeMismatch(format!("expected F32, got {}", other.dtype()))),
        }
    }

    fn indices(&self) -> Result<ArrayD<i64>, EvalError> {
        match self {
            Value::I64(a) => Ok(a.clone()),
            Value::I32(a) => Ok(a.mapv(i64::from)),
            other => Err(EvalError::TypeMismatch(format!("indices must be integers, got {}", other.dtype()))),
        }
    }

    fn from_tensor_data(value: TensorDataValue, shape: &[usize]) -> Result<Self, EvalError> {
        let shape = IxDyn(shape);
        Ok(match value {
            TensorDataValue::F32(v) => Value::F32(ArrayD::from_shape_vec(shape, v)?),
            TensorDataValue::F16(v) => Value::F16(ArrayD::from_shape_vec(shape, v)?),
            TensorDataValue::BF16(v) => Value::BF16(ArrayD::from_shape_vec(shape, v)?),
            TensorDataValue::I32(v) => Value::I32(ArrayD::from_shape_vec(shape, v)?),
            TensorDataValue::I64(v) => Value::I64(ArrayD::from_shape_vec(shape, v)?),
        })
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(value: ArrayD<f32>) -> Self {
        Value::F32(value)
    }
}

impl From<ArrayD<i64>> for Value {
    fn from(value: ArrayD<i64>) -> Self {
        Value::I64(value)
    }
}

pub fn load_model(path: &Path) -> Result<onnx::ModelProto, EvalError> {
    let bytes = std::fs::read(path).map_err(|e| EvalError::IoError(path.to_path_buf(), e))?;
    Ok(onnx::ModelProto::decode(bytes.as_slice())?)
}

fn proto_dtype(data_type: i32) -> Result<DType, EvalError> {
    let data_type = DataType::try_from(data_type).map_err(|_| EvalError::UnsupportedDType(data_type))?;
    DType::try_from(data_type).map_err(|_| EvalError::UnsupportedDType(data_type as i32))
}

fn external_field<'a>(tensor: &'a onnx::TensorProto, key: &str) -> Option<&'a str> {
    tensor.external_data.iter().find(|e| e.key == key).map(|e| e.value.as_str())
}

fn read_external(tensor: &onnx::TensorProto, base_dir: &Path) -> Result<Vec<u8>, EvalError> {
    let field = |key| external_field(tensor, key);
    let location = field("location").ok_or_else(|| EvalError::ExternalDataError(tensor.name.clone()))?;
    let offset: u64 = field("offset").unwrap_or("0").parse()
        .map_err(|_| EvalError::ExternalDataError(tensor.name.clone()))?;
    let path = base_dir.join(location);
    let io_error = |e| EvalError::IoError(path.clone(), e);

    let mut file = File::open(&path).map_err(io_error)?;
    file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
    let mut bytes = vec![];
    match field("length") {
        Some(length) => {
            let length: usize = length.parse().map_err(|_| EvalError::ExternalDataError(tensor.name.clone()))?;
            bytes.resize(length, 0);
            file.read_exact(&mut bytes).map_err(io_error)?;
        }
        None => {
            file.read_to_end(&mut bytes).map_err(io_error)?;
        }
    }
    Ok(bytes)
}

fn load_initializer(tensor: &onnx::TensorProto, base_dir: &Path) -> Result<Value, EvalError> {
    let dtype = proto_dtype(tensor.data_type)?;
    let shape: Vec<usize> = tensor.dims.iter().map(|d| *d as usize).collect();
    let value = if tensor.data_location == DataLocation::External as i32 {
        TensorDataValue::from_raw_encoding(dtype, &read_external(tensor, base_dir)?)?
    } else if !tensor.raw_data.is_empty() {
        TensorDataValue::from_raw_encoding(dtype, &tensor.raw_data)?
    } else {
        match dtype {
            DType::F32 => TensorDataValue::F32(tensor.float_data.clone()),
            DType::I32 => TensorDataValue::I32(tensor.int32_data.clone()),
            DType::I64 => TensorDataValue::I64(tensor.int64_data.clone()),
            _ => return Err(EvalError::UnsupportedDType(tensor.data_type)),
        }
    };
    Value::from_tensor_data(value, &shape)
}

fn attribute<'a>(node: &'a onnx::NodeProto, name: &str) -> Option<&'a onnx::AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, EvalError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(EvalError::InvalidAxis(axis, rank));
    }
    Ok(resolved as usize)
}

fn gather<T: Clone>(data: &ArrayD<T>, indices: &ArrayD<i64>, axis: usize) -> Result<ArrayD<T>, EvalError> {
    let dim = data.shape()[axis];
    let flat = indices.iter().map(|&i| {
        let resolved = if i < 0 { i + dim as i64 } else { i };
        if resolved < 0 || resolved >= dim as i64 {
            Err(EvalError::IndexOutOfRange(i, dim))
        } else {
            Ok(resolved as usize)
        }
    }).collect::<Result<Vec<_>, _>>()?;

    let selected = data.select(Axis(axis), &flat);
    let mut shape = data.shape()[..axis].to_vec();
    shape.extend_from_slice(indices.shape());
    shape.extend_from_slice(&data.shape()[axis + 1..]);
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), selected.iter().cloned().collect())?)
}

fn reduce(
    input: &ArrayD<f32>,
    axes: &[i64],
    keepdims: bool,
    op: impl Fn(ArrayD<f32>, Axis) -> ArrayD<f32>,
) -> Result<ArrayD<f32>, EvalError> {
    let rank = input.ndim();
    let mut axes = if axes.is_empty() {
        (0..rank).collect::<Vec<_>>()
    } else {
        axes.iter().map(|a| normalize_axis(*a, rank)).collect::<Result<Vec<_>, _>>()?
    };
    axes.sort_unstable();
    axes.dedup();

    let mut out = input.clone();
    // Highest axis first so the remaining indices stay valid
    for &axis in axes.iter().rev() {
        out = op(out, Axis(axis));
        if keepdims {
            out.insert_axis_inplace(Axis(axis));
        }
    }
    Ok(out)
}

fn reduce_mean(input: &ArrayD<f32>, axes: &[i64], keepdims: bool) -> Result<ArrayD<f32>, EvalError> {
    reduce(input, axes, keepdims, |x, axis| {
        let n = x.len_of(axis) as f32;
        x.sum_axis(axis) / n
    })
}

fn reduce_l2(input: &ArrayD<f32>, axes: &[i64], keepdims: bool) -> Result<ArrayD<f32>, EvalError> {
    // Square once, sum over every axis, then take the root
    let squared = reduce(&input.mapv(|v| v * v), axes, keepdims, |x, axis| x.sum_axis(axis))?;
    Ok(squared.mapv(f32::sqrt))
}

fn cast(value: &Value, to: i32) -> Result<Value, EvalError> {
    match proto_dtype(to)? {
        DType::F32 => Ok(Value::F32(match value {
            Value::F32(a) => a.clone(),
            Value::F16(a) => a.mapv(|x| x.to_f32()),
            Value::BF16(a) => a.mapv(|x| x.to_f32()),
            Value::I32(a) => a.mapv(|x| x as f32),
            Value::I64(a) => a.mapv(|x| x as f32),
        })),
        DType::I64 => Ok(Value::I64(value.indices()?)),
        _ => Err(EvalError::UnsupportedDType(to)),
    }
}

/// Numpy-style broadcast of two shapes, `None` when they are incompatible.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| if i < rank - s.len() { 1 } else { s[i - (rank - s.len())] };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y || y == 1 => Some(x),
            (1, y) => Some(y),
            _ => None,
        })
        .collect()
}

fn divide(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, EvalError> {
    let mismatch = || EvalError::TypeMismatch(format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()));
    let shape = IxDyn(&broadcast_shape(a.shape(), b.shape()).ok_or_else(mismatch)?);
    let (Some(a_view), Some(b_view)) = (a.broadcast(shape.clone()), b.broadcast(shape)) else {
        return Err(mismatch());
    };
    Ok(&a_view / &b_view)
}

fn optional_scalar(values: &HashMap<String, Value>, name: Option<&String>) -> Result<Option<f32>, EvalError> {
    match name.filter(|n| !n.is_empty()) {
        None => Ok(None),
        Some(name) => {
            let value = values.get(name).ok_or_else(|| EvalError::MissingValue(name.clone()))?;
            let array = value.as_f32()?;
            array.iter().next().copied()
                .map(Some)
                .ok_or_else(|| EvalError::TypeMismatch(format!("{name} is empty")))
        }
    }
}

fn node_input<'a>(node: &onnx::NodeProto, values: &'a HashMap<String, Value>, i: usize) -> Result<&'a Value, EvalError> {
    let name = node.input.get(i).ok_or_else(|| EvalError::MissingValue(format!("{}[{i}]", node.name)))?;
    values.get(name).ok_or_else(|| EvalError::MissingValue(name.clone()))
}

fn run_node(node: &onnx::NodeProto, values: &HashMap<String, Value>) -> Result<Value, EvalError> {
    let input = |i: usize| node_input(node, values, i);
    let ints = |name: &str| attribute(node, name).map(|a| a.ints.clone()).unwrap_or_default();
    let keepdims = attribute(node, "keepdims").map(|a| a.i != 0).unwrap_or(true);

    match node.op_type.as_str() {
        "Gather" => {
            let data = input(0)?;
            let indices = input(1)?.indices()?;
            let axis = normalize_axis(attribute(node, "axis").map(|a| a.i).unwrap_or(0), data.shape().len())?;
            Ok(match data {
                Value::F32(a) => Value::F32(gather(a, &indices, axis)?),
                Value::F16(a) => Value::F16(gather(a, &indices, axis)?),
                Value::BF16(a) => Value::BF16(gather(a, &indices, axis)?),
                Value::I32(a) => Value::I32(gather(a, &indices, axis)?),
                Value::I64(a) => Value::I64(gather(a, &indices, axis)?),
            })
        }
        "Cast" => {
            let to = attribute(node, "to")
                .ok_or_else(|| EvalError::MissingAttribute(node.name.clone(), "to".to_string()))?;
            cast(input(0)?, to.i as i32)
        }
        "ReduceMean" => Ok(Value::F32(reduce_mean(input(0)?.as_f32()?, &ints("axes"), keepdims)?)),
        "ReduceL2" => Ok(Value::F32(reduce_l2(input(0)?.as_f32()?, &ints("axes"), keepdims)?)),
        "Clip" => {
            let x = input(0)?.as_f32()?;
            let min = optional_scalar(values, node.input.get(1))?.unwrap_or(f32::MIN);
            let max = optional_scalar(values, node.input.get(2))?.unwrap_or(f32::MAX);
            if !(min <= max) {
                return Err(EvalError::TypeMismatch(format!("Clip bounds {min} > {max}")));
            }
            Ok(Value::F32(x.mapv(|v| v.clamp(min, max))))
        }
        "Div" => Ok(Value::F32(divide(input(0)?.as_f32()?, input(1)?.as_f32()?)?)),
        other => Err(EvalError::UnsupportedOp(other.to_string())),
    }
}

/// Runs `model` on `inputs` and returns every graph output by name.
/// External initializers are resolved relative to `base_dir`.
pub fn evaluate(
    model: &onnx::ModelProto,
    base_dir: &Path,
    inputs: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, EvalError> {
    let graph = model.graph.as_ref().ok_or(EvalError::NoGraph)?;

    let mut values = inputs;
    for initializer in &graph.initializer {
        values.insert(initializer.name.clone(), load_initializer(initializer, base_dir)?);
    }
    for node in &graph.node {
        trace!("Evaluating {} ({})", node.name, node.op_type);
        let result = run_node(node, &values)?;
        let output = node.output.first()
            .ok_or_else(|| EvalError::MissingValue(format!("output of {}", node.name)))?;
        values.insert(output.clone(), result);
    }

    graph.output.iter()
        .map(|o| -> Result<(String, Value), EvalError> {
            let value = values.remove(&o.name).ok_or_else(|| EvalError::MissingValue(o.name.clone()))?;
            Ok((o.name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn gather_splices_index_shape() {
        let data = array![[0.0f32, 1.0], [2.0, 3.0], [4.0, 5.0]].into_dyn();
        let ids = array![[2i64, 0, 2]].into_dyn();
        let out = gather(&data, &ids, 0).unwrap();
        assert_eq!(out.shape(), &[1, 3, 2]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![4.0, 5.0, 0.0, 1.0, 4.0, 5.0]);
    }

    #[test]
    fn gather_rejects_out_of_range_ids() {
        let data = array![[0.0f32], [1.0]].into_dyn();
        let ids = array![[2i64]].into_dyn();
        assert!(matches!(gather(&data, &ids, 0), Err(EvalError::IndexOutOfRange(2, 2))));
    }

    #[test]
    fn reductions_follow_keepdims() {
        let x = array![[[1.0f32, 2.0], [3.0, 4.0]]].into_dyn();
        let mean = reduce_mean(&x, &[1], false).unwrap();
        assert_eq!(mean, array![[2.0f32, 3.0]].into_dyn());

        let v = array![[3.0f32, 4.0]].into_dyn();
        let norm = reduce_l2(&v, &[-1], true).unwrap();
        assert_eq!(norm, array![[5.0f32]].into_dyn());
    }

    #[test]
    fn division_broadcasts_the_norm() {
        let x = array![[3.0f32, 4.0], [6.0, 8.0]].into_dyn();
        let norm = array![[5.0f32], [10.0]].into_dyn();
        assert_eq!(divide(&x, &norm).unwrap(), array![[0.6f32, 0.8], [0.6, 0.8]].into_dyn());
    }

    #[test]
    fn incompatible_division_is_an_error() {
        let x = array![[1.0f32, 2.0, 3.0]].into_dyn();
        let y = array![[1.0f32, 2.0]].into_dyn();
        assert!(matches!(divide(&x, &y), Err(EvalError::TypeMismatch(_))));
        assert_eq!(broadcast_shape(&[2, 1, 4], &[3, 1]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shape(&[1, 3], &[1, 2]), None);
    }

    #[test]
    fn unknown_ops_are_reported() {
        let node = onnx::NodeProto {
            op_type: "MatMul".to_string(),
            ..Default::default()
        };
        assert!(matches!(run_node(&node, &HashMap::new()), Err(EvalError::UnsupportedOp(op)) if op == "MatMul"));
    }
}
