pub mod operators;
pub mod weights;
pub mod tensor;
mod node;
pub use node::Node;
pub mod pytorch;
pub mod onnx;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use serde::Serialize;
use tensor::{tensor_key, DType, InputTensor, Tensor};
use node::node_key;
use crate::weights::{BinOutputManager, EmbeddedOutputManager, WeightOutputManager};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shape error: {0}")]
    InputShapeError(String),
    #[error("DType mismatch: {0} vs {1}")]
    DTypeMismatchError(DType, DType),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error("Invalid dtype: {0}")]
    InvalidDTypeError(DType),
    #[error("Unsupported dtype: {0}")]
    UnsupportedDTypeError(String),
    #[error("Axis {0} is out of range for rank {1}")]
    InvalidAxisError(i64, usize),
    #[error("Tensor name used twice: {0}")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension {0} has no fixed size")]
    UnresolvedDimensionError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    SafeTensorError(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    SerdeJSONError(#[from] serde_json::Error),
}

/// Where initializer bytes are written when a graph is serialized.
#[derive(Clone, Debug, PartialEq)]
pub enum WeightStorageStrategy {
    EmbeddedData,
    BinFile(PathBuf),
}

/// Post-order walk from the graph outputs, so that every node comes after
/// the nodes producing its inputs.
#[derive(Default)]
struct GraphWalk<'a> {
    tensors: Vec<&'a dyn Tensor>,
    seen_tensors: HashSet<*const ()>,
    nodes: Vec<&'a dyn Node>,
    seen_nodes: HashSet<*const ()>,
}

impl<'a> GraphWalk<'a> {
    fn visit(&mut self, tensor: &'a dyn Tensor) {
        if !self.seen_tensors.insert(tensor_key(tensor)) {
            return;
        }
        if let Some(node) = tensor.get_node() {
            if self.seen_nodes.insert(node_key(node)) {
                for input in node.get_input_tensors() {
                    self.visit(input);
                }
                self.nodes.push(node);
            }
        }
        self.tensors.push(tensor);
    }
}

pub fn build_proto(
    inputs: &[Arc<InputTensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    output_method: &WeightStorageStrategy,
    opset_version: i64,
) -> Result<onnx::ModelProto, Error> {
    let mut walk = GraphWalk::default();
    for (_, tensor) in outputs {
        walk.visit(tensor.as_ref());
    }

    let input_keys: HashSet<*const ()> = inputs.iter().map(|t| tensor_key(t.as_ref())).collect();
    let output_keys: HashSet<*const ()> = outputs.iter().map(|(_, t)| tensor_key(t.as_ref())).collect();

    // Output names first, then requested names, then generated ones
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<*const (), String> = HashMap::new();
    for (name, tensor) in outputs {
        if !chosen_names.insert(name.to_string()) {
            return Err(Error::NameConflictError(name.to_string()));
        }
        tensor_names.insert(tensor_key(tensor.as_ref()), name.to_string());
    }
    for tensor in &walk.tensors {
        let key = tensor_key(*tensor);
        if tensor_names.contains_key(&key) {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            // Graph inputs keep their names; anything else yields with a suffix
            let name = if chosen_names.contains(name) && !input_keys.contains(&key) {
                (1..).map(|i| format!("{name}_{i}")).find(|n| !chosen_names.contains(n)).unwrap_or_default()
            } else {
                name.to_string()
            };
            if !chosen_names.insert(name.clone()) {
                return Err(Error::NameConflictError(name));
            }
            tensor_names.insert(key, name);
        }
    }
    let mut next_tensor_id = 0;
    for tensor in &walk.tensors {
        let key = tensor_key(*tensor);
        if !tensor_names.contains_key(&key) {
            let name = loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if !chosen_names.contains(&name) {
                    break name;
                }
            };
            chosen_names.insert(name.clone());
            tensor_names.insert(key, name);
        }
    }

    let mut data_manager: Box<dyn WeightOutputManager> = match output_method {
        WeightStorageStrategy::EmbeddedData => Box::new(EmbeddedOutputManager::new()),
        WeightStorageStrategy::BinFile(path) => Box::new(BinOutputManager::new(path)?),
    };

    let mut initializers = vec![];
    let mut value_info = vec![];
    for tensor in &walk.tensors {
        let key = tensor_key(*tensor);
        if input_keys.contains(&key) {
            continue;
        }
        if let Some(initializer) = tensor.get_initializer(tensor_names[&key].clone(), data_manager.as_mut())? {
            initializers.push(initializer);
        }
        else if !output_keys.contains(&key) && tensor.get_node().is_some() {
            value_info.push(tensor.to_value_info_proto(tensor_names[&key].clone()));
        }
    }
    data_manager.finalize_tensor_data()?;

    let graph = onnx::GraphProto {
        name: String::from("main_graph"),
        node: walk.nodes.iter()
            .map(|node| node.to_node_proto(node.get_name().map(|name| name.to_string()), &tensor_names))
            .collect(),
        initializer: initializers,
        input: inputs.iter().map(|tensor| {
            let name = tensor_names.get(&tensor_key(tensor.as_ref())).cloned()
                .unwrap_or_else(|| tensor.get_name().unwrap_or_default().to_string());
            tensor.to_value_info_proto(name)
        }).collect(),
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        value_info,
        .. Default::default()
    };

    Ok(onnx::ModelProto {
        ir_version: onnx::IR_VERSION_2019_9_19,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: opset_version,
        }],
        producer_name: String::from("onnx-graph"),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        .. Default::default()
    })
}

/// Attaches `value` as a JSON-encoded `metadata_props` entry.
pub fn push_metadata<T: Serialize>(model: &mut onnx::ModelProto, key: &str, value: &T) -> Result<(), Error> {
    model.metadata_props.push(onnx::StringStringEntryProto {
        key: key.to_string(),
        value: serde_json::to_string(value)?,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Gather, Reduce, ReduceOp};
    use crate::tensor::{ConstantTensor, Dimension, Shape, TensorData, TensorDataValue};

    fn small_graph() -> (Arc<InputTensor>, Arc<dyn Tensor>) {
        let ids = InputTensor::new(
            "input_ids".to_string(),
            DType::I64,
            Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::symbolic("sequence")]),
        );
        let table = ConstantTensor::new(
            Some("embedding.weight".to_string()),
            TensorData::new(TensorDataValue::F32((0..12).map(|x| x as f32).collect()), Shape::from(vec![4usize, 3])).unwrap(),
        );
        let gathered = Gather::new(Some("lookup".to_string()), table, ids.clone(), 0).unwrap();
        let pooled: Arc<dyn Tensor> = Reduce::new(Some("pool".to_string()), ReduceOp::Mean, gathered, vec![1], false).unwrap();
        (ids, pooled)
    }

    #[test]
    fn nodes_are_topologically_ordered() {
        let (ids, pooled) = small_graph();
        let model = build_proto(&[ids], &[("embeddings", pooled)], &WeightStorageStrategy::EmbeddedData, 11).unwrap();
        let graph = model.graph.unwrap();
        let ops: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Gather", "ReduceMean"]);
        assert_eq!(graph.node[0].input, vec!["embedding.weight".to_string(), "input_ids".to_string()]);
        assert_eq!(graph.node[1].output, vec!["embeddings".to_string()]);
        assert_eq!(graph.node[0].output, graph.node[1].input);
    }

    #[test]
    fn constants_become_initializers() {
        let (ids, pooled) = small_graph();
        let model = build_proto(&[ids], &[("embeddings", pooled)], &WeightStorageStrategy::EmbeddedData, 11).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer.len(), 1);
        assert_eq!(graph.initializer[0].dims, vec![4, 3]);
        assert_eq!(graph.initializer[0].raw_data.len(), 12 * 4);
        assert_eq!(graph.input.len(), 1);
        assert_eq!(graph.value_info.len(), 1);
        assert_eq!(model.opset_import[0].version, 11);
    }

    #[test]
    fn duplicate_output_names_conflict() {
        let (ids, pooled) = small_graph();
        let result = build_proto(
            &[ids],
            &[("embeddings", pooled.clone()), ("embeddings", pooled)],
            &WeightStorageStrategy::EmbeddedData,
            11,
        );
        assert!(matches!(result, Err(Error::NameConflictError(_))));
    }

    #[test]
    fn initializer_named_like_an_output_is_renamed() {
        let ids = InputTensor::new("input_ids".to_string(), DType::I64, Shape::from(vec![1usize, 2]));
        let table = ConstantTensor::new(
            Some("embeddings".to_string()),
            TensorData::new(TensorDataValue::F32(vec![0.0; 6]), Shape::from(vec![3usize, 2])).unwrap(),
        );
        let gathered = Gather::new(None, table, ids.clone(), 0).unwrap();
        let pooled: Arc<dyn Tensor> = Reduce::new(None, ReduceOp::Mean, gathered, vec![1], false).unwrap();
        let model = build_proto(&[ids], &[("embeddings", pooled)], &WeightStorageStrategy::EmbeddedData, 11).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer[0].name, "embeddings_1");
        assert_eq!(graph.node[0].input[0], "embeddings_1");
        assert_eq!(graph.output[0].name, "embeddings");
    }

    #[test]
    fn metadata_is_json_encoded() {
        let (ids, pooled) = small_graph();
        let mut model = build_proto(&[ids], &[("embeddings", pooled)], &WeightStorageStrategy::EmbeddedData, 11).unwrap();
        push_metadata(&mut model, "info", &vec![1, 2]).unwrap();
        assert_eq!(model.metadata_props[0].value, "[1,2]");
    }
}
