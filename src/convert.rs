use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array2, ArrayD, IxDyn};
use onnx_graph::onnx::{self, type_proto, tensor_proto::DataType};
use onnx_graph::tensor::{DType, Dimension, InputTensor, Shape, Tensor};
use onnx_graph::{pytorch, WeightStorageStrategy};
use prost::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::model::{ModelError, StaticModel, CONFIG_FILE, MODULES_FILE, NORMALIZE_EPSILON, TOKENIZER_FILE};
use crate::verify::{self, EvalError, Value};

pub const ONNX_FILE: &str = "model.onnx";
pub const ONNX_DATA_FILE: &str = "model.onnx.data";
pub const INPUT_NAME: &str = "input_ids";
pub const OUTPUT_NAME: &str = "embeddings";
pub const METADATA_KEY: &str = "model2vec_metadata";

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(transparent)]
    ModelError(#[from] ModelError),
    #[error(transparent)]
    OnnxGraphError(#[from] onnx_graph::Error),
    #[error(transparent)]
    EvalError(#[from] EvalError),
    #[error("Failed to write {0}: {1}")]
    IoError(PathBuf, std::io::Error),
    #[error("Model has an empty vocabulary")]
    EmptyVocabulary,
    #[error("Traced output has shape {found:?}, expected {expected:?}")]
    TraceShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    #[error("Exported graph interface is wrong: {0}")]
    InterfaceMismatch(String),
    #[error("Invalid conversion options: {0}")]
    InvalidOptions(String),
}

/// Knobs for a conversion run.
#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub opset_version: i64,
    /// Write initializers to `model.onnx.data` instead of inline.
    pub external_data: bool,
    pub trace_batch_size: usize,
    pub trace_sequence_length: usize,
    /// Synthetic ids are drawn from `0..min(trace_max_token_id, vocab_size)`.
    pub trace_max_token_id: usize,
    pub seed: u64,
    pub test_sentence: String,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            opset_version: 11,
            external_data: false,
            trace_batch_size: 1,
            trace_sequence_length: 128,
            trace_max_token_id: 30000,
            seed: 0,
            test_sentence: "This is a test sentence for embedding.".to_string(),
        }
    }
}

impl ConvertOptions {
    /// The trace input must hold at least one token per row, since an empty
    /// ReduceMean yields NaN.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.trace_batch_size == 0 || self.trace_sequence_length == 0 {
            return Err(ConvertError::InvalidOptions(format!(
                "trace input must be non-empty, got batch size {} and sequence length {}",
                self.trace_batch_size, self.trace_sequence_length
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
struct Model2VecMetadata<'a> {
    embedding_dim: usize,
    vocab_size: usize,
    normalize: bool,
    modules: &'a [String],
}

/// What a successful conversion produced.
#[derive(Clone, Debug)]
pub struct ConversionReport {
    pub onnx_path: PathBuf,
    pub data_path: Option<PathBuf>,
    pub copied_files: Vec<PathBuf>,
    pub smoke_test: SmokeTest,
}

/// Result of encoding the test sentence both ways.
#[derive(Clone, Debug)]
pub struct SmokeTest {
    pub token_ids: Vec<u32>,
    pub model_shape: Vec<usize>,
    pub model_head: Vec<f32>,
    pub graph_head: Option<Vec<f32>>,
    /// Largest elementwise difference between graph and model. Reported only.
    pub max_abs_diff: Option<f32>,
}

/// The exported computation: mean of the looked-up rows, then optional L2
/// normalization.
pub fn build_graph(model: &StaticModel) -> Result<(Arc<InputTensor>, Arc<dyn Tensor>), ConvertError> {
    let input_ids = InputTensor::new(
        INPUT_NAME.to_string(),
        DType::I64,
        Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::symbolic("sequence")]),
    );
    let weight = model.weight_tensor()?;
    let pooled = pytorch::embedding_bag_mean(Some("static_embedding"), weight, input_ids.clone())?;
    let output: Arc<dyn Tensor> = if model.normalize() {
        pytorch::normalize(pooled, NORMALIZE_EPSILON)?
    } else {
        pooled
    };
    Ok((input_ids, output))
}

pub fn export_model(model: &StaticModel, options: &ConvertOptions, output_dir: &Path) -> Result<onnx::ModelProto, ConvertError> {
    let (input_ids, output) = build_graph(model)?;
    let storage = if options.external_data {
        WeightStorageStrategy::BinFile(output_dir.join(ONNX_DATA_FILE))
    } else {
        WeightStorageStrategy::EmbeddedData
    };
    let mut proto = onnx_graph::build_proto(&[input_ids], &[(OUTPUT_NAME, output)], &storage, options.opset_version)?;
    onnx_graph::push_metadata(&mut proto, METADATA_KEY, &Model2VecMetadata {
        embedding_dim: model.embedding_dim(),
        vocab_size: model.vocab_size(),
        normalize: model.normalize(),
        modules: model.modules(),
    })?;
    Ok(proto)
}

fn run_graph(proto: &onnx::ModelProto, base_dir: &Path, ids: ArrayD<i64>) -> Result<ArrayD<f32>, ConvertError> {
    let inputs = HashMap::from([(INPUT_NAME.to_string(), Value::from(ids))]);
    let mut outputs = verify::evaluate(proto, base_dir, inputs)?;
    let output = outputs.remove(OUTPUT_NAME).ok_or_else(|| EvalError::MissingValue(OUTPUT_NAME.to_string()))?;
    Ok(output.into_f32()?)
}

/// Runs the graph on seeded random ids and checks the output is
/// `[batch, embedding_dim]`.
pub fn trace_check(proto: &onnx::ModelProto, base_dir: &Path, model: &StaticModel, options: &ConvertOptions) -> Result<(), ConvertError> {
    options.validate()?;
    let upper = options.trace_max_token_id.min(model.vocab_size());
    if upper == 0 {
        return Err(ConvertError::EmptyVocabulary);
    }
    let mut rng = StdRng::seed_from_u64(options.seed);
    let shape = (options.trace_batch_size, options.trace_sequence_length);
    let ids = Array2::from_shape_simple_fn(shape, || rng.gen_range(0..upper as i64)).into_dyn();

    let output = run_graph(proto, base_dir, ids)?;
    let expected = vec![options.trace_batch_size, model.embedding_dim()];
    if output.shape() != expected.as_slice() {
        return Err(ConvertError::TraceShapeMismatch { expected, found: output.shape().to_vec() });
    }
    debug!("Trace check passed with output shape {:?}", output.shape());
    Ok(())
}

fn check_value_info(info: &[onnx::ValueInfoProto], name: &str, elem_type: DataType) -> Result<(), ConvertError> {
    let [value] = info else {
        return Err(ConvertError::InterfaceMismatch(format!("expected exactly one {name}, found {}", info.len())));
    };
    if value.name != name {
        return Err(ConvertError::InterfaceMismatch(format!("expected {name}, found {}", value.name)));
    }
    let found = value.r#type.as_ref().and_then(|t| match &t.value {
        Some(type_proto::Value::TensorType(tensor)) => Some(tensor.elem_type),
        None => None,
    });
    if found != Some(elem_type as i32) {
        return Err(ConvertError::InterfaceMismatch(format!("{name} should be {elem_type:?}")));
    }
    Ok(())
}

fn head(values: impl IntoIterator<Item = f32>) -> Vec<f32> {
    values.into_iter().take(5).collect()
}

/// Re-reads the written file, checks its interface, and compares the graph
/// with the model on one sentence.
pub fn smoke_test(onnx_path: &Path, model: &StaticModel, options: &ConvertOptions) -> Result<SmokeTest, ConvertError> {
    let proto = verify::load_model(onnx_path)?;
    let graph = proto.graph.as_ref().ok_or(EvalError::NoGraph)?;
    check_value_info(&graph.input, INPUT_NAME, DataType::Int64)?;
    check_value_info(&graph.output, OUTPUT_NAME, DataType::Float)?;

    info!("Testing with text: '{}'", options.test_sentence);
    let token_ids = model.tokenize(&options.test_sentence)?;
    let embedding = model.encode_ids(&token_ids)?;
    let model_shape = vec![1, embedding.len()];
    let model_head = head(embedding.iter().copied());
    info!("Original embedding shape: {model_shape:?}");
    info!("Original embedding (first 5 values): {model_head:?}");

    let (graph_head, max_abs_diff) = if token_ids.is_empty() {
        (None, None)
    } else {
        let base_dir = onnx_path.parent().unwrap_or(Path::new("."));
        let ids = ArrayD::from_shape_vec(IxDyn(&[1, token_ids.len()]), token_ids.iter().map(|&id| id as i64).collect())
            .map_err(EvalError::from)?;
        let output = run_graph(&proto, base_dir, ids)?;
        let diff = output.iter().zip(embedding.iter()).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
        let graph_head = head(output.iter().copied());
        info!("ONNX embedding (first 5 values): {graph_head:?}");
        info!("Max absolute difference: {diff:e}");
        (Some(graph_head), Some(diff))
    };

    Ok(SmokeTest { token_ids, model_shape, model_head, graph_head, max_abs_diff })
}

pub fn convert_model_to_onnx(model_path: &Path, output_path: &Path, options: &ConvertOptions) -> Result<ConversionReport, ConvertError> {
    options.validate()?;
    if !model_path.exists() {
        return Err(ModelError::MissingPath(model_path.to_path_buf()).into());
    }
    info!("Loading model from: {}", model_path.display());
    let model = StaticModel::load(model_path)?;

    info!("Converting to ONNX...");
    std::fs::create_dir_all(output_path).map_err(|e| ConvertError::IoError(output_path.to_path_buf(), e))?;
    info!("Model modules: {:?}", model.modules());

    let proto = export_model(&model, options, output_path)?;
    trace_check(&proto, output_path, &model, options)?;

    let onnx_path = output_path.join(ONNX_FILE);
    std::fs::write(&onnx_path, proto.encode_to_vec()).map_err(|e| ConvertError::IoError(onnx_path.clone(), e))?;
    info!("ONNX model saved to: {}", onnx_path.display());

    let copy_error = |e| ConvertError::IoError(output_path.to_path_buf(), e);
    let mut copied_files = crate::copy_side_files(model.root(), output_path, &[CONFIG_FILE, MODULES_FILE]).map_err(copy_error)?;
    let tokenizer_sources = [model.root().join(TOKENIZER_FILE), model.tokenizer_path().to_path_buf()];
    copied_files.extend(crate::copy_first_existing(&tokenizer_sources, &output_path.join(TOKENIZER_FILE)).map_err(copy_error)?);

    info!("Testing ONNX model...");
    let smoke_test = smoke_test(&onnx_path, &model, options)?;
    info!("ONNX model structure looks good!");

    Ok(ConversionReport {
        onnx_path,
        data_path: options.external_data.then(|| output_path.join(ONNX_DATA_FILE)),
        copied_files,
        smoke_test,
    })
}
