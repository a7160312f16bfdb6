use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::{Array2, Axis};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::model::{ModelError, StaticModel, CONFIG_FILE, TOKENIZER_FILE};
use crate::npy::{self, NpyError};
use crate::tokenizer::Tokenizer;

pub const WEIGHTS_NPY_FILE: &str = "embedding_weights.npy";
pub const VOCAB_FILE: &str = "vocab.json";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";
pub const BINARY_FILE: &str = "embeddings.bin";
pub const BINARY_METADATA_FILE: &str = "embeddings_metadata.json";

pub const MODEL_TYPE: &str = "model2vec_static";
pub const TEST_SENTENCE: &str = "This is a test sentence.";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    ModelError(#[from] ModelError),
    #[error(transparent)]
    NpyError(#[from] NpyError),
    #[error("I/O error on {0}: {1}")]
    IoError(PathBuf, std::io::Error),
    #[error("Bad JSON in {0}: {1}")]
    JsonError(PathBuf, serde_json::Error),
    #[error("Vocabulary has {vocab} entries but the embedding matrix has {rows} rows")]
    VocabSizeMismatch { vocab: usize, rows: usize },
    #[error("{path} is {found} bytes, metadata implies {expected}")]
    BinaryLengthMismatch { path: PathBuf, expected: u64, found: u64 },
}

/// Contents of `model_config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub model_type: String,
    pub normalize: bool,
}

/// Contents of `embeddings_metadata.json`, describing `embeddings.bin`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsMetadata {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub data_type: String,
    pub byte_order: String,
}

impl EmbeddingsMetadata {
    pub fn expected_len(&self) -> u64 {
        (self.vocab_size * self.embedding_dim * std::mem::size_of::<f32>()) as u64
    }
}

/// Serializes a vocabulary as a JSON object with keys in id order.
struct VocabById<'a>(&'a [(String, u32)]);

impl Serialize for VocabById<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (token, id) in self.0 {
            map.serialize_entry(token, id)?;
        }
        map.end()
    }
}

pub fn vocab_by_id(vocab: HashMap<String, u32>) -> Vec<(String, u32)> {
    let mut entries: Vec<_> = vocab.into_iter().collect();
    entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExtractError> {
    let file = File::create(path).map_err(|e| ExtractError::IoError(path.to_path_buf(), e))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value).map_err(|e| ExtractError::JsonError(path.to_path_buf(), e))?;
    out.flush().map_err(|e| ExtractError::IoError(path.to_path_buf(), e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ExtractError> {
    let file = File::open(path).map_err(|e| ExtractError::IoError(path.to_path_buf(), e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| ExtractError::JsonError(path.to_path_buf(), e))
}

/// Paths written by [`extract_model_weights`].
#[derive(Clone, Debug)]
pub struct ExtractionReport {
    pub weights_path: PathBuf,
    pub vocab_path: PathBuf,
    pub config_path: PathBuf,
    pub copied_files: Vec<PathBuf>,
    pub config: ModelConfig,
    pub check: ExtractionCheck,
}

/// What [`test_extraction`] saw when reloading the written files.
#[derive(Clone, Debug)]
pub struct ExtractionCheck {
    pub loaded_shape: (usize, usize),
    pub vocab_size: usize,
    pub config: ModelConfig,
    pub model_embedding: Vec<f32>,
    pub token_ids: Vec<u32>,
    /// Rows of the reloaded matrix for the first five tokens.
    pub token_rows: Array2<f32>,
}

pub fn extract_model_weights(model_path: &Path, output_path: &Path) -> Result<ExtractionReport, ExtractError> {
    if !model_path.exists() {
        return Err(ModelError::MissingPath(model_path.to_path_buf()).into());
    }
    info!("Loading model from: {}", model_path.display());
    let model = StaticModel::load(model_path)?;

    info!("Extracting model components...");
    std::fs::create_dir_all(output_path).map_err(|e| ExtractError::IoError(output_path.to_path_buf(), e))?;

    let weights = model.embeddings();
    info!("Embedding weights shape: {:?}", weights.dim());
    let weights_path = output_path.join(WEIGHTS_NPY_FILE);
    npy::write_f32_array(&weights_path, weights)?;
    info!("Saved embedding weights to: {}", weights_path.display());

    let vocab = vocab_by_id(model.tokenizer().vocab());
    if vocab.len() != model.vocab_size() {
        return Err(ExtractError::VocabSizeMismatch { vocab: vocab.len(), rows: model.vocab_size() });
    }
    let vocab_path = output_path.join(VOCAB_FILE);
    write_json(&vocab_path, &VocabById(&vocab))?;
    info!("Saved vocabulary to: {}", vocab_path.display());

    let config = ModelConfig {
        vocab_size: vocab.len(),
        embedding_dim: model.embedding_dim(),
        model_type: MODEL_TYPE.to_string(),
        normalize: model.normalize(),
    };
    let config_path = output_path.join(MODEL_CONFIG_FILE);
    write_json(&config_path, &config)?;
    info!("Saved model config to: {}", config_path.display());

    let copy_error = |e| ExtractError::IoError(output_path.to_path_buf(), e);
    let mut copied_files = crate::copy_side_files(model.root(), output_path, &[CONFIG_FILE]).map_err(copy_error)?;
    let tokenizer_sources = [model.root().join(TOKENIZER_FILE), model.tokenizer_path().to_path_buf()];
    copied_files.extend(crate::copy_first_existing(&tokenizer_sources, &output_path.join(TOKENIZER_FILE)).map_err(copy_error)?);

    info!("Testing extraction...");
    let check = test_extraction(&model, output_path)?;

    Ok(ExtractionReport { weights_path, vocab_path, config_path, copied_files, config, check })
}

/// Reloads the written files and logs them next to the model's own output
/// for the test sentence. Nothing here is compared automatically.
pub fn test_extraction(model: &StaticModel, output_path: &Path) -> Result<ExtractionCheck, ExtractError> {
    let weights = npy::read_f32_array(&output_path.join(WEIGHTS_NPY_FILE))?;
    let vocab: HashMap<String, u32> = read_json(&output_path.join(VOCAB_FILE))?;
    let config: ModelConfig = read_json(&output_path.join(MODEL_CONFIG_FILE))?;
    info!("Loaded weights shape: {:?}", weights.dim());
    info!("Vocabulary size: {}", vocab.len());
    info!("Config: {config:?}");

    let model_embedding = model.encode(TEST_SENTENCE)?.to_vec();
    info!("Original embedding shape: [1, {}]", model_embedding.len());
    info!("Original embedding (first 5 values): {:?}", &model_embedding[..model_embedding.len().min(5)]);

    let token_ids = model.tokenize(TEST_SENTENCE)?;
    info!("Tokens: {:?}...", &token_ids[..token_ids.len().min(10)]);

    let rows = token_ids.iter().take(5).map(|&id| {
        if (id as usize) < weights.nrows() {
            Ok(id as usize)
        } else {
            Err(ModelError::TokenOutOfRange(id, weights.nrows()))
        }
    }).collect::<Result<Vec<_>, _>>()?;
    let token_rows = weights.select(Axis(0), &rows);
    if token_rows.nrows() > 0 {
        info!("Token embeddings shape: {:?}", token_rows.dim());
        let first = token_rows.row(0);
        info!("First token embedding (first 5 values): {:?}", first.iter().take(5).collect::<Vec<_>>());
    } else {
        warn!("Test sentence produced no tokens");
    }
    info!("✅ Extraction test completed!");

    Ok(ExtractionCheck {
        loaded_shape: weights.dim(),
        vocab_size: vocab.len(),
        config,
        model_embedding,
        token_ids,
        token_rows,
    })
}

fn write_le_f32(out: &mut impl Write, weights: &Array2<f32>) -> std::io::Result<()> {
    match weights.as_slice() {
        Some(values) if cfg!(target_endian = "little") => out.write_all(bytemuck::cast_slice(values)),
        _ => {
            for value in weights.iter() {
                out.write_all(&value.to_le_bytes())?;
            }
            Ok(())
        }
    }
}

/// Writes `embeddings.bin` and its metadata from the saved npy file, then
/// checks the file length against the metadata.
pub fn create_binary_export(output_path: &Path) -> Result<EmbeddingsMetadata, ExtractError> {
    let weights = npy::read_f32_array(&output_path.join(WEIGHTS_NPY_FILE))?;

    let binary_path = output_path.join(BINARY_FILE);
    let io_error = |e| ExtractError::IoError(binary_path.clone(), e);
    let mut out = BufWriter::new(File::create(&binary_path).map_err(io_error)?);
    write_le_f32(&mut out, &weights).map_err(io_error)?;
    out.flush().map_err(io_error)?;
    drop(out);
    info!("Saved binary embeddings to: {}", binary_path.display());

    let metadata = EmbeddingsMetadata {
        vocab_size: weights.nrows(),
        embedding_dim: weights.ncols(),
        data_type: "float32".to_string(),
        byte_order: "little".to_string(),
    };
    let metadata_path = output_path.join(BINARY_METADATA_FILE);
    write_json(&metadata_path, &metadata)?;
    info!("Saved metadata to: {}", metadata_path.display());

    let found = std::fs::metadata(&binary_path).map_err(io_error)?.len();
    if found != metadata.expected_len() {
        return Err(ExtractError::BinaryLengthMismatch { path: binary_path, expected: metadata.expected_len(), found });
    }
    Ok(metadata)
}
