use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1};
use onnx_graph::tensor::{DType, Tensor};
use onnx_graph::weights::{SafetensorsWeightManager, WeightManager};
use serde::Deserialize;

use crate::tokenizer::{load_tokenizer, Tokenizer, TokenizerError};

pub const MODULES_FILE: &str = "modules.json";
pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Tensor name used by sentence-transformers' `StaticEmbedding` module.
pub const STATIC_EMBEDDING_WEIGHT: &str = "embedding.weight";
/// Tensor name used by native model2vec checkpoints.
pub const MODEL2VEC_WEIGHT: &str = "embeddings";

/// Floor applied to the L2 norm before dividing, as `F.normalize` does.
pub const NORMALIZE_EPSILON: f32 = 1e-12;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Input path does not exist: {0}")]
    MissingPath(PathBuf),
    #[error("Cannot identify model layout in {0}: expected modules.json or model.safetensors")]
    CannotIdentifyModel(PathBuf),
    #[error("Missing model file: {0}")]
    MissingFile(PathBuf),
    #[error("Failed to read {0}: {1}")]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse {0}: {1}")]
    ConfigParseError(PathBuf, serde_json::Error),
    #[error("No modules listed in {0}")]
    NoModules(PathBuf),
    #[error("First module must be a StaticEmbedding, found {0}")]
    UnsupportedModule(String),
    #[error("No tensor {name} in {path}, found {available:?}")]
    MissingWeight { name: String, path: PathBuf, available: Vec<String> },
    #[error("Embedding weight {0} must be 2-D, got shape {1:?}")]
    WeightShapeError(String, Vec<usize>),
    #[error("{path} declares hidden_dim {declared}, but the weights have {found} columns")]
    DimensionMismatch { path: PathBuf, declared: usize, found: usize },
    #[error("Token id {0} is out of range for a vocabulary of {1}")]
    TokenOutOfRange(u32, usize),
    #[error(transparent)]
    TokenizerError(#[from] TokenizerError),
    #[error(transparent)]
    OnnxGraphError(#[from] onnx_graph::Error),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ModelLayout {
    SentenceTransformers,
    Model2Vec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ModuleKind {
    StaticEmbedding,
    Normalize,
    Other,
}

impl ModuleKind {
    fn from_type_name(type_name: &str) -> Self {
        let short = type_name.rsplit('.').next().unwrap_or(type_name);
        match short {
            "StaticEmbedding" => ModuleKind::StaticEmbedding,
            "Normalize" => ModuleKind::Normalize,
            _ => ModuleKind::Other,
        }
    }
}

/// One entry of a sentence-transformers `modules.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct ModuleEntry {
    #[serde(default)]
    pub idx: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type")]
    pub module_type: String,
}

impl ModuleEntry {
    pub fn kind(&self) -> ModuleKind {
        ModuleKind::from_type_name(&self.module_type)
    }

    pub fn short_name(&self) -> &str {
        self.module_type.rsplit('.').next().unwrap_or(&self.module_type)
    }
}

/// The fields of a model2vec `config.json` this crate reads.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Model2VecConfig {
    #[serde(default)]
    pub normalize: Option<bool>,
    /// Column count the weight matrix must have, when given.
    #[serde(default)]
    pub hidden_dim: Option<usize>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ModelError> {
    let file = File::open(path).map_err(|e| ModelError::ReadError(path.to_path_buf(), e))?;
    serde_json::from_reader(file).map_err(|e| ModelError::ConfigParseError(path.to_path_buf(), e))
}

fn require_file(path: PathBuf) -> Result<PathBuf, ModelError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ModelError::MissingFile(path))
    }
}

/// Everything needed to open a model, resolved from its directory layout.
struct ModelFiles {
    layout: ModelLayout,
    modules: Vec<String>,
    weights_path: PathBuf,
    weight_name: &'static str,
    tokenizer_path: PathBuf,
    normalize: bool,
    declared_dim: Option<usize>,
}

fn resolve_sentence_transformers(root: &Path) -> Result<ModelFiles, ModelError> {
    let modules_path = root.join(MODULES_FILE);
    let mut modules: Vec<ModuleEntry> = read_json(&modules_path)?;
    modules.sort_by_key(|m| m.idx);
    let first = modules.first().ok_or_else(|| ModelError::NoModules(modules_path.clone()))?;
    if first.kind() != ModuleKind::StaticEmbedding {
        return Err(ModelError::UnsupportedModule(first.module_type.clone()));
    }

    let module_dir = root.join(&first.path);
    let tokenizer_path = {
        let in_module = module_dir.join(TOKENIZER_FILE);
        if in_module.is_file() { in_module } else { require_file(root.join(TOKENIZER_FILE))? }
    };
    let normalize = modules.iter().skip(1).any(|m| m.kind() == ModuleKind::Normalize);

    Ok(ModelFiles {
        layout: ModelLayout::SentenceTransformers,
        modules: modules.iter().map(|m| m.short_name().to_string()).collect(),
        weights_path: require_file(module_dir.join(WEIGHTS_FILE))?,
        weight_name: STATIC_EMBEDDING_WEIGHT,
        tokenizer_path,
        normalize,
        declared_dim: None,
    })
}

fn resolve_model2vec(root: &Path) -> Result<ModelFiles, ModelError> {
    let config_path = root.join(CONFIG_FILE);
    let config: Model2VecConfig = if config_path.is_file() {
        read_json(&config_path)?
    } else {
        Model2VecConfig::default()
    };
    let normalize = config.normalize.unwrap_or(false);

    let mut modules = vec![ModuleKind::StaticEmbedding.to_string()];
    if normalize {
        modules.push(ModuleKind::Normalize.to_string());
    }

    Ok(ModelFiles {
        layout: ModelLayout::Model2Vec,
        modules,
        weights_path: require_file(root.join(WEIGHTS_FILE))?,
        weight_name: MODEL2VEC_WEIGHT,
        tokenizer_path: require_file(root.join(TOKENIZER_FILE))?,
        normalize,
        declared_dim: config.hidden_dim,
    })
}

/// A static embedding model: a token-id lookup table, a tokenizer, and an
/// optional L2 normalization of the pooled vector.
pub struct StaticModel {
    root: PathBuf,
    layout: ModelLayout,
    modules: Vec<String>,
    weights: SafetensorsWeightManager,
    weight_name: &'static str,
    weight_dtype: DType,
    embeddings: Array2<f32>,
    tokenizer: tokenizers::Tokenizer,
    tokenizer_path: PathBuf,
    normalize: bool,
}

impl StaticModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::MissingPath(path.to_path_buf()));
        }
        let files = if path.join(MODULES_FILE).is_file() {
            resolve_sentence_transformers(path)?
        } else if path.join(WEIGHTS_FILE).is_file() {
            resolve_model2vec(path)?
        } else {
            return Err(ModelError::CannotIdentifyModel(path.to_path_buf()));
        };
        debug!("Resolved {} layout, weights at {}", files.layout, files.weights_path.display());

        let weights = SafetensorsWeightManager::open(&[files.weights_path.clone()])?;
        let available = weights.get_tensor_names();
        if !available.iter().any(|name| name == files.weight_name) {
            return Err(ModelError::MissingWeight {
                name: files.weight_name.to_string(),
                path: files.weights_path,
                available,
            });
        }
        let data = weights.get_tensor_data(files.weight_name)?;
        let weight_dtype = data.dtype();
        let shape = data.shape().resolve()?;
        let [vocab_size, embedding_dim] = shape[..] else {
            return Err(ModelError::WeightShapeError(files.weight_name.to_string(), shape));
        };
        if let Some(declared) = files.declared_dim.filter(|&d| d != embedding_dim) {
            return Err(ModelError::DimensionMismatch { path: path.join(CONFIG_FILE), declared, found: embedding_dim });
        }
        let embeddings = Array2::from_shape_vec((vocab_size, embedding_dim), data.value().to_f32_vec()?)?;

        let tokenizer = load_tokenizer(&files.tokenizer_path)?;
        info!(
            "Loaded {} model from {}: {} x {} ({}), normalize={}",
            files.layout, path.display(), vocab_size, embedding_dim, weight_dtype, files.normalize
        );

        Ok(Self {
            root: path.to_path_buf(),
            layout: files.layout,
            modules: files.modules,
            weights,
            weight_name: files.weight_name,
            weight_dtype,
            embeddings,
            tokenizer,
            tokenizer_path: files.tokenizer_path,
            normalize: files.normalize,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> ModelLayout {
        self.layout
    }

    /// Short module names in pipeline order, e.g. `["StaticEmbedding", "Normalize"]`.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn normalize(&self) -> bool {
        self.normalize
    }

    pub fn vocab_size(&self) -> usize {
        self.embeddings.nrows()
    }

    pub fn embedding_dim(&self) -> usize {
        self.embeddings.ncols()
    }

    /// The lookup table widened to f32, row index = token id.
    pub fn embeddings(&self) -> &Array2<f32> {
        &self.embeddings
    }

    /// Storage dtype of the weight in the source checkpoint.
    pub fn weight_dtype(&self) -> DType {
        self.weight_dtype
    }

    pub fn weight_name(&self) -> &str {
        self.weight_name
    }

    /// The weight as a graph initializer, read from the source file in its
    /// original dtype.
    pub fn weight_tensor(&self) -> Result<Arc<dyn Tensor>, ModelError> {
        Ok(self.weights.get_tensor(self.weight_name)?)
    }

    pub fn tokenizer(&self) -> &tokenizers::Tokenizer {
        &self.tokenizer
    }

    pub fn tokenizer_path(&self) -> &Path {
        &self.tokenizer_path
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, ModelError> {
        Ok(self.tokenizer.encode(text)?)
    }

    pub fn encode(&self, text: &str) -> Result<Array1<f32>, ModelError> {
        let ids = self.tokenize(text)?;
        self.encode_ids(&ids)
    }

    /// Mean of the rows for `ids`, normalized if the model says so. An empty
    /// id list pools to the zero vector.
    pub fn encode_ids(&self, ids: &[u32]) -> Result<Array1<f32>, ModelError> {
        let mut pooled = Array1::<f32>::zeros(self.embedding_dim());
        for &id in ids {
            pooled += &self.row(id)?;
        }
        if !ids.is_empty() {
            pooled /= ids.len() as f32;
        }
        if self.normalize {
            l2_normalize(&mut pooled);
        }
        Ok(pooled)
    }

    pub fn row(&self, id: u32) -> Result<ArrayView1<'_, f32>, ModelError> {
        if id as usize >= self.vocab_size() {
            return Err(ModelError::TokenOutOfRange(id, self.vocab_size()));
        }
        Ok(self.embeddings.row(id as usize))
    }
}

pub fn l2_normalize(vector: &mut Array1<f32>) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    *vector /= norm.max(NORMALIZE_EPSILON);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_kind_uses_class_name() {
        assert_eq!(ModuleKind::from_type_name("sentence_transformers.models.StaticEmbedding"), ModuleKind::StaticEmbedding);
        assert_eq!(ModuleKind::from_type_name("sentence_transformers.models.Normalize"), ModuleKind::Normalize);
        assert_eq!(ModuleKind::from_type_name("sentence_transformers.models.Dense"), ModuleKind::Other);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = Array1::<f32>::zeros(4);
        l2_normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn normalize_gives_unit_length() {
        let mut v = Array1::from(vec![3.0f32, 4.0]);
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn missing_path_is_named() {
        let err = StaticModel::load(Path::new("/definitely/not/a/model")).err().unwrap();
        assert!(err.to_string().contains("/definitely/not/a/model"));
    }
}
