use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::model::StaticModel;

pub const DEFAULT_MODEL_PATH: &str = "/tmp/codeforge-model-1695886931/minilm-distilled";
pub const MODEL_PATH_ENV: &str = "MODEL2VEC_MODEL_PATH";

/// The single JSON line the embedder prints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbedResponse {
    Embedding { embedding: Vec<f32> },
    Error { error: String },
}

impl EmbedResponse {
    pub fn error(message: impl Into<String>) -> Self {
        EmbedResponse::Error { error: message.into() }
    }

    pub fn load_failed(err: impl Display) -> Self {
        Self::error(format!("Failed to load model: {err}"))
    }

    pub fn usage() -> Self {
        Self::error("Usage: embed <text>")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EmbedResponse::Error { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

pub fn generate_embedding(model: &StaticModel, text: &str) -> EmbedResponse {
    match model.encode(text) {
        Ok(embedding) => EmbedResponse::Embedding { embedding: embedding.to_vec() },
        Err(err) => EmbedResponse::error(format!("Failed to generate embedding: {err}")),
    }
}
