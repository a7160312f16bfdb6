use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("Failed to load tokenizer from {0}: {1}")]
    LoadError(PathBuf, tokenizers::Error),
    #[error(transparent)]
    TokenizersError(#[from] tokenizers::Error),
}

pub trait Tokenizer {
    /// Token ids for `text`, without special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError>;
    /// Token string to id, added tokens included.
    fn vocab(&self) -> HashMap<String, u32>;
}

impl Tokenizer for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        Ok((**self).encode(text, false)?.get_ids().to_vec())
    }

    fn vocab(&self) -> HashMap<String, u32> {
        self.get_vocab(true)
    }
}

pub fn load_tokenizer(path: &Path) -> Result<tokenizers::Tokenizer, TokenizerError> {
    tokenizers::Tokenizer::from_file(path).map_err(|e| TokenizerError::LoadError(path.to_path_buf(), e))
}
