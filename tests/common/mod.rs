#![allow(dead_code)]

use std::path::Path;

use safetensors::{Dtype, tensor::TensorView};
use serde_json::json;
use tempfile::TempDir;

pub const VOCAB: &[&str] = &[
    "[UNK]", "this", "is", "a", "test", "sentence", "sentence.", "for", "embedding.", "hello", "world",
];
pub const DIM: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Storage {
    F32,
    F16,
}

/// Deterministic, non-degenerate weights: every row differs and has mixed signs.
pub fn weights(rows: usize, dim: usize) -> Vec<f32> {
    (0..rows * dim)
        .map(|i| {
            let (row, col) = (i / dim, i % dim);
            ((row as f32 + 1.0) * 0.25 - col as f32 * 0.125) * if (row + col) % 2 == 0 { 1.0 } else { -0.5 }
        })
        .collect()
}

pub fn write_tokenizer(path: &Path) {
    let vocab: serde_json::Map<String, serde_json::Value> =
        VOCAB.iter().enumerate().map(|(i, t)| (t.to_string(), json!(i))).collect();
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "WhitespaceSplit"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    });
    std::fs::write(path, serde_json::to_string_pretty(&tokenizer).unwrap()).unwrap();
}

pub fn write_safetensors(path: &Path, tensor_name: &str, rows: usize, dim: usize, storage: Storage) {
    let values = weights(rows, dim);
    let (dtype, bytes): (Dtype, Vec<u8>) = match storage {
        Storage::F32 => (Dtype::F32, values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        Storage::F16 => (Dtype::F16, values.iter().flat_map(|v| half::f16::from_f32(*v).to_le_bytes()).collect()),
    };
    let view = TensorView::new(dtype, vec![rows, dim], &bytes).unwrap();
    let serialized = safetensors::serialize([(tensor_name, &view)], &None).unwrap();
    std::fs::write(path, serialized).unwrap();
}

/// A sentence-transformers style model whose tokenizer lives only in the
/// StaticEmbedding module directory.
pub fn sentence_transformers_model(normalize: bool) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let module_dir = dir.path().join("0_StaticEmbedding");
    std::fs::create_dir_all(&module_dir).unwrap();
    write_safetensors(&module_dir.join("model.safetensors"), "embedding.weight", VOCAB.len(), DIM, Storage::F32);
    write_tokenizer(&module_dir.join("tokenizer.json"));

    let mut modules = vec![json!({
        "idx": 0, "name": "0", "path": "0_StaticEmbedding",
        "type": "sentence_transformers.models.StaticEmbedding"
    })];
    if normalize {
        modules.push(json!({
            "idx": 1, "name": "1", "path": "1_Normalize",
            "type": "sentence_transformers.models.Normalize"
        }));
    }
    std::fs::write(dir.path().join("modules.json"), serde_json::to_string_pretty(&modules).unwrap()).unwrap();
    dir
}

/// A native model2vec model with everything at the root.
pub fn model2vec_model(normalize: bool, storage: Storage) -> TempDir {
    model2vec_model_with_rows(normalize, storage, VOCAB.len())
}

pub fn model2vec_model_with_rows(normalize: bool, storage: Storage, rows: usize) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_safetensors(&dir.path().join("model.safetensors"), "embeddings", rows, DIM, storage);
    write_tokenizer(&dir.path().join("tokenizer.json"));
    let config = json!({"model_type": "model2vec", "normalize": normalize, "hidden_dim": DIM});
    std::fs::write(dir.path().join("config.json"), serde_json::to_string_pretty(&config).unwrap()).unwrap();
    dir
}

/// Row `id` of the fixture weights, as the model will see it.
pub fn row(id: usize, storage: Storage) -> Vec<f32> {
    weights(VOCAB.len(), DIM)[id * DIM..(id + 1) * DIM]
        .iter()
        .map(|v| match storage {
            Storage::F32 => *v,
            Storage::F16 => half::f16::from_f32(*v).to_f32(),
        })
        .collect()
}

pub fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tolerance, "element {i}: {x} vs {y}");
    }
}
