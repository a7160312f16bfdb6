mod common;

use std::collections::HashMap;
use std::process::Command;

use common::{Storage, DIM, VOCAB};
use model2vec_export::extract::{
    create_binary_export, extract_model_weights, EmbeddingsMetadata, ExtractError, ModelConfig, BINARY_FILE,
    BINARY_METADATA_FILE, MODEL_CONFIG_FILE, VOCAB_FILE, WEIGHTS_NPY_FILE,
};
use model2vec_export::{npy, StaticModel};

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> T {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn extraction_writes_consistent_artifacts() {
    let model_dir = common::sentence_transformers_model(true);
    let out = tempfile::tempdir().unwrap();
    let report = extract_model_weights(model_dir.path(), out.path()).unwrap();
    let metadata = create_binary_export(out.path()).unwrap();

    for file in [WEIGHTS_NPY_FILE, VOCAB_FILE, MODEL_CONFIG_FILE, BINARY_FILE, BINARY_METADATA_FILE, "tokenizer.json"] {
        assert!(out.path().join(file).is_file(), "{file} missing");
    }

    let written: EmbeddingsMetadata = read_json(&out.path().join(BINARY_METADATA_FILE));
    assert_eq!(written, metadata);
    assert_eq!((written.data_type.as_str(), written.byte_order.as_str()), ("float32", "little"));
    let bin_len = std::fs::metadata(out.path().join(BINARY_FILE)).unwrap().len();
    assert_eq!(bin_len, (written.vocab_size * written.embedding_dim * 4) as u64);

    let vocab: HashMap<String, u32> = read_json(&out.path().join(VOCAB_FILE));
    assert_eq!(vocab.len(), written.vocab_size);

    let config: ModelConfig = read_json(&out.path().join(MODEL_CONFIG_FILE));
    assert_eq!(config, report.config);
    assert_eq!(config, ModelConfig {
        vocab_size: VOCAB.len(),
        embedding_dim: DIM,
        model_type: "model2vec_static".to_string(),
        normalize: true,
    });
}

#[test]
fn npy_rows_match_model_rows() {
    let model_dir = common::model2vec_model(false, Storage::F16);
    let out = tempfile::tempdir().unwrap();
    extract_model_weights(model_dir.path(), out.path()).unwrap();

    let model = StaticModel::load(model_dir.path()).unwrap();
    let weights = npy::read_f32_array(&out.path().join(WEIGHTS_NPY_FILE)).unwrap();
    assert_eq!(weights.dim(), (VOCAB.len(), DIM));
    for t in 0..VOCAB.len() {
        assert_eq!(weights.row(t), model.embeddings().row(t), "row {t}");
        assert_eq!(weights.row(t).to_vec(), common::row(t, Storage::F16));
    }
}

#[test]
fn binary_rows_match_npy_rows() {
    let model_dir = common::model2vec_model(true, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    extract_model_weights(model_dir.path(), out.path()).unwrap();
    create_binary_export(out.path()).unwrap();

    let bytes = std::fs::read(out.path().join(BINARY_FILE)).unwrap();
    let values: Vec<f32> = bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    let weights = npy::read_f32_array(&out.path().join(WEIGHTS_NPY_FILE)).unwrap();
    assert_eq!(values, weights.iter().copied().collect::<Vec<_>>());
}

#[test]
fn vocab_json_is_pretty_and_ordered_by_id() {
    let model_dir = common::model2vec_model(false, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    extract_model_weights(model_dir.path(), out.path()).unwrap();

    let text = std::fs::read_to_string(out.path().join(VOCAB_FILE)).unwrap();
    assert!(text.starts_with("{\n  \"[UNK]\": 0,\n  \"this\": 1,"));
    let positions: Vec<usize> = VOCAB.iter().map(|t| text.find(&format!("\"{t}\"")).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn consistency_check_reports_lookups() {
    let model_dir = common::model2vec_model(false, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    let report = extract_model_weights(model_dir.path(), out.path()).unwrap();

    let check = report.check;
    assert_eq!(check.loaded_shape, (VOCAB.len(), DIM));
    assert_eq!(check.vocab_size, VOCAB.len());
    assert_eq!(check.token_ids, vec![1, 2, 3, 4, 6]);
    assert_eq!(check.token_rows.dim(), (5, DIM));
    assert_eq!(check.token_rows.row(0).to_vec(), common::row(1, Storage::F32));
    assert_eq!(check.model_embedding.len(), DIM);
}

#[test]
fn side_files_are_copied() {
    let model_dir = common::model2vec_model(false, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    let report = extract_model_weights(model_dir.path(), out.path()).unwrap();
    assert!(out.path().join("config.json").is_file());
    assert!(out.path().join("tokenizer.json").is_file());
    assert_eq!(report.copied_files.len(), 2);
}

#[test]
fn vocab_and_matrix_must_agree() {
    let model_dir = common::model2vec_model_with_rows(false, Storage::F32, VOCAB.len() + 3);
    let out = tempfile::tempdir().unwrap();
    let err = extract_model_weights(model_dir.path(), out.path()).unwrap_err();
    assert!(matches!(err, ExtractError::VocabSizeMismatch { vocab, rows } if vocab == VOCAB.len() && rows == VOCAB.len() + 3));
}

#[test]
fn binary_exits_with_failure_on_missing_input() {
    let out = tempfile::tempdir().unwrap();
    let missing = out.path().join("missing-model");
    let result = Command::new(env!("CARGO_BIN_EXE_extract_embeddings"))
        .arg(&missing)
        .arg(out.path().join("extracted"))
        .output()
        .unwrap();
    assert_eq!(result.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&result.stderr).contains(&missing.display().to_string()));
}

#[test]
fn binary_produces_all_files() {
    let model_dir = common::sentence_transformers_model(false);
    let out = tempfile::tempdir().unwrap();
    let result = Command::new(env!("CARGO_BIN_EXE_extract_embeddings"))
        .arg(model_dir.path())
        .arg(out.path())
        .output()
        .unwrap();
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    assert!(String::from_utf8_lossy(&result.stdout).contains("Extraction completed successfully"));
    assert!(out.path().join(BINARY_FILE).is_file());
}
