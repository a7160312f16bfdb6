mod common;

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use common::{assert_close, Storage, DIM, VOCAB};
use model2vec_export::convert::{convert_model_to_onnx, export_model, trace_check, ConvertError, ConvertOptions, INPUT_NAME, METADATA_KEY, ONNX_DATA_FILE, ONNX_FILE, OUTPUT_NAME};
use model2vec_export::verify::{self, Value};
use model2vec_export::StaticModel;
use ndarray::{ArrayD, IxDyn};
use onnx_graph::onnx::{self, tensor_proto::DataLocation};

fn op_types(model: &onnx::ModelProto) -> Vec<String> {
    model.graph.as_ref().unwrap().node.iter().map(|n| n.op_type.clone()).collect()
}

fn run_exported(onnx_path: &Path, ids: &[u32]) -> Vec<f32> {
    let proto = verify::load_model(onnx_path).unwrap();
    let ids = ArrayD::from_shape_vec(IxDyn(&[1, ids.len()]), ids.iter().map(|&i| i as i64).collect()).unwrap();
    let inputs = HashMap::from([(INPUT_NAME.to_string(), Value::from(ids))]);
    let mut outputs = verify::evaluate(&proto, onnx_path.parent().unwrap(), inputs).unwrap();
    let output = outputs.remove(OUTPUT_NAME).unwrap().into_f32().unwrap();
    assert_eq!(output.shape(), &[1, DIM]);
    output.iter().copied().collect()
}

#[test]
fn normalizing_model_exports_full_pipeline() {
    let model_dir = common::sentence_transformers_model(true);
    let out = tempfile::tempdir().unwrap();
    let report = convert_model_to_onnx(model_dir.path(), out.path(), &ConvertOptions::default()).unwrap();

    assert_eq!(report.onnx_path, out.path().join(ONNX_FILE));
    assert!(report.data_path.is_none());
    let proto = verify::load_model(&report.onnx_path).unwrap();
    assert_eq!(op_types(&proto), vec!["Gather", "ReduceMean", "ReduceL2", "Clip", "Div"]);
    assert_eq!(proto.opset_import[0].version, 11);
    assert_eq!(proto.ir_version, 6);

    let model = StaticModel::load(model_dir.path()).unwrap();
    let ids = model.tokenize("hello world this is a test").unwrap();
    let expected = model.encode_ids(&ids).unwrap();
    assert_close(&run_exported(&report.onnx_path, &ids), expected.as_slice().unwrap(), 1e-6);

    let smoke = report.smoke_test;
    assert_eq!(smoke.model_shape, vec![1, DIM]);
    assert_eq!(smoke.model_head.len(), 5);
    assert!(smoke.max_abs_diff.unwrap() < 1e-6);
}

#[test]
fn model_without_normalize_stage_still_converts() {
    let model_dir = common::sentence_transformers_model(false);
    let out = tempfile::tempdir().unwrap();
    let report = convert_model_to_onnx(model_dir.path(), out.path(), &ConvertOptions::default()).unwrap();

    let proto = verify::load_model(&report.onnx_path).unwrap();
    assert_eq!(op_types(&proto), vec!["Gather", "ReduceMean"]);

    let graph = proto.graph.as_ref().unwrap();
    assert_eq!(graph.input.len(), 1);
    assert_eq!(graph.input[0].name, INPUT_NAME);
    assert_eq!(graph.output[0].name, OUTPUT_NAME);

    let model = StaticModel::load(model_dir.path()).unwrap();
    let expected = model.encode_ids(&[1, 5, 5, 9]).unwrap();
    assert_close(&run_exported(&report.onnx_path, &[1, 5, 5, 9]), expected.as_slice().unwrap(), 1e-6);
}

#[test]
fn side_files_are_copied() {
    let model_dir = common::sentence_transformers_model(true);
    let out = tempfile::tempdir().unwrap();
    convert_model_to_onnx(model_dir.path(), out.path(), &ConvertOptions::default()).unwrap();

    // Tokenizer only exists in the module directory for this layout
    assert!(out.path().join("tokenizer.json").is_file());
    assert!(out.path().join("modules.json").is_file());
    assert!(!out.path().join("config.json").exists());
}

#[test]
fn external_data_with_half_weights() {
    let model_dir = common::model2vec_model(true, Storage::F16);
    let out = tempfile::tempdir().unwrap();
    let options = ConvertOptions { external_data: true, ..Default::default() };
    let report = convert_model_to_onnx(model_dir.path(), out.path(), &options).unwrap();

    let data_path = report.data_path.clone().unwrap();
    assert_eq!(data_path, out.path().join(ONNX_DATA_FILE));
    assert_eq!(std::fs::metadata(&data_path).unwrap().len(), (VOCAB.len() * DIM * 2) as u64);

    let proto = verify::load_model(&report.onnx_path).unwrap();
    assert_eq!(op_types(&proto), vec!["Gather", "Cast", "ReduceMean", "ReduceL2", "Clip", "Div"]);
    // The weight shares its checkpoint name with the graph output
    let weight = proto.graph.as_ref().unwrap().initializer.iter().find(|t| t.name == "embeddings_1").unwrap();
    assert_eq!(weight.data_location, DataLocation::External as i32);
    assert!(weight.raw_data.is_empty());

    let model = StaticModel::load(model_dir.path()).unwrap();
    let expected = model.encode_ids(&[2, 4, 8]).unwrap();
    assert_close(&run_exported(&report.onnx_path, &[2, 4, 8]), expected.as_slice().unwrap(), 1e-6);
}

#[test]
fn metadata_describes_the_model() {
    let model_dir = common::model2vec_model(false, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    let report = convert_model_to_onnx(model_dir.path(), out.path(), &ConvertOptions::default()).unwrap();

    let proto = verify::load_model(&report.onnx_path).unwrap();
    let entry = proto.metadata_props.iter().find(|p| p.key == METADATA_KEY).unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&entry.value).unwrap();
    assert_eq!(metadata["vocab_size"], VOCAB.len());
    assert_eq!(metadata["embedding_dim"], DIM);
    assert_eq!(metadata["normalize"], false);
    assert_eq!(metadata["modules"], serde_json::json!(["StaticEmbedding"]));
}

#[test]
fn seed_and_sequence_length_are_configurable() {
    let model_dir = common::model2vec_model(false, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    let options = ConvertOptions { trace_sequence_length: 3, seed: 7, ..Default::default() };
    assert!(convert_model_to_onnx(model_dir.path(), out.path(), &options).is_ok());
}

#[test]
fn missing_input_path_fails_with_path_in_message() {
    let out = tempfile::tempdir().unwrap();
    let missing = out.path().join("no-such-model");
    let err = convert_model_to_onnx(&missing, &out.path().join("onnx"), &ConvertOptions::default()).unwrap_err();
    assert!(err.to_string().contains(&missing.display().to_string()));
}

#[test]
fn binary_exits_with_failure_on_missing_input() {
    let out = tempfile::tempdir().unwrap();
    let missing = out.path().join("no-such-model");
    let result = Command::new(env!("CARGO_BIN_EXE_convert_to_onnx"))
        .arg(&missing)
        .arg(out.path().join("onnx"))
        .output()
        .unwrap();
    assert_eq!(result.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains(&missing.display().to_string()));
}

#[test]
fn binary_rejects_wrong_argument_count() {
    let result = Command::new(env!("CARGO_BIN_EXE_convert_to_onnx")).arg("only-one").output().unwrap();
    assert_eq!(result.status.code(), Some(1));
}

#[test]
fn empty_trace_sequence_is_rejected() {
    let model_dir = common::model2vec_model(false, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    let options = ConvertOptions { trace_sequence_length: 0, ..Default::default() };
    let err = convert_model_to_onnx(model_dir.path(), out.path(), &options).unwrap_err();
    assert!(matches!(err, ConvertError::InvalidOptions(_)));
    assert!(!out.path().join(ONNX_FILE).exists());
}

#[test]
fn trace_detects_graph_of_the_wrong_width() {
    let wide_dir = common::model2vec_model(false, Storage::F32);
    let narrow_dir = common::sentence_transformers_model(false);
    let narrow_weights = narrow_dir.path().join("0_StaticEmbedding").join("model.safetensors");
    common::write_safetensors(&narrow_weights, "embedding.weight", VOCAB.len(), DIM - 2, Storage::F32);

    let wide = StaticModel::load(wide_dir.path()).unwrap();
    let narrow = StaticModel::load(narrow_dir.path()).unwrap();
    let options = ConvertOptions::default();
    let out = tempfile::tempdir().unwrap();
    let proto = export_model(&narrow, &options, out.path()).unwrap();

    assert!(trace_check(&proto, out.path(), &narrow, &options).is_ok());
    match trace_check(&proto, out.path(), &wide, &options).unwrap_err() {
        ConvertError::TraceShapeMismatch { expected, found } => {
            assert_eq!(expected, vec![1, DIM]);
            assert_eq!(found, vec![1, DIM - 2]);
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn binary_converts_a_valid_model() {
    let model_dir = common::model2vec_model(true, Storage::F32);
    let out = tempfile::tempdir().unwrap();
    let onnx_dir = out.path().join("onnx");
    let result = Command::new(env!("CARGO_BIN_EXE_convert_to_onnx"))
        .arg(model_dir.path())
        .arg(&onnx_dir)
        .args(["--sequence-length", "16", "--seed", "3"])
        .output()
        .unwrap();
    assert_eq!(result.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("✅ Conversion completed successfully!"));
    assert!(!stdout.contains("❌"));
    assert!(onnx_dir.join(ONNX_FILE).is_file());
    assert!(onnx_dir.join("tokenizer.json").is_file());
    assert!(onnx_dir.join("config.json").is_file());
}
