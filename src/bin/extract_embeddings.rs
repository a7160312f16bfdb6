use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use model2vec_export::extract::{create_binary_export, extract_model_weights, EmbeddingsMetadata};

/// Extract the embedding matrix and vocabulary of a model2vec model.
#[derive(Parser, Debug)]
#[command(name = "extract_embeddings", version)]
struct Args {
    /// Model directory (sentence-transformers or native model2vec layout)
    input_model_path: PathBuf,

    /// Directory to write the extracted files into
    output_path: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<EmbeddingsMetadata> {
    extract_model_weights(&args.input_model_path, &args.output_path)
        .with_context(|| format!("Extracting {}", args.input_model_path.display()))?;

    println!("\nCreating binary data files...");
    let metadata = create_binary_export(&args.output_path)
        .with_context(|| format!("Writing binary export to {}", args.output_path.display()))?;
    Ok(metadata)
}

fn main() -> ExitCode {
    let args: Args = model2vec_export::parse_args();
    model2vec_export::init_logging("info");

    println!("Model2vec Embedding Extractor");
    println!("{}", "=".repeat(40));

    match run(&args) {
        Ok(metadata) => {
            println!("\n✅ Extraction completed successfully!");
            println!("Extracted data available at: {}", args.output_path.display());
            println!("{} x {} float32 ({} bytes)", metadata.vocab_size, metadata.embedding_dim, metadata.expected_len());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:?}");
            println!("\n❌ Extraction failed!");
            ExitCode::FAILURE
        }
    }
}
