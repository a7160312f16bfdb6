use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use model2vec_export::convert::{convert_model_to_onnx, ConversionReport, ConvertOptions};

/// Convert a model2vec static embedding model to ONNX.
#[derive(Parser, Debug)]
#[command(name = "convert_to_onnx", version)]
struct Args {
    /// Model directory (sentence-transformers or native model2vec layout)
    input_model_path: PathBuf,

    /// Directory to write model.onnx and the copied side files into
    output_path: PathBuf,

    /// Store weights in model.onnx.data next to the graph
    #[arg(long)]
    external_data: bool,

    /// Sequence length of the synthetic trace input
    #[arg(long, default_value = "128")]
    sequence_length: usize,

    /// Seed for the synthetic trace input
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn run(args: &Args) -> anyhow::Result<ConversionReport> {
    let options = ConvertOptions {
        external_data: args.external_data,
        trace_sequence_length: args.sequence_length,
        seed: args.seed,
        ..Default::default()
    };
    convert_model_to_onnx(&args.input_model_path, &args.output_path, &options)
        .with_context(|| format!("Converting {} to ONNX", args.input_model_path.display()))
}

fn main() -> ExitCode {
    let args: Args = model2vec_export::parse_args();
    model2vec_export::init_logging("info");

    println!("Model2vec to ONNX Converter");
    println!("{}", "=".repeat(40));

    match run(&args) {
        Ok(report) => {
            println!("\n✅ Conversion completed successfully!");
            println!("ONNX model available at: {}", args.output_path.display());
            if let Some(diff) = report.smoke_test.max_abs_diff {
                println!("Graph vs. model max abs difference: {diff:e}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:?}");
            println!("\n❌ Conversion failed!");
            ExitCode::FAILURE
        }
    }
}
