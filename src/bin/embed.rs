use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use model2vec_export::embed::{generate_embedding, EmbedResponse, DEFAULT_MODEL_PATH, MODEL_PATH_ENV};
use model2vec_export::StaticModel;

/// Print the embedding of one text as a JSON line.
///
/// The text is embedded verbatim, even when it looks like a flag.
#[derive(Parser, Debug)]
#[command(name = "embed", disable_help_flag = true, disable_version_flag = true)]
struct Args {
    /// Text to embed
    #[arg(allow_hyphen_values = true)]
    text: String,

    /// Model directory
    #[arg(long, env = MODEL_PATH_ENV, default_value = DEFAULT_MODEL_PATH)]
    model: PathBuf,
}

fn emit(response: &EmbedResponse) -> ExitCode {
    println!("{}", response.to_json());
    if response.is_error() { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn main() -> ExitCode {
    let Ok(args) = Args::try_parse() else {
        return emit(&EmbedResponse::usage());
    };
    model2vec_export::init_logging("warn");

    let model = match StaticModel::load(&args.model) {
        Ok(model) => model,
        Err(err) => return emit(&EmbedResponse::load_failed(err)),
    };
    emit(&generate_embedding(&model, &args.text))
}
