use std::path::{Path, PathBuf};

use log::{info, warn};

pub mod tokenizer;
pub mod model;
pub mod npy;
pub mod verify;
pub mod convert;
pub mod extract;
pub mod embed;

pub use model::StaticModel;

/// Sets up `env_logger` on stderr, with `default_filter` used unless
/// `RUST_LOG` says otherwise.
pub fn init_logging(default_filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .try_init();
}

/// Parses command-line arguments. Help and version exit 0, usage errors exit 1.
pub fn parse_args<T: clap::Parser>() -> T {
    T::try_parse().unwrap_or_else(|err| {
        let code = if err.use_stderr() { 1 } else { 0 };
        let _ = err.print();
        std::process::exit(code)
    })
}

/// Copies each named file from `source_dir` into `output_dir` if it exists
/// there. Returns the destinations actually written.
pub fn copy_side_files(source_dir: &Path, output_dir: &Path, names: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let mut copied = vec![];
    for name in names {
        let source = source_dir.join(name);
        if !source.is_file() {
            continue;
        }
        let destination = output_dir.join(name);
        std::fs::copy(&source, &destination)?;
        info!("Copied {name}");
        copied.push(destination);
    }
    Ok(copied)
}

/// Like [`copy_side_files`] for a single file, trying each source in order.
pub fn copy_first_existing(sources: &[PathBuf], destination: &Path) -> std::io::Result<Option<PathBuf>> {
    for source in sources {
        if source.is_file() {
            std::fs::copy(source, destination)?;
            info!("Copied {}", source.display());
            return Ok(Some(destination.to_path_buf()));
        }
    }
    warn!("None of {} candidate files exist for {}", sources.len(), destination.display());
    Ok(None)
}
