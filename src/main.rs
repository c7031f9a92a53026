use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use source::ParameterSource;
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;

mod error;
mod export;
mod source;
mod tensor;

/// Dump every parameter of a model checkpoint to `<output-dir>/<name>.bin`.
///
/// Files hold the raw row-major element bytes only; shape and dtype are not
/// recorded.
#[derive(structopt::StructOpt)]
struct Opt {
    /// Path to a safetensors checkpoint.
    checkpoint: PathBuf,

    /// Directory to write the .bin files to. Created if missing.
    #[structopt(short, long, default_value = export::DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Only export parameters under this submodule (e.g. bn1), with the prefix removed.
    #[structopt(short, long)]
    submodule: Option<String>,

    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    #[structopt(short = "-p", long)]
    show_progress: bool,
}

fn run(
    checkpoint_path: &Path,
    output_dir: &Path,
    submodule: Option<String>,
    show_progress: bool,
) -> Result<export::Summary> {
    let checkpoint = source::Checkpoint::open(checkpoint_path)
        .with_context(|| format!("failed opening checkpoint {:?}", checkpoint_path))?;
    info!(
        message = "loaded checkpoint",
        path = %checkpoint.path().display(),
        tensors = checkpoint.len()
    );

    let parameters = match submodule {
        Some(prefix) => source::Submodule::new(checkpoint, prefix).parameters(),
        None => checkpoint.parameters(),
    }
    .context("failed loading parameters")?;

    let progress = if show_progress {
        Some(
            ProgressBar::new(parameters.len() as u64).with_style(
                ProgressStyle::default_bar()
                    .template("{prefix:.bold.dim} {bar:40} {pos}/{len} {wide_msg}"),
            ),
        )
    } else {
        None
    };

    let summary = match progress.as_ref() {
        Some(progress) => export::export_with_progress(&parameters, output_dir, Some(progress)),
        None => export::export(&parameters, output_dir),
    }
    .with_context(|| format!("failed exporting parameters to {:?}", output_dir))?;

    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    Ok(summary)
}

fn main() -> Result<()> {
    let Opt {
        checkpoint,
        output_dir,
        submodule,
        log_level,
        show_progress,
    } = Opt::from_args();

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(log_level),
    )?;

    let summary = run(&checkpoint, &output_dir, submodule, show_progress)?;
    info!(
        message = "exported parameters",
        files = summary.files,
        bytes = summary.bytes,
        output_dir = %output_dir.display()
    );

    Ok(())
}
