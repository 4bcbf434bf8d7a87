use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{backend::Autodiff, config::Config};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fashion_cnn::harness::{self, HarnessConfig};

#[cfg(not(feature = "wgpu"))]
type Backend = Autodiff<burn::backend::NdArray>;
#[cfg(feature = "wgpu")]
type Backend = Autodiff<burn::backend::Wgpu>;

/// Train a small CNN on Fashion-MNIST and report its test accuracy.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON run configuration; the Fashion-MNIST defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Progress goes to stderr so stdout only carries the accuracy line
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("cannot load config '{}'", path.display()))?,
        None => HarnessConfig::fashion_mnist(),
    };

    let device = Default::default();
    let report = harness::run::<Backend>(&config, &device, &mut std::io::stdout().lock())?;
    tracing::info!(
        "Done: {} of {} correct, model in {}",
        report.evaluation.correct,
        report.evaluation.total,
        report.model_file.display()
    );
    Ok(())
}
