use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};

use crate::checkpoint::SyncFile;
use crate::evaluate::{evaluate, Evaluation, ModelPredictor};
use crate::mnist::{load_csv, ImageDataset};
use crate::model::Classifier;
use crate::topology::{FeatureShape, FASHION_MNIST_TOPOLOGY};
use crate::trainer::{train, TrainingConfig, TrainingReport};
use crate::NUM_CLASSES;

/// Everything a run needs: where the data is, where results go, how to train.
#[derive(Config)]
pub struct HarnessConfig {
    pub train_path: String,
    pub test_path: String,
    /// Base path of the persisted model; the recorder adds the `.mpk` extension.
    pub model_path: String,
    /// Base path of the periodic sync snapshots; `None` disables them.
    pub sync_path: Option<String>,
    pub training: TrainingConfig,
}

impl HarnessConfig {
    pub fn fashion_mnist() -> Self {
        Self::new(
            "fashion-mnist_train.csv".to_string(),
            "fashion-mnist_test.csv".to_string(),
            "fashion_mnist_network".to_string(),
            TrainingConfig::fashion_mnist(),
        )
        .with_sync_path(Some("fashion_mnist_sync".to_string()))
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub evaluation: Evaluation,
    pub training: TrainingReport,
    pub model_file: PathBuf,
}

/// Load, train, evaluate, report the accuracy on `out`, then persist the model.
pub fn run<B: AutodiffBackend>(
    config: &HarnessConfig,
    device: &B::Device,
    out: &mut impl Write,
) -> Result<RunReport> {
    let train_set = load_dataset(&config.train_path, "training")?;
    let test_set = load_dataset(&config.test_path, "test")?;
    ensure!(!train_set.is_empty(), "training set '{}' has no rows", config.train_path);
    ensure!(!test_set.is_empty(), "test set '{}' has no rows", config.test_path);

    let model = new_model::<B>(device)?;
    let mut sync = config.sync_path.as_ref().map(|path| {
        SyncFile::new(path, Duration::from_secs(config.training.sync_interval_secs))
    });

    tracing::info!("Training on {} examples", train_set.len());
    let (model, training) = train(&config.training, model, train_set, sync.as_mut(), device)?;

    let now = Instant::now();
    let model = model.valid();
    let predictor = ModelPredictor::new(&model, device.clone());
    let evaluation = evaluate(&predictor, &test_set, config.training.batch_size);
    tracing::info!(
        "Evaluated {} test examples, {} correct [{}ms]",
        evaluation.total,
        evaluation.correct,
        now.elapsed().as_millis()
    );

    writeln!(out, "Accuracy: {}%", evaluation.accuracy())?;
    out.flush()?;

    let model_file = model.save(&config.model_path)?;
    tracing::info!("Saved model to {}", model_file.display());

    Ok(RunReport {
        evaluation,
        training,
        model_file,
    })
}

/// Rebuild the fixed network and fill it with parameters persisted by [`run`].
pub fn load_trained_model<B: Backend>(model_path: impl AsRef<Path>, device: &B::Device) -> Result<Classifier<B>> {
    new_model::<B>(device)?.load(model_path, device)
}

fn new_model<B: Backend>(device: &B::Device) -> Result<Classifier<B>> {
    let model = Classifier::new(&FASHION_MNIST_TOPOLOGY, FeatureShape::image(), NUM_CLASSES, device)?;
    Ok(model)
}

fn load_dataset(path: &str, role: &str) -> Result<ImageDataset> {
    let now = Instant::now();
    let dataset = load_csv(path).with_context(|| format!("cannot load {role} data"))?;
    tracing::info!(
        "Loaded {} {} examples from {} [{}ms]",
        dataset.len(),
        role,
        path,
        now.elapsed().as_millis()
    );
    Ok(dataset)
}
