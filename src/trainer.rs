use std::time::Instant;

use anyhow::Result;
use burn::{
    data::dataloader::DataLoaderBuilder,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};

use crate::checkpoint::SyncFile;
use crate::early_stopping::ProgressTracker;
use crate::mnist::{ImageBatcher, ImageDataset};
use crate::model::Classifier;

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: SgdConfig,
    #[config(default = 0.001)]
    pub learning_rate: f64,
    #[config(default = 128)]
    pub batch_size: usize,
    /// Consecutive batches without a measurable loss decrease before training halts.
    #[config(default = 350)]
    pub iterations_without_progress: usize,
    #[config(default = 10000)]
    pub max_epochs: usize,
    /// Hard cap on optimizer steps, mostly for short test runs.
    pub max_iterations: Option<usize>,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1)]
    pub num_workers: usize,
    /// Wall-clock seconds between two sync snapshots.
    #[config(default = 100)]
    pub sync_interval_secs: u64,
    #[config(default = 50)]
    pub log_interval: usize,
}

impl TrainingConfig {
    /// SGD with momentum 0.9 and weight decay 5e-4, the solver the Fashion-MNIST run uses.
    pub fn fashion_mnist() -> Self {
        Self::new(
            SgdConfig::new()
                .with_momentum(Some(MomentumConfig::new().with_dampening(0.0)))
                .with_weight_decay(Some(WeightDecayConfig::new(5e-4))),
        )
    }
}

/// Where a run is, as stored in sync snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub epoch: usize,
    pub iteration: usize,
    pub progress: ProgressTracker,
}

impl TrainerState {
    pub fn new(iterations_without_progress: usize) -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            progress: ProgressTracker::new(iterations_without_progress),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    NoProgress,
    EpochBudget,
    IterationBudget,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingReport {
    pub epochs: usize,
    pub iterations: usize,
    pub final_loss: Option<f64>,
    pub stop: StopReason,
}

/// Fit `model` to `dataset` until the loss plateaus or a budget runs out.
///
/// With a `sync` file, an existing snapshot is restored first, a new one is written
/// every `sync_interval_secs`, and a last one when training stops.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    mut model: Classifier<B>,
    dataset: ImageDataset,
    mut sync: Option<&mut SyncFile>,
    device: &B::Device,
) -> Result<(Classifier<B>, TrainingReport)> {
    B::seed(config.seed);

    let mut optim = config.optimizer.init::<B, Classifier<B>>();
    let mut state = TrainerState::new(config.iterations_without_progress);

    // A resumed run starts its current epoch over from the first batch: the shuffle
    // order of an interrupted epoch is not stored, so batches already seen in it are
    // trained on again.
    if let Some(sync) = sync.as_deref() {
        if let Some(mut saved) = sync.load_state()? {
            model = sync.load_model(model, device)?;
            optim = sync.load_optimizer::<B, _>(optim, device)?;
            tracing::info!(
                "Resuming from {} at epoch {}, iteration {}",
                sync.state_path().display(),
                saved.epoch,
                saved.iteration
            );
            if saved.progress.threshold() != config.iterations_without_progress {
                tracing::warn!(
                    "Snapshot used a plateau threshold of {}, continuing with {}",
                    saved.progress.threshold(),
                    config.iterations_without_progress
                );
                saved.progress = saved.progress.with_threshold(config.iterations_without_progress);
            }
            state = saved;
        }
    }

    let loader = DataLoaderBuilder::<B, _, _>::new(ImageBatcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(dataset);

    let now = Instant::now();
    let mut final_loss = None;
    let stop = 'epochs: loop {
        if state.epoch >= config.max_epochs {
            break StopReason::EpochBudget;
        }

        for batch in loader.iter() {
            if state.progress.plateaued() {
                break 'epochs StopReason::NoProgress;
            }
            if config
                .max_iterations
                .is_some_and(|max| state.iteration >= max)
            {
                break 'epochs StopReason::IterationBudget;
            }

            let loss = model.forward_loss(batch);
            let value = loss.clone().into_scalar().elem::<f64>();
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            state.iteration += 1;
            state.progress.record(value);
            final_loss = Some(value);

            if config.log_interval > 0 && state.iteration % config.log_interval == 0 {
                tracing::info!(
                    "epoch {} iteration {} lr {} loss {:.5} steps without progress {} (robust {})",
                    state.epoch,
                    state.iteration,
                    config.learning_rate,
                    state.progress.recent_mean(config.log_interval).unwrap_or(value),
                    state.progress.steps_without_progress(),
                    state.progress.steps_without_progress_robust()
                );
            }

            if let Some(sync) = sync.as_deref_mut() {
                if sync.due() {
                    sync.save(&model, &optim, &state)?;
                }
            }
        }

        state.epoch += 1;
    };

    if let Some(sync) = sync {
        sync.save(&model, &optim, &state)?;
    }

    tracing::info!(
        "Training stopped ({:?}) after {} epochs, {} iterations [{}ms]",
        stop,
        state.epoch,
        state.iteration,
        now.elapsed().as_millis()
    );

    let report = TrainingReport {
        epochs: state.epoch,
        iterations: state.iteration,
        final_loss,
        stop,
    };
    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{FeatureShape, FASHION_MNIST_TOPOLOGY};
    use crate::NUM_CLASSES;
    use burn::backend::{Autodiff, NdArray};
    use std::time::Duration;

    type TestBackend = Autodiff<NdArray>;

    fn classifier(device: &<TestBackend as Backend>::Device) -> Classifier<TestBackend> {
        Classifier::new(&FASHION_MNIST_TOPOLOGY, FeatureShape::image(), NUM_CLASSES, device).unwrap()
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig::fashion_mnist()
            .with_batch_size(4)
            .with_log_interval(1)
    }

    #[test]
    fn test_default_hyperparameters() {
        let config = TrainingConfig::fashion_mnist();
        assert_eq!(config.learning_rate, 0.001);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.iterations_without_progress, 350);
        assert_eq!(config.sync_interval_secs, 100);
        assert_eq!(config.max_iterations, None);
    }

    #[test]
    fn test_iteration_budget() {
        let device = Default::default();
        let config = small_config().with_max_iterations(Some(3));

        let (_, report) = train(
            &config,
            classifier(&device),
            ImageDataset::synthetic(20, 1),
            None,
            &device,
        )
        .unwrap();

        assert_eq!(report.iterations, 3);
        assert_eq!(report.stop, StopReason::IterationBudget);
        assert!(report.final_loss.is_some_and(f64::is_finite));
    }

    #[test]
    fn test_epoch_budget() {
        let device = Default::default();
        let config = small_config().with_max_epochs(2);

        let (_, report) = train(
            &config,
            classifier(&device),
            ImageDataset::synthetic(10, 2),
            None,
            &device,
        )
        .unwrap();

        // 10 images in batches of 4: three batches per epoch
        assert_eq!(report.epochs, 2);
        assert_eq!(report.iterations, 6);
        assert_eq!(report.stop, StopReason::EpochBudget);
    }

    #[test]
    fn test_flat_loss_stops_training() {
        let device = Default::default();
        // One image and no learning: every batch has exactly the same loss
        let config = small_config()
            .with_learning_rate(0.0)
            .with_iterations_without_progress(3)
            .with_max_epochs(50);

        let (_, report) = train(
            &config,
            classifier(&device),
            ImageDataset::synthetic(1, 3),
            None,
            &device,
        )
        .unwrap();

        assert_eq!(report.stop, StopReason::NoProgress);
        assert_eq!(report.iterations, 3);
    }

    #[test]
    fn test_resumes_from_sync_file() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sync");

        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config().with_max_iterations(Some(2));
        train(
            &config,
            classifier(&device),
            ImageDataset::synthetic(20, 4),
            Some(&mut sync),
            &device,
        )
        .unwrap();

        let saved = sync.load_state().unwrap().unwrap();
        assert_eq!(saved.iteration, 2);

        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config().with_max_iterations(Some(5));
        let (_, report) = train(
            &config,
            classifier(&device),
            ImageDataset::synthetic(20, 4),
            Some(&mut sync),
            &device,
        )
        .unwrap();

        assert_eq!(report.iterations, 5);
        assert_eq!(sync.load_state().unwrap().unwrap().iteration, 5);
    }

    #[test]
    fn test_resume_restarts_the_interrupted_epoch() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sync");

        // 8 images in batches of 4: two batches per epoch, stopped one batch into epoch 1
        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config().with_max_iterations(Some(3));
        train(&config, classifier(&device), ImageDataset::synthetic(8, 8), Some(&mut sync), &device).unwrap();
        let saved = sync.load_state().unwrap().unwrap();
        assert_eq!((saved.epoch, saved.iteration), (1, 3));

        // Epoch 1 runs both of its batches again
        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config().with_max_epochs(2);
        let (_, report) =
            train(&config, classifier(&device), ImageDataset::synthetic(8, 8), Some(&mut sync), &device).unwrap();

        assert_eq!(report.stop, StopReason::EpochBudget);
        assert_eq!((report.epochs, report.iterations), (2, 5));
    }

    #[test]
    fn test_resume_uses_configured_threshold() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sync");

        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config().with_max_iterations(Some(2));
        train(&config, classifier(&device), ImageDataset::synthetic(8, 9), Some(&mut sync), &device).unwrap();
        assert_eq!(sync.load_state().unwrap().unwrap().progress.threshold(), 350);

        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config()
            .with_max_iterations(Some(3))
            .with_iterations_without_progress(40);
        train(&config, classifier(&device), ImageDataset::synthetic(8, 9), Some(&mut sync), &device).unwrap();
        assert_eq!(sync.load_state().unwrap().unwrap().progress.threshold(), 40);
    }

    #[test]
    fn test_corrupt_snapshot_is_fatal() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sync");

        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let config = small_config().with_max_iterations(Some(1));
        train(&config, classifier(&device), ImageDataset::synthetic(8, 10), Some(&mut sync), &device).unwrap();
        std::fs::write(sync.state_path(), "{ \"epoch\": ").unwrap();

        let mut sync = SyncFile::new(&base, Duration::from_secs(3600));
        let err = train(&config, classifier(&device), ImageDataset::synthetic(8, 10), Some(&mut sync), &device)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("corrupt sync state"), "{err:#}");
    }
}
