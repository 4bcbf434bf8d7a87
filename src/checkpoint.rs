use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use burn::{
    optim::Optimizer,
    record::Recorder,
    tensor::backend::AutodiffBackend,
};

use crate::model::{Classifier, ModelRecorder};
use crate::trainer::TrainerState;

/// Periodic snapshot of a training run, so an interrupted run can pick up where it left off.
///
/// A base path `P` owns three files:
/// - `P_model.mpk`: model parameters
/// - `P_optim.mpk`: optimizer state (momentum buffers)
/// - `P.json`: epoch, iteration and recent losses
///
/// Every file is first written under a partial name and then renamed over the
/// previous one, the JSON file last. A crash mid-save leaves whole files from the
/// previous snapshot behind, never a truncated one, and the JSON file only appears
/// once the first snapshot is complete.
#[derive(Debug)]
pub struct SyncFile {
    base: PathBuf,
    interval: Duration,
    last_write: Instant,
}

impl SyncFile {
    pub fn new(base: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            base: base.into(),
            interval,
            last_write: Instant::now(),
        }
    }

    pub fn model_path(&self) -> PathBuf {
        with_suffix(&self.base, "_model.mpk")
    }

    pub fn optimizer_path(&self) -> PathBuf {
        with_suffix(&self.base, "_optim.mpk")
    }

    pub fn state_path(&self) -> PathBuf {
        with_suffix(&self.base, ".json")
    }

    pub fn exists(&self) -> bool {
        self.state_path().is_file()
    }

    /// True once the interval elapsed since the last snapshot (or since creation).
    pub fn due(&self) -> bool {
        self.last_write.elapsed() >= self.interval
    }

    pub fn save<B, O>(&mut self, model: &Classifier<B>, optim: &O, state: &TrainerState) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<Classifier<B>, B>,
    {
        let partial_model = model.save(partial_path(&self.model_path()))?;
        replace(&partial_model, &self.model_path())?;

        let partial_optimizer = partial_path(&self.optimizer_path());
        Recorder::<B>::record(&ModelRecorder::new(), optim.to_record(), partial_optimizer.clone())
            .with_context(|| format!("cannot write optimizer state to '{}'", partial_optimizer.display()))?;
        replace(&partial_optimizer, &self.optimizer_path())?;

        let state_path = self.state_path();
        let partial_state = partial_path(&state_path);
        let json = serde_json::to_vec_pretty(state)?;
        fs::write(&partial_state, json)
            .with_context(|| format!("cannot write '{}'", partial_state.display()))?;
        replace(&partial_state, &state_path)?;

        self.last_write = Instant::now();
        tracing::debug!(
            "Synced epoch {} iteration {} to {}",
            state.epoch,
            state.iteration,
            self.base.display()
        );
        Ok(())
    }

    /// The trainer state of the last complete snapshot, if there is one.
    pub fn load_state(&self) -> Result<Option<TrainerState>> {
        if !self.exists() {
            return Ok(None);
        }
        let path = self.state_path();
        let json = fs::read(&path).with_context(|| format!("cannot read '{}'", path.display()))?;
        let state = serde_json::from_slice(&json)
            .with_context(|| format!("corrupt sync state in '{}'", path.display()))?;
        Ok(Some(state))
    }

    pub fn load_model<B: AutodiffBackend>(
        &self,
        model: Classifier<B>,
        device: &B::Device,
    ) -> Result<Classifier<B>> {
        model.load(self.model_path(), device)
    }

    pub fn load_optimizer<B, O>(&self, optim: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        O: Optimizer<Classifier<B>, B>,
    {
        let path = self.optimizer_path();
        let record = Recorder::<B>::load(&ModelRecorder::new(), path.clone(), device)
            .with_context(|| format!("cannot read optimizer state from '{}'", path.display()))?;
        Ok(optim.load_record(record))
    }
}

// `a/b_model.mpk` is written as `a/b_model_partial.mpk`, keeping the extension the
// recorder insists on
fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.file_stem().unwrap_or_default());
    name.push("_partial");
    if let Some(extension) = path.extension() {
        name.push(".");
        name.push(extension);
    }
    path.with_file_name(name)
}

fn replace(partial: &Path, path: &Path) -> Result<()> {
    fs::rename(partial, path).with_context(|| format!("cannot replace '{}'", path.display()))
}

// Append to the file name without touching any extension already in it
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
