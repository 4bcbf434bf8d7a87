use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::dataloader::batcher::Batcher,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};

use crate::mnist::{ImageBatch, ImageBatcher, LabeledImage};
use crate::topology::{infer_shapes, FeatureShape, LayerSpec, TopologyError};

/// Recorder used for persisted models and sync snapshots.
pub type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

// Extension the recorder puts on every file it writes
pub const RECORD_EXTENSION: &str = "mpk";

#[derive(Module, Debug)]
pub enum Layer<B: Backend> {
    Conv2d(Conv2d<B>),
    MaxPool2d(MaxPool2d),
    Linear(Linear<B>),
    Relu(Relu),
}

impl<B: Backend> Layer<B> {
    // Every stage maps [n, c, h, w] to [n, c', h', w']. Linear stages see the
    // flattened features as [n, 1, 1, c*h*w].
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Layer::Conv2d(conv) => conv.forward(x),
            Layer::MaxPool2d(pool) => pool.forward(x),
            Layer::Relu(relu) => relu.forward(x),
            Layer::Linear(linear) => {
                let [n, c, h, w] = x.dims();
                linear.forward(x.reshape([n, 1, 1, c * h * w]))
            }
        }
    }
}

/// An image classifier assembled from a list of [`LayerSpec`]s.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    layers: Vec<Layer<B>>,
}

impl<B: Backend> Classifier<B> {
    pub fn new(
        specs: &[LayerSpec],
        input: FeatureShape,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Self, TopologyError> {
        let shapes = infer_shapes(specs, input, num_classes)?;

        let inputs = std::iter::once(input).chain(shapes.iter().copied());
        let layers = specs
            .iter()
            .zip(inputs)
            .map(|(spec, shape)| match *spec {
                LayerSpec::Conv2d {
                    channels,
                    kernel,
                    stride,
                    padding,
                } => Layer::Conv2d(
                    Conv2dConfig::new([shape.channels(), channels], [kernel, kernel])
                        .with_stride([stride, stride])
                        .with_padding(PaddingConfig2d::Explicit(padding, padding))
                        .init(device),
                ),
                LayerSpec::MaxPool2d { size, stride } => Layer::MaxPool2d(
                    MaxPool2dConfig::new([size, size])
                        .with_strides([stride, stride])
                        .init(),
                ),
                LayerSpec::Linear { units } => {
                    Layer::Linear(LinearConfig::new(shape.features(), units).init(device))
                }
                LayerSpec::Relu => Layer::Relu(Relu::new()),
            })
            .collect();

        Ok(Self { layers })
    }

    /// `[n, 1, 28, 28]` images to `[n, classes]` logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .layers
            .iter()
            .fold(images, |x, layer| layer.forward(x));
        let [n, c, h, w] = x.dims();
        x.reshape([n, c * h * w])
    }

    /// Mean multiclass log-loss of the batch.
    pub fn forward_loss(&self, batch: ImageBatch<B>) -> Tensor<B, 1> {
        let logits = self.forward(batch.images);
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, batch.targets)
    }

    /// Index of the largest logit for every image of the batch.
    pub fn predict(&self, images: Tensor<B, 4>) -> Vec<usize> {
        self.forward(images)
            .argmax(1)
            .flatten::<1>(0, 1)
            .into_data()
            .iter::<i64>()
            .map(|class| class as usize)
            .collect()
    }

    pub fn predict_image(&self, image: &LabeledImage, device: &B::Device) -> usize {
        let batch = Batcher::<B, _, _>::batch(&ImageBatcher, vec![image.clone()], device);
        self.predict(batch.images)[0]
    }

    /// Write the parameters next to `path`; returns the file actually written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        self.clone()
            .save_file(path.to_path_buf(), &ModelRecorder::new())
            .with_context(|| format!("cannot save model to '{}'", path.display()))?;
        Ok(record_file(path))
    }

    /// Restore parameters written by [`Classifier::save`] into this architecture.
    pub fn load(self, path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        self.load_file(path.to_path_buf(), &ModelRecorder::new(), device)
            .with_context(|| format!("cannot load model from '{}'", path.display()))
    }
}

/// Path of the file the recorder writes for `path`.
pub fn record_file(path: &Path) -> PathBuf {
    path.with_extension(RECORD_EXTENSION)
}
