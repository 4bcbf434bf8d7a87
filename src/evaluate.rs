use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::mnist::{ImageBatcher, ImageDataset, LabeledImage};
use crate::model::Classifier;

/// Anything that can label images.
pub trait Predict {
    fn predict(&self, images: &[LabeledImage]) -> Vec<usize>;
}

/// Runs a trained [`Classifier`] on one device.
pub struct ModelPredictor<'a, B: Backend> {
    model: &'a Classifier<B>,
    device: B::Device,
}

impl<'a, B: Backend> ModelPredictor<'a, B> {
    pub fn new(model: &'a Classifier<B>, device: B::Device) -> Self {
        Self { model, device }
    }
}

impl<B: Backend> Predict for ModelPredictor<'_, B> {
    fn predict(&self, images: &[LabeledImage]) -> Vec<usize> {
        if images.is_empty() {
            return Vec::new();
        }
        let batch = Batcher::<B, _, _>::batch(&ImageBatcher, images.to_vec(), &self.device);
        self.model.predict(batch.images)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub correct: usize,
    pub total: usize,
}

impl Evaluation {
    /// Percentage of correct predictions, `0.0` for an empty test set.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 * 100.0 / self.total as f64
    }
}

// Compare every prediction against its ground truth label
pub fn evaluate(predictor: &impl Predict, dataset: &ImageDataset, batch_size: usize) -> Evaluation {
    let correct = dataset
        .images()
        .chunks(batch_size.max(1))
        .map(|chunk| {
            predictor
                .predict(chunk)
                .iter()
                .zip(chunk)
                .filter(|&(&predicted, image)| predicted == image.label())
                .count()
        })
        .sum();

    Evaluation {
        correct,
        total: dataset.len(),
    }
}
