use burn::{data::dataloader::batcher::Batcher, prelude::*};

use super::LabeledImage;
use crate::IMAGE_SIDE;

/// Stacks labeled images into tensors for one forward pass.
#[derive(Clone, Debug, Default)]
pub struct ImageBatcher;

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[n, 1, 28, 28]`, intensities scaled to `[0, 1]`
    pub images: Tensor<B, 4>,
    /// `[n]` class labels
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, LabeledImage, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<LabeledImage>, device: &B::Device) -> ImageBatch<B> {
        let n = items.len();

        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|item| item.pixels().iter().map(|&pixel| pixel as f32 / 255.0))
            .collect();
        let labels: Vec<i64> = items.iter().map(|item| item.label() as i64).collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [n, 1, IMAGE_SIDE, IMAGE_SIDE]).convert::<B::FloatElem>(),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [n]).convert::<B::IntElem>(),
            device,
        );

        ImageBatch { images, targets }
    }
}
