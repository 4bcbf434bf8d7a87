use burn::data::dataset::Dataset;

use crate::{IMAGE_AREA, IMAGE_SIDE};

/// One 28x28 grayscale image and its class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabeledImage {
    // Row-major, in the order the pixels appeared in the input row
    pixels: [u8; IMAGE_AREA],
    label: usize,
}

impl LabeledImage {
    pub fn new(pixels: [u8; IMAGE_AREA], label: usize) -> Self {
        Self { pixels, label }
    }

    pub fn label(&self) -> usize {
        self.label
    }

    pub fn pixels(&self) -> &[u8; IMAGE_AREA] {
        &self.pixels
    }

    pub fn pixel(&self, row: usize, col: usize) -> u8 {
        self.pixels[row * IMAGE_SIDE + col]
    }
}

/// Images in file order. Read-only once loaded.
#[derive(Clone, Debug, Default)]
pub struct ImageDataset {
    images: Vec<LabeledImage>,
}

impl ImageDataset {
    pub fn new(images: Vec<LabeledImage>) -> Self {
        Self { images }
    }

    pub fn images(&self) -> &[LabeledImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabeledImage> {
        self.images.iter()
    }
}

impl Dataset<LabeledImage> for ImageDataset {
    fn get(&self, index: usize) -> Option<LabeledImage> {
        self.images.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

#[cfg(test)]
impl ImageDataset {
    // Random images whose label picks the bright band of rows, so there is something to learn
    pub(crate) fn synthetic(n: usize, seed: u64) -> Self {
        use crate::NUM_CLASSES;
        use rand::{rngs::SmallRng, Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(seed);
        let images = (0..n)
            .map(|i| {
                let label = i % NUM_CLASSES;
                let mut pixels = [0_u8; IMAGE_AREA];
                pixels.iter_mut().enumerate().for_each(|(p, pixel)| {
                    let bright = p * NUM_CLASSES / IMAGE_AREA == label;
                    *pixel = if bright { rng.gen_range(160..=255) } else { rng.gen_range(0..64) };
                });
                LabeledImage::new(pixels, label)
            })
            .collect();
        Self::new(images)
    }
}
