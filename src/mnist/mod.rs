// Everything that knows about the CSV image layout lives here

mod dataset;
pub use dataset::{ImageDataset, LabeledImage};

mod load_csv;
pub use load_csv::load_csv;

mod batcher;
pub use batcher::{ImageBatch, ImageBatcher};
