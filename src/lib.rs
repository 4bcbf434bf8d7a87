pub mod checkpoint;
pub mod early_stopping;
pub mod error;
pub mod evaluate;
pub mod harness;
pub mod mnist;
pub mod model;
pub mod topology;
pub mod trainer;

// Side length of the square input images
pub const IMAGE_SIDE: usize = 28;
// Number of pixels in one image
pub const IMAGE_AREA: usize = IMAGE_SIDE * IMAGE_SIDE;
// Number of classes a label can name
pub const NUM_CLASSES: usize = 10;
