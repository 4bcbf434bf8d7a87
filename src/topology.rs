use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{IMAGE_SIDE, NUM_CLASSES};

/// One stage of a network, described as data.
///
/// A [`Classifier`](crate::model::Classifier) is built by walking a slice of these in
/// order. Spatial stages (`Conv2d`, `MaxPool2d`) must come before the first `Linear`;
/// the feature map is flattened when the first `Linear` is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    MaxPool2d {
        size: usize,
        stride: usize,
    },
    Linear {
        units: usize,
    },
    Relu,
}

/// The fixed Fashion-MNIST network. The loss (cross-entropy over the logits) is
/// applied by the model, not listed here.
///
/// Padding 2 keeps the 28x28 grid through the 5x5 convolution.
pub const FASHION_MNIST_TOPOLOGY: [LayerSpec; 8] = [
    LayerSpec::Conv2d {
        channels: 16,
        kernel: 5,
        stride: 1,
        padding: 2,
    },
    LayerSpec::Relu,
    LayerSpec::MaxPool2d { size: 2, stride: 2 },
    LayerSpec::Linear { units: 120 },
    LayerSpec::Relu,
    LayerSpec::Linear { units: 84 },
    LayerSpec::Relu,
    LayerSpec::Linear { units: NUM_CLASSES },
];

/// Shape of the activations between two stages, batch dimension excluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureShape {
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat {
        features: usize,
    },
}

impl FeatureShape {
    /// A single-channel square image.
    pub fn image() -> Self {
        FeatureShape::Spatial {
            channels: 1,
            height: IMAGE_SIDE,
            width: IMAGE_SIDE,
        }
    }

    pub fn features(&self) -> usize {
        match *self {
            FeatureShape::Spatial {
                channels,
                height,
                width,
            } => channels * height * width,
            FeatureShape::Flat { features } => features,
        }
    }

    pub fn channels(&self) -> usize {
        match *self {
            FeatureShape::Spatial { channels, .. } => channels,
            FeatureShape::Flat { features } => features,
        }
    }

    /// Shape after applying `spec` at position `index`.
    pub fn after(self, spec: &LayerSpec, index: usize) -> Result<Self, TopologyError> {
        match (*spec, self) {
            (LayerSpec::Relu, shape) => Ok(shape),
            (LayerSpec::Linear { units }, _) => {
                if units == 0 {
                    return Err(TopologyError::ZeroSize { index });
                }
                Ok(FeatureShape::Flat { features: units })
            }
            (LayerSpec::Conv2d { .. } | LayerSpec::MaxPool2d { .. }, FeatureShape::Flat { .. }) => {
                Err(TopologyError::SpatialAfterFlatten { index })
            }
            (
                LayerSpec::Conv2d {
                    channels: out_channels,
                    kernel,
                    stride,
                    padding,
                },
                FeatureShape::Spatial { height, width, .. },
            ) => {
                if out_channels == 0 || kernel == 0 || stride == 0 {
                    return Err(TopologyError::ZeroSize { index });
                }
                Ok(FeatureShape::Spatial {
                    channels: out_channels,
                    height: window_output(height + 2 * padding, kernel, stride, index)?,
                    width: window_output(width + 2 * padding, kernel, stride, index)?,
                })
            }
            (
                LayerSpec::MaxPool2d { size, stride },
                FeatureShape::Spatial {
                    channels,
                    height,
                    width,
                },
            ) => {
                if size == 0 || stride == 0 {
                    return Err(TopologyError::ZeroSize { index });
                }
                Ok(FeatureShape::Spatial {
                    channels,
                    height: window_output(height, size, stride, index)?,
                    width: window_output(width, size, stride, index)?,
                })
            }
        }
    }
}

// Output length of a sliding window without padding
fn window_output(input: usize, window: usize, stride: usize, index: usize) -> Result<usize, TopologyError> {
    if window > input {
        return Err(TopologyError::WindowTooLarge {
            index,
            window,
            input,
        });
    }
    Ok((input - window) / stride + 1)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no layers")]
    Empty,
    #[error("layer {index}: sizes and strides must be non-zero")]
    ZeroSize { index: usize },
    #[error("layer {index}: window {window} does not fit input of size {input}")]
    WindowTooLarge {
        index: usize,
        window: usize,
        input: usize,
    },
    #[error("layer {index}: spatial layer after the feature map was flattened")]
    SpatialAfterFlatten { index: usize },
    #[error("last layer must be linear with {expected} units, found {found:?}")]
    OutputWidth {
        expected: usize,
        found: Option<LayerSpec>,
    },
}

/// Walk `specs` from `input`, returning the shape after every stage.
pub fn infer_shapes(
    specs: &[LayerSpec],
    input: FeatureShape,
    num_classes: usize,
) -> Result<Vec<FeatureShape>, TopologyError> {
    let Some(last) = specs.last() else {
        return Err(TopologyError::Empty);
    };
    if *last != (LayerSpec::Linear { units: num_classes }) {
        return Err(TopologyError::OutputWidth {
            expected: num_classes,
            found: Some(*last),
        });
    }

    let mut shape = input;
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            shape = shape.after(spec, index)?;
            Ok(shape)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fashion_topology_shapes() {
        let shapes = infer_shapes(&FASHION_MNIST_TOPOLOGY, FeatureShape::image(), NUM_CLASSES).unwrap();

        assert_eq!(
            shapes[0],
            FeatureShape::Spatial {
                channels: 16,
                height: 28,
                width: 28
            }
        );
        assert_eq!(
            shapes[2],
            FeatureShape::Spatial {
                channels: 16,
                height: 14,
                width: 14
            }
        );
        assert_eq!(shapes[2].features(), 16 * 14 * 14);
        assert_eq!(shapes[3], FeatureShape::Flat { features: 120 });
        assert_eq!(shapes.last(), Some(&FeatureShape::Flat { features: 10 }));
    }

    #[test]
    fn test_unpadded_conv_shrinks() {
        let shape = FeatureShape::image()
            .after(
                &LayerSpec::Conv2d {
                    channels: 6,
                    kernel: 5,
                    stride: 1,
                    padding: 0,
                },
                0,
            )
            .unwrap();
        assert_eq!(
            shape,
            FeatureShape::Spatial {
                channels: 6,
                height: 24,
                width: 24
            }
        );
    }

    #[test]
    fn test_rejects_bad_topologies() {
        assert_eq!(infer_shapes(&[], FeatureShape::image(), 10), Err(TopologyError::Empty));

        let wrong_output = [LayerSpec::Linear { units: 7 }];
        assert!(matches!(
            infer_shapes(&wrong_output, FeatureShape::image(), 10),
            Err(TopologyError::OutputWidth { expected: 10, .. })
        ));

        let pool_after_linear = [
            LayerSpec::Linear { units: 32 },
            LayerSpec::MaxPool2d { size: 2, stride: 2 },
            LayerSpec::Linear { units: 10 },
        ];
        assert_eq!(
            infer_shapes(&pool_after_linear, FeatureShape::image(), 10),
            Err(TopologyError::SpatialAfterFlatten { index: 1 })
        );

        let huge_kernel = [
            LayerSpec::Conv2d {
                channels: 4,
                kernel: 29,
                stride: 1,
                padding: 0,
            },
            LayerSpec::Linear { units: 10 },
        ];
        assert_eq!(
            infer_shapes(&huge_kernel, FeatureShape::image(), 10),
            Err(TopologyError::WindowTooLarge {
                index: 0,
                window: 29,
                input: 28
            })
        );
    }

    #[test]
    fn test_layer_spec_json() {
        let json = serde_json::to_string(&LayerSpec::MaxPool2d { size: 2, stride: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"max_pool2d","size":2,"stride":2}"#);
    }
}
