//! Layer abstractions for volumetric neural networks
//!
//! This module provides the Layer trait and the 3D building blocks: convolution,
//! transposed convolution, fixed-kernel upsampling and max pooling, plus the batch
//! normalization used inside the convolution blocks.

mod r#trait;
mod block;
pub mod batchnorm;
pub mod conv3d;
pub mod conv3d_transpose;
pub mod geometry;
pub mod pool;
pub mod upsampling;

// Re-export the Layer trait for convenience
pub use r#trait::Layer;
pub use batchnorm::BatchNorm3D;
pub use conv3d::{Conv3DLayer, Conv3dOptions};
pub use conv3d_transpose::{Conv3DTransposeLayer, Conv3dTransposeOptions, KernelInitializer};
pub use geometry::Padding;
pub use pool::MaxPool3DLayer;
pub use upsampling::{Interpolator, Upsampling3DLayer, UpsamplingOptions};
