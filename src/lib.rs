//! Volumetric Neural Network Layers
//!
//! This library provides 3D building blocks for deep-learning models on volumetric
//! data such as medical images. Volumes are channels-last 5D tensors
//! `[batch, depth, height, width, channels]`.
//!
//! # Modules
//!
//! - `layers`: Layer trait and the Conv3D, Conv3DTranspose, Upsampling3D and MaxPool3D blocks
//! - `kernels`: Separable trilinear interpolation kernels
//! - `volume`: Volume container, padding and cropping
//! - `utils`: Deterministic RNG and activation functions
//! - `config`: Shared layer hyperparameters
//! - `architecture`: JSON architecture configuration and model building

pub mod architecture;
pub mod config;
pub mod error;
pub mod kernels;
pub mod layers;
pub mod utils;
pub mod volume;

pub use error::{LayerError, Result};
