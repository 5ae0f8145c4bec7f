//! Shared utilities for the volumetric layers
//!
//! This module provides the deterministic RNG used for weight initialization and
//! the activation functions applied by the convolution blocks.

pub mod activations;
pub mod rng;

pub use activations::Activation;
pub use rng::SimpleRng;
