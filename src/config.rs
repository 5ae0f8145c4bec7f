//! Layer defaults configuration
//!
//! This module provides the hyperparameters shared by every block built from an
//! architecture file: activation slopes, batch-normalization constants and the seed
//! used for weight initialization. Values default to the conventions of the common
//! deep-learning frameworks, so an empty JSON object is a valid configuration.

use crate::error::{LayerError, Result};
use crate::utils::activations::{DEFAULT_ELU_ALPHA, DEFAULT_LEAKY_RELU_ALPHA};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Default batch-normalization epsilon.
pub const DEFAULT_BN_EPSILON: f32 = 1e-3;

/// Default batch-normalization momentum for the running statistics.
pub const DEFAULT_BN_MOMENTUM: f32 = 0.99;

/// Shared hyperparameters for block construction.
///
/// # Example
///
/// ```json
/// {
///   "leaky_relu_alpha": 0.2,
///   "elu_alpha": 1.0,
///   "batchnorm_epsilon": 0.001,
///   "batchnorm_momentum": 0.99,
///   "seed": 42
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerDefaults {
    /// Negative slope of the leaky ReLU
    pub leaky_relu_alpha: f32,

    /// Alpha of the ELU
    pub elu_alpha: f32,

    /// Batch-normalization epsilon added to the variance
    pub batchnorm_epsilon: f32,

    /// Batch-normalization momentum: running = momentum * running + (1 - momentum) * batch
    pub batchnorm_momentum: f32,

    /// Seed for Glorot-uniform kernel initialization
    pub seed: u64,
}

impl Default for LayerDefaults {
    fn default() -> Self {
        Self {
            leaky_relu_alpha: DEFAULT_LEAKY_RELU_ALPHA,
            elu_alpha: DEFAULT_ELU_ALPHA,
            batchnorm_epsilon: DEFAULT_BN_EPSILON,
            batchnorm_momentum: DEFAULT_BN_MOMENTUM,
            seed: 42,
        }
    }
}

/// Loads layer defaults from a JSON file.
///
/// Missing fields take their default values; unknown fields are rejected.
///
/// # Examples
///
/// ```no_run
/// use volumetric_nn::config::load_defaults;
///
/// let defaults = load_defaults("config/defaults.json").unwrap();
/// assert!(defaults.batchnorm_epsilon > 0.0);
/// ```
pub fn load_defaults<P: AsRef<Path>>(path: P) -> Result<LayerDefaults> {
    let contents = fs::read_to_string(path)?;
    let defaults: LayerDefaults = serde_json::from_str(&contents)?;
    validate_defaults(&defaults)?;
    Ok(defaults)
}

/// Checks every field is inside its valid range.
pub fn validate_defaults(defaults: &LayerDefaults) -> Result<()> {
    if defaults.leaky_relu_alpha < 0.0 {
        return Err(LayerError::InvalidConfig(
            "leaky_relu_alpha must be non-negative".to_string(),
        ));
    }

    if defaults.elu_alpha <= 0.0 {
        return Err(LayerError::InvalidConfig(
            "elu_alpha must be positive".to_string(),
        ));
    }

    if defaults.batchnorm_epsilon <= 0.0 {
        return Err(LayerError::InvalidConfig(
            "batchnorm_epsilon must be positive".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&defaults.batchnorm_momentum) {
        return Err(LayerError::InvalidConfig(
            "batchnorm_momentum must be in range [0.0, 1.0]".to_string(),
        ));
    }

    Ok(())
}
