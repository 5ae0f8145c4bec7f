//! Layer trait definition for volumetric layers
//!
//! This module defines the core Layer trait that every block implements. The trait
//! provides a common interface for forward propagation, backward propagation,
//! parameter updates and shape inference.

use crate::error::Result;
use crate::volume::{Volume, VolumeShape};

/// Core trait for volumetric neural network layers.
///
/// All blocks (Conv3D, Conv3DTranspose, Upsampling3D, MaxPool3D) implement this
/// trait to provide a uniform interface over channels-last 5D volumes.
///
/// # Example
///
/// ```ignore
/// // Forward pass through a layer
/// let output = layer.forward(&input)?;
///
/// // Backward pass to compute gradients
/// let grad_input = layer.backward(&input, &grad_output)?;
/// layer.update_parameters(0.01);
/// ```
pub trait Layer {
    /// Forward propagation through the layer.
    ///
    /// Applies the layer's transformation and caches any intermediate values the
    /// backward pass needs.
    ///
    /// # Errors
    ///
    /// Returns `LayerError::ShapeMismatch` if the input shape is not accepted.
    fn forward(&self, input: &Volume) -> Result<Volume>;

    /// Backward propagation through the layer.
    ///
    /// Returns the gradient with respect to `input` and accumulates parameter
    /// gradients internally.
    ///
    /// # Notes
    ///
    /// - `input` must be the volume passed to the most recent `forward` call
    /// - Parameter gradients are applied via `update_parameters`
    fn backward(&self, input: &Volume, grad_output: &Volume) -> Result<Volume>;

    /// Apply accumulated gradients with plain gradient descent and clear them:
    /// `param = param - learning_rate * gradient`.
    ///
    /// Frozen parameters are left untouched.
    fn update_parameters(&mut self, learning_rate: f32);

    /// Shape produced for an input of shape `input`.
    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape>;

    /// Number of parameters (trainable or frozen) owned by the layer.
    fn parameter_count(&self) -> usize;

    /// Scope prefix under which the layer's parameters are named.
    fn scope(&self) -> &str;

    /// Named parameters, e.g. `("down1/kernel", [...])`.
    fn named_parameters(&self) -> Vec<(String, Vec<f32>)> {
        Vec::new()
    }
}

/// Join a scope and a parameter name the way variable scopes do.
pub(crate) fn scoped_name(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", scope, name)
    }
}
