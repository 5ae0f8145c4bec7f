//! 3D convolution block
//!
//! This module provides a Conv3DLayer that performs a 3D convolution over
//! channels-last volumes, optionally followed by batch normalization and an
//! activation: `conv -> [batch norm] -> [activation]`.

use crate::config::LayerDefaults;
use crate::error::{LayerError, Result};
use crate::layers::block::BlockTail;
use crate::layers::geometry::{
    conv_backward_input, conv_backward_kernel, conv_forward, ConvGeometry, Padding,
};
use crate::layers::r#trait::scoped_name;
use crate::layers::{BatchNorm3D, Layer};
use crate::utils::{Activation, SimpleRng};
use crate::volume::{Volume, VolumeShape};
use std::cell::RefCell;
use tracing::{debug, trace};

/// Construction options of a [`Conv3DLayer`].
///
/// `Conv3dOptions::new(filters, kernel_size)` fills in the usual defaults:
/// valid padding, no batch normalization, unit strides and dilation, no
/// activation, with bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv3dOptions {
    /// Number of output feature maps
    pub filters: usize,
    /// Kernel extent `[depth, height, width]`
    pub kernel_size: [usize; 3],
    /// `Valid` or `Same`
    pub padding: Padding,
    /// `None`: no batch normalization, `Some(true)`: training mode, `Some(false)`: inference mode
    pub bn_training: Option<bool>,
    /// Dilation per axis
    pub dilation_rate: [usize; 3],
    /// Stride per axis
    pub strides: [usize; 3],
    /// Scope prefix for parameter names
    pub scope: String,
    /// Activation applied last
    pub activation: Option<Activation>,
    /// Whether a per-filter bias is added after the convolution
    pub use_bias: bool,
}

impl Conv3dOptions {
    pub fn new(filters: usize, kernel_size: [usize; 3]) -> Self {
        Self {
            filters,
            kernel_size,
            padding: Padding::Valid,
            bn_training: None,
            dilation_rate: [1, 1, 1],
            strides: [1, 1, 1],
            scope: String::new(),
            activation: None,
            use_bias: true,
        }
    }
}

/// 3D convolution with an optional batch-norm and activation tail.
///
/// Kernel layout is `[kd, kh, kw, in_channels, filters]`.
///
/// # Example
///
/// ```
/// use volumetric_nn::config::LayerDefaults;
/// use volumetric_nn::layers::{Conv3DLayer, Conv3dOptions, Layer};
/// use volumetric_nn::utils::{Activation, SimpleRng};
/// use volumetric_nn::volume::{Volume, VolumeShape};
///
/// let mut rng = SimpleRng::new(42);
/// let options = Conv3dOptions {
///     activation: Some(Activation::Relu),
///     scope: "down1".to_string(),
///     ..Conv3dOptions::new(8, [3, 3, 3])
/// };
/// let layer = Conv3DLayer::new(1, options, &LayerDefaults::default(), &mut rng).unwrap();
/// let input = Volume::zeros(VolumeShape::new(1, 9, 9, 9, 1));
/// let output = layer.forward(&input).unwrap();
/// assert_eq!(output.shape(), VolumeShape::new(1, 7, 7, 7, 8));
/// ```
pub struct Conv3DLayer {
    in_channels: usize,
    options: Conv3dOptions,
    weights: Vec<f32>,
    biases: Vec<f32>,
    grad_weights: RefCell<Vec<f32>>,
    grad_biases: RefCell<Vec<f32>>,
    tail: BlockTail,
}

impl Conv3DLayer {
    /// Create a Conv3DLayer with Glorot-uniform kernel and zero bias.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for zero filters, kernel extents, strides or dilation.
    pub fn new(
        in_channels: usize,
        options: Conv3dOptions,
        defaults: &LayerDefaults,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        validate_common(in_channels, options.filters, options.kernel_size, options.strides)?;
        if options.dilation_rate.contains(&0) {
            return Err(LayerError::InvalidParameter(
                "dilation_rate must be at least 1 on every axis".to_string(),
            ));
        }
        if options.dilation_rate != [1, 1, 1] && options.strides != [1, 1, 1] {
            return Err(LayerError::InvalidParameter(
                "dilation_rate and strides cannot both exceed 1".to_string(),
            ));
        }

        let weights = rng.glorot_uniform(options.kernel_size, in_channels, options.filters);
        let tail = BlockTail::new(
            options.filters,
            options.bn_training,
            options.activation,
            defaults,
        )?;
        let biases = vec![0.0f32; if options.use_bias { options.filters } else { 0 }];

        debug!(
            scope = %options.scope,
            in_channels,
            filters = options.filters,
            kernel = ?options.kernel_size,
            padding = %options.padding,
            "built conv3d"
        );

        Ok(Self {
            in_channels,
            grad_weights: RefCell::new(vec![0.0f32; weights.len()]),
            grad_biases: RefCell::new(vec![0.0f32; biases.len()]),
            weights,
            biases,
            options,
            tail,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn filters(&self) -> usize {
        self.options.filters
    }

    pub fn options(&self) -> &Conv3dOptions {
        &self.options
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Replace the kernel, e.g. with pretrained weights.
    pub fn set_weights(&mut self, weights: Vec<f32>) -> Result<()> {
        if weights.len() != self.weights.len() {
            return Err(LayerError::ShapeMismatch(format!(
                "conv3d kernel needs {} weights, got {}",
                self.weights.len(),
                weights.len()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    pub fn batchnorm(&self) -> Option<&BatchNorm3D> {
        self.tail.batchnorm()
    }

    /// Switch batch normalization between training and inference mode.
    pub fn set_bn_training(&mut self, training: bool) {
        if let Some(bn) = self.tail.batchnorm_mut() {
            bn.set_training(training);
        }
    }

    pub fn activation(&self) -> Option<Activation> {
        self.tail.activation()
    }

    fn geometry(&self, input: VolumeShape) -> Result<ConvGeometry> {
        if input.channels != self.in_channels {
            return Err(LayerError::ShapeMismatch(format!(
                "conv3d '{}' expects {} input channels, got {}",
                self.options.scope, self.in_channels, input.channels
            )));
        }
        ConvGeometry::conv(
            input.spatial(),
            self.options.kernel_size,
            self.options.strides,
            self.options.dilation_rate,
            self.options.padding,
        )
    }
}

pub(crate) fn validate_common(
    in_channels: usize,
    filters: usize,
    kernel_size: [usize; 3],
    strides: [usize; 3],
) -> Result<()> {
    if in_channels == 0 || filters == 0 {
        return Err(LayerError::InvalidParameter(
            "in_channels and filters must be at least 1".to_string(),
        ));
    }
    if kernel_size.contains(&0) || strides.contains(&0) {
        return Err(LayerError::InvalidParameter(
            "kernel_size and strides must be at least 1 on every axis".to_string(),
        ));
    }
    Ok(())
}

/// Add `bias[c]` to every voxel of channel `c`.
pub(crate) fn add_bias(volume: &mut Volume, bias: &[f32]) {
    if bias.is_empty() {
        return;
    }
    for voxel in volume.data_mut().chunks_exact_mut(bias.len()) {
        for (v, b) in voxel.iter_mut().zip(bias) {
            *v += *b;
        }
    }
}

/// Accumulate the per-channel sum of `grad` into `grad_bias`.
pub(crate) fn accumulate_bias_grad(grad: &Volume, grad_bias: &mut [f32]) {
    if grad_bias.is_empty() {
        return;
    }
    for voxel in grad.data().chunks_exact(grad_bias.len()) {
        for (acc, g) in grad_bias.iter_mut().zip(voxel) {
            *acc += *g;
        }
    }
}

impl Layer for Conv3DLayer {
    fn forward(&self, input: &Volume) -> Result<Volume> {
        let geom = self.geometry(input.shape())?;
        let mut net = conv_forward(&geom, input, &self.weights, self.options.filters)?;
        add_bias(&mut net, &self.biases);
        trace!(
            scope = %self.options.scope,
            input = %input.shape(),
            output = %net.shape(),
            "conv3d forward"
        );
        self.tail.forward(net)
    }

    fn backward(&self, input: &Volume, grad_output: &Volume) -> Result<Volume> {
        let geom = self.geometry(input.shape())?;
        let grad = self.tail.backward(grad_output)?;
        accumulate_bias_grad(&grad, &mut self.grad_biases.borrow_mut());
        conv_backward_kernel(&geom, input, &grad, &mut self.grad_weights.borrow_mut())?;
        conv_backward_input(&geom, &grad, &self.weights, self.in_channels)
    }

    fn update_parameters(&mut self, learning_rate: f32) {
        let mut grad_weights = self.grad_weights.borrow_mut();
        for (w, g) in self.weights.iter_mut().zip(grad_weights.iter_mut()) {
            *w -= learning_rate * *g;
            *g = 0.0;
        }
        let mut grad_biases = self.grad_biases.borrow_mut();
        for (b, g) in self.biases.iter_mut().zip(grad_biases.iter_mut()) {
            *b -= learning_rate * *g;
            *g = 0.0;
        }
        drop(grad_weights);
        drop(grad_biases);
        self.tail.update_parameters(learning_rate);
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        let geom = self.geometry(input)?;
        Ok(VolumeShape::from_spatial(input.batch, geom.output, self.options.filters))
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len() + self.tail.parameter_count()
    }

    fn scope(&self) -> &str {
        &self.options.scope
    }

    fn named_parameters(&self) -> Vec<(String, Vec<f32>)> {
        let scope = &self.options.scope;
        let mut params = vec![(scoped_name(scope, "conv3d/kernel"), self.weights.clone())];
        if !self.biases.is_empty() {
            params.push((scoped_name(scope, "conv3d/bias"), self.biases.clone()));
        }
        params.extend(self.tail.named_parameters(scope));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(options: Conv3dOptions, in_channels: usize) -> Conv3DLayer {
        let mut rng = SimpleRng::new(42);
        Conv3DLayer::new(in_channels, options, &LayerDefaults::default(), &mut rng).unwrap()
    }

    #[test]
    fn test_conv3d_parameter_count() {
        let layer = build(Conv3dOptions::new(8, [3, 3, 3]), 2);
        // weights: 27 * 2 * 8 = 432, biases: 8
        assert_eq!(layer.parameter_count(), 440);

        let with_bn = build(
            Conv3dOptions {
                bn_training: Some(true),
                use_bias: false,
                ..Conv3dOptions::new(8, [3, 3, 3])
            },
            2,
        );
        assert_eq!(with_bn.parameter_count(), 432 + 16);
    }

    #[test]
    fn test_conv3d_deterministic_initialization() {
        let a = build(Conv3dOptions::new(4, [3, 3, 3]), 3);
        let b = build(Conv3dOptions::new(4, [3, 3, 3]), 3);
        assert_eq!(a.weights(), b.weights());
        assert!(a.biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_conv3d_rejects_zero_sizes() {
        let mut rng = SimpleRng::new(1);
        let defaults = LayerDefaults::default();
        let no_filters = Conv3dOptions::new(0, [3, 3, 3]);
        assert!(Conv3DLayer::new(1, no_filters, &defaults, &mut rng).is_err());
        let flat_kernel = Conv3dOptions::new(4, [3, 0, 3]);
        assert!(Conv3DLayer::new(1, flat_kernel, &defaults, &mut rng).is_err());
        let dilated_strided = Conv3dOptions {
            dilation_rate: [2, 2, 2],
            strides: [2, 2, 2],
            ..Conv3dOptions::new(4, [3, 3, 3])
        };
        assert!(Conv3DLayer::new(1, dilated_strided, &defaults, &mut rng).is_err());
    }

    #[test]
    fn test_conv3d_wrong_channel_count() {
        let layer = build(Conv3dOptions::new(4, [3, 3, 3]), 2);
        let input = Volume::zeros(VolumeShape::new(1, 5, 5, 5, 3));
        assert!(matches!(layer.forward(&input), Err(LayerError::ShapeMismatch(_))));
    }

    #[test]
    fn test_conv3d_named_parameters() {
        let layer = build(
            Conv3dOptions {
                scope: "enc1".to_string(),
                bn_training: Some(false),
                ..Conv3dOptions::new(2, [1, 1, 1])
            },
            1,
        );
        let names: Vec<String> = layer.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "enc1/conv3d/kernel",
                "enc1/conv3d/bias",
                "enc1/batch_normalization/gamma",
                "enc1/batch_normalization/beta",
                "enc1/batch_normalization/moving_mean",
                "enc1/batch_normalization/moving_variance",
            ]
        );
    }
}
