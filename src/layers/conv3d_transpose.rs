//! Transposed 3D convolution block
//!
//! This module provides a Conv3DTransposeLayer (learned or fixed upsampling),
//! optionally followed by batch normalization and an activation. The kernel can be
//! initialized from the fixed trilinear interpolation kernel, in which case the
//! layer starts out as a linear-interpolation upsampler.

use crate::config::LayerDefaults;
use crate::error::{LayerError, Result};
use crate::kernels::{scale_for_extent, separable_up_kernel};
use crate::layers::block::BlockTail;
use crate::layers::conv3d::{accumulate_bias_grad, add_bias, validate_common};
use crate::layers::geometry::{
    conv_backward_input, conv_backward_kernel, conv_forward, ConvGeometry, Padding,
};
use crate::layers::r#trait::scoped_name;
use crate::layers::{BatchNorm3D, Layer};
use crate::utils::{Activation, SimpleRng};
use crate::volume::{Volume, VolumeShape};
use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

/// Kernel initializer of a transposed convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelInitializer {
    /// Glorot uniform
    #[default]
    GlorotUniform,
    /// Fixed separable linear-interpolation kernel for every channel pair
    Trilinear,
}

impl KernelInitializer {
    /// Parse an optional initializer name; `None` means Glorot uniform.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(KernelInitializer::GlorotUniform),
            Some(name) => name.parse(),
        }
    }
}

impl FromStr for KernelInitializer {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trilinear" => Ok(KernelInitializer::Trilinear),
            _ => Err(LayerError::UnknownInitializer {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for KernelInitializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelInitializer::GlorotUniform => write!(f, "glorot_uniform"),
            KernelInitializer::Trilinear => write!(f, "trilinear"),
        }
    }
}

/// Construction options of a [`Conv3DTransposeLayer`].
///
/// Defaults: valid padding, unit strides, no batch normalization, no
/// activation, no bias, Glorot-uniform kernel, trainable.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv3dTransposeOptions {
    pub filters: usize,
    pub kernel_size: [usize; 3],
    pub padding: Padding,
    pub bn_training: Option<bool>,
    pub strides: [usize; 3],
    pub scope: String,
    pub activation: Option<Activation>,
    pub use_bias: bool,
    pub initializer: KernelInitializer,
    /// When false the kernel and bias are frozen
    pub trainable: bool,
}

impl Conv3dTransposeOptions {
    pub fn new(filters: usize, kernel_size: [usize; 3]) -> Self {
        Self {
            filters,
            kernel_size,
            padding: Padding::Valid,
            bn_training: None,
            strides: [1, 1, 1],
            scope: String::new(),
            activation: None,
            use_bias: false,
            initializer: KernelInitializer::GlorotUniform,
            trainable: true,
        }
    }
}

/// Transposed 3D convolution with an optional batch-norm and activation tail.
///
/// Kernel layout is `[kd, kh, kw, filters, in_channels]`.
pub struct Conv3DTransposeLayer {
    in_channels: usize,
    options: Conv3dTransposeOptions,
    weights: Vec<f32>,
    biases: Vec<f32>,
    grad_weights: RefCell<Vec<f32>>,
    grad_biases: RefCell<Vec<f32>>,
    tail: BlockTail,
}

/// Trilinear kernel repeated for every `(filter, input channel)` pair.
fn trilinear_kernel_for(
    kernel_size: [usize; 3],
    filters: usize,
    in_channels: usize,
) -> Result<Vec<f32>> {
    let scales = [
        scale_for_extent(kernel_size[0])?,
        scale_for_extent(kernel_size[1])?,
        scale_for_extent(kernel_size[2])?,
    ];
    let taps = separable_up_kernel(&scales)?;
    let pairs = filters * in_channels;
    let mut weights = Vec::with_capacity(taps.len() * pairs);
    for &tap in &taps {
        weights.extend(std::iter::repeat(tap).take(pairs));
    }
    Ok(weights)
}

impl Conv3DTransposeLayer {
    /// Create a transposed convolution block.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` for zero sizes, or an even kernel extent with the
    ///   trilinear initializer
    pub fn new(
        in_channels: usize,
        options: Conv3dTransposeOptions,
        defaults: &LayerDefaults,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        validate_common(in_channels, options.filters, options.kernel_size, options.strides)?;

        let weights = match options.initializer {
            KernelInitializer::GlorotUniform => {
                // fan_in of the equivalent forward convolution is filters
                rng.glorot_uniform(options.kernel_size, options.filters, in_channels)
            }
            KernelInitializer::Trilinear => {
                trilinear_kernel_for(options.kernel_size, options.filters, in_channels)?
            }
        };
        let biases = vec![0.0f32; if options.use_bias { options.filters } else { 0 }];
        let tail = BlockTail::new(
            options.filters,
            options.bn_training,
            options.activation,
            defaults,
        )?;

        debug!(
            scope = %options.scope,
            in_channels,
            filters = options.filters,
            kernel = ?options.kernel_size,
            strides = ?options.strides,
            initializer = %options.initializer,
            trainable = options.trainable,
            "built conv3d_transpose"
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

    pub fn options(&self) -> &Conv3dTransposeOptions {
        &self.options
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn is_trainable(&self) -> bool {
        self.options.trainable
    }

    pub fn batchnorm(&self) -> Option<&BatchNorm3D> {
        self.tail.batchnorm()
    }

    pub fn set_bn_training(&mut self, training: bool) {
        if let Some(bn) = self.tail.batchnorm_mut() {
            bn.set_training(training);
        }
    }

    fn geometry(&self, input: VolumeShape) -> Result<ConvGeometry> {
        if input.channels != self.in_channels {
            return Err(LayerError::ShapeMismatch(format!(
                "conv3d_transpose '{}' expects {} input channels, got {}",
                self.options.scope, self.in_channels, input.channels
            )));
        }
        ConvGeometry::transposed(
            input.spatial(),
            self.options.kernel_size,
            self.options.strides,
            self.options.padding,
        )
    }
}

impl Layer for Conv3DTransposeLayer {
    fn forward(&self, input: &Volume) -> Result<Volume> {
        let geom = self.geometry(input.shape())?;
        let mut net = conv_backward_input(&geom, input, &self.weights, self.options.filters)?;
        add_bias(&mut net, &self.biases);
        trace!(
            scope = %self.options.scope,
            input = %input.shape(),
            output = %net.shape(),
            "conv3d_transpose forward"
        );
        self.tail.forward(net)
    }

    fn backward(&self, input: &Volume, grad_output: &Volume) -> Result<Volume> {
        let geom = self.geometry(input.shape())?;
        let grad = self.tail.backward(grad_output)?;
        if self.options.trainable {
            accumulate_bias_grad(&grad, &mut self.grad_biases.borrow_mut());
            // the upsampled gradient sits on the input side of the forward convolution
            conv_backward_kernel(&geom, &grad, input, &mut self.grad_weights.borrow_mut())?;
        }
        conv_forward(&geom, &grad, &self.weights, self.in_channels)
    }

    fn update_parameters(&mut self, learning_rate: f32) {
        if self.options.trainable {
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
        }
        self.tail.update_parameters(learning_rate);
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        let geom = self.geometry(input)?;
        Ok(VolumeShape::from_spatial(input.batch, geom.input, self.options.filters))
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len() + self.tail.parameter_count()
    }

    fn scope(&self) -> &str {
        &self.options.scope
    }

    fn named_parameters(&self) -> Vec<(String, Vec<f32>)> {
        let scope = &self.options.scope;
        let mut params = vec![(
            scoped_name(scope, "conv3d_transpose/kernel"),
            self.weights.clone(),
        )];
        if !self.biases.is_empty() {
            params.push((scoped_name(scope, "conv3d_transpose/bias"), self.biases.clone()));
        }
        params.extend(self.tail.named_parameters(scope));
        params
    }
}
