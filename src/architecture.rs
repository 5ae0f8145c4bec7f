//! Architecture configuration structures
//!
//! This module provides configuration structures for defining volumetric network
//! architectures via JSON configuration files, so encoder/decoder layouts can be
//! changed without touching code.

use crate::config::{validate_defaults, LayerDefaults};
use crate::error::{LayerError, Result};
use crate::layers::{
    Conv3DLayer, Conv3DTransposeLayer, Conv3dOptions, Conv3dTransposeOptions, Interpolator,
    KernelInitializer, Layer, MaxPool3DLayer, Padding, Upsampling3DLayer, UpsamplingOptions,
};
use crate::utils::{Activation, SimpleRng};
use crate::volume::{PaddingMode, Volume, VolumeShape};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// A 3D extent given either as one number for every axis or as `[d, h, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Extent3 {
    Uniform(usize),
    PerAxis([usize; 3]),
}

impl Extent3 {
    pub fn to_array(self) -> [usize; 3] {
        match self {
            Extent3::Uniform(n) => [n, n, n],
            Extent3::PerAxis(a) => a,
        }
    }
}

/// Configuration for a single layer of the network.
///
/// Different layer types use different fields:
///
/// - **conv3d**: requires `filters` and `kernel_size`; optional `padding`, `bn_training`,
///   `dilation_rate`, `strides`, `activation`, `use_bias`
/// - **conv3d_transpose**: requires `filters` and `kernel_size`; optional `padding`,
///   `bn_training`, `strides`, `activation`, `use_bias`, `initializer`, `trainable`
/// - **upsampling3d**: optional `scale`, `interpolator`, `padding_mode`, `padding_constant`,
///   `trainable`, `padding`, `output_shape_3d`
/// - **max_pooling3d**: optional `pool_size`, `strides`, `padding`
///
/// # Examples
///
/// ```json
/// {
///   "layer_type": "conv3d",
///   "scope": "enc1",
///   "filters": 16,
///   "kernel_size": 3,
///   "bn_training": true,
///   "activation": "ReLu"
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    /// "conv3d", "conv3d_transpose", "upsampling3d" or "max_pooling3d"
    pub layer_type: String,
    /// Scope prefix for parameter names; must be unique when set
    pub scope: Option<String>,

    // Convolution parameters
    pub filters: Option<usize>,
    pub kernel_size: Option<Extent3>,
    /// "valid" (default) or "same"
    pub padding: Option<String>,
    /// Absent: no batch normalization, true: training mode, false: inference mode
    pub bn_training: Option<bool>,
    pub dilation_rate: Option<Extent3>,
    pub strides: Option<Extent3>,
    /// "ReLu", "LReLu" or "ELu"
    pub activation: Option<String>,
    pub use_bias: Option<bool>,
    /// Only "trilinear" is recognised
    pub initializer: Option<String>,
    pub trainable: Option<bool>,

    // Upsampling parameters
    pub scale: Option<usize>,
    /// "trilinear" (default) or "nearest_neighbor"
    pub interpolator: Option<String>,
    /// "CONSTANT", "REFLECT" or "SYMMETRIC" (default)
    pub padding_mode: Option<String>,
    pub padding_constant: Option<f32>,
    pub output_shape_3d: Option<[usize; 3]>,

    // Pooling parameters
    pub pool_size: Option<Extent3>,
}

impl LayerConfig {
    /// Names of the type-specific fields set in this entry.
    fn present_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("filters", self.filters.is_some()),
            ("kernel_size", self.kernel_size.is_some()),
            ("padding", self.padding.is_some()),
            ("bn_training", self.bn_training.is_some()),
            ("dilation_rate", self.dilation_rate.is_some()),
            ("strides", self.strides.is_some()),
            ("activation", self.activation.is_some()),
            ("use_bias", self.use_bias.is_some()),
            ("initializer", self.initializer.is_some()),
            ("trainable", self.trainable.is_some()),
            ("scale", self.scale.is_some()),
            ("interpolator", self.interpolator.is_some()),
            ("padding_mode", self.padding_mode.is_some()),
            ("padding_constant", self.padding_constant.is_some()),
            ("output_shape_3d", self.output_shape_3d.is_some()),
            ("pool_size", self.pool_size.is_some()),
        ];
        fields
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| name)
            .collect()
    }
}

const CONV3D_FIELDS: &[&str] = &[
    "filters",
    "kernel_size",
    "padding",
    "bn_training",
    "dilation_rate",
    "strides",
    "activation",
    "use_bias",
];
const CONV3D_TRANSPOSE_FIELDS: &[&str] = &[
    "filters",
    "kernel_size",
    "padding",
    "bn_training",
    "strides",
    "activation",
    "use_bias",
    "initializer",
    "trainable",
];
const UPSAMPLING3D_FIELDS: &[&str] = &[
    "scale",
    "interpolator",
    "padding_mode",
    "padding_constant",
    "trainable",
    "padding",
    "output_shape_3d",
];
const MAX_POOLING3D_FIELDS: &[&str] = &["pool_size", "strides", "padding"];

/// Configuration for the entire architecture.
///
/// # Example
///
/// ```json
/// {
///   "input_shape": [16, 16, 16, 1],
///   "defaults": { "seed": 7 },
///   "layers": [
///     { "layer_type": "conv3d", "scope": "enc1", "filters": 8, "kernel_size": 3, "padding": "same", "activation": "ReLu" },
///     { "layer_type": "max_pooling3d", "scope": "pool1", "pool_size": 2, "strides": 2 },
///     { "layer_type": "upsampling3d", "scope": "up1" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchitectureConfig {
    /// Per-sample input extent `[depth, height, width, channels]`
    pub input_shape: [usize; 4],
    /// Shared hyperparameters
    #[serde(default)]
    pub defaults: LayerDefaults,
    /// Layers in application order
    pub layers: Vec<LayerConfig>,
}

impl ArchitectureConfig {
    /// Input shape for a batch of `batch` samples.
    pub fn input_volume_shape(&self, batch: usize) -> VolumeShape {
        let [d, h, w, c] = self.input_shape;
        VolumeShape::new(batch, d, h, w, c)
    }
}

/// Loads an architecture configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it and validates the whole layer chain.
///
/// # Examples
///
/// ```no_run
/// use volumetric_nn::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/unet_small.json").unwrap();
/// assert!(!arch.layers.is_empty());
/// ```
pub fn load_architecture<P: AsRef<Path>>(path: P) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

fn invalid(index: usize, message: impl std::fmt::Display) -> LayerError {
    LayerError::InvalidConfig(format!("Layer {}: {}", index, message))
}

fn require<T>(value: Option<T>, index: usize, layer_type: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| invalid(index, format!("{} layer missing {}", layer_type, field)))
}

/// Rejects fields that `layer_type` does not use.
fn check_fields(
    layer: &LayerConfig,
    index: usize,
    layer_type: &str,
    allowed: &[&str],
) -> Result<()> {
    match layer
        .present_fields()
        .into_iter()
        .find(|field| !allowed.contains(field))
    {
        Some(field) => Err(invalid(
            index,
            format!("{} layer does not accept {}", layer_type, field),
        )),
        None => Ok(()),
    }
}

fn parse_padding(layer: &LayerConfig) -> Result<Padding> {
    layer.padding.as_deref().map_or(Ok(Padding::Valid), str::parse)
}

/// Named activation with the slopes taken from `defaults`.
fn parse_activation(
    layer: &LayerConfig,
    context: &'static str,
    defaults: &LayerDefaults,
) -> Result<Option<Activation>> {
    layer
        .activation
        .as_deref()
        .map(|name| {
            Activation::parse(name, context)
                .map(|a| a.with_alphas(defaults.leaky_relu_alpha, defaults.elu_alpha))
        })
        .transpose()
}

/// Builds one layer given the channel count it receives.
fn build_layer(
    layer: &LayerConfig,
    index: usize,
    in_channels: usize,
    defaults: &LayerDefaults,
    rng: &mut SimpleRng,
) -> Result<Box<dyn Layer>> {
    let scope = layer.scope.clone().unwrap_or_default();
    let layer_type = layer.layer_type.to_lowercase();

    let built: Box<dyn Layer> = match layer_type.as_str() {
        "conv3d" => {
            check_fields(layer, index, "conv3d", CONV3D_FIELDS)?;
            let filters = require(layer.filters, index, "conv3d", "filters")?;
            let kernel_size = require(layer.kernel_size, index, "conv3d", "kernel_size")?;
            let options = Conv3dOptions {
                padding: parse_padding(layer)?,
                bn_training: layer.bn_training,
                dilation_rate: layer.dilation_rate.map_or([1, 1, 1], Extent3::to_array),
                strides: layer.strides.map_or([1, 1, 1], Extent3::to_array),
                scope,
                activation: parse_activation(layer, "conv3d", defaults)?,
                use_bias: layer.use_bias.unwrap_or(true),
                ..Conv3dOptions::new(filters, kernel_size.to_array())
            };
            Box::new(Conv3DLayer::new(in_channels, options, defaults, rng)?)
        }
        "conv3d_transpose" => {
            check_fields(layer, index, "conv3d_transpose", CONV3D_TRANSPOSE_FIELDS)?;
            let filters = require(layer.filters, index, "conv3d_transpose", "filters")?;
            let kernel_size = require(layer.kernel_size, index, "conv3d_transpose", "kernel_size")?;
            let options = Conv3dTransposeOptions {
                padding: parse_padding(layer)?,
                bn_training: layer.bn_training,
                strides: layer.strides.map_or([1, 1, 1], Extent3::to_array),
                scope,
                activation: parse_activation(layer, "conv3d_transpose", defaults)?,
                use_bias: layer.use_bias.unwrap_or(false),
                initializer: KernelInitializer::parse(layer.initializer.as_deref())?,
                trainable: layer.trainable.unwrap_or(true),
                ..Conv3dTransposeOptions::new(filters, kernel_size.to_array())
            };
            Box::new(Conv3DTransposeLayer::new(in_channels, options, defaults, rng)?)
        }
        "upsampling3d" => {
            check_fields(layer, index, "upsampling3d", UPSAMPLING3D_FIELDS)?;
            let interpolator = layer
                .interpolator
                .as_deref()
                .map_or(Ok(Interpolator::Trilinear), str::parse)?;
            let padding_mode = PaddingMode::parse(
                layer.padding_mode.as_deref().unwrap_or("SYMMETRIC"),
                layer.padding_constant,
            )?;
            let constant_mode = matches!(padding_mode, PaddingMode::Constant(_));
            if layer.padding_constant.is_some() && !constant_mode {
                return Err(invalid(index, "padding_constant requires padding_mode CONSTANT"));
            }
            let options = UpsamplingOptions {
                scope,
                scale: layer.scale.unwrap_or(2),
                interpolator,
                padding_mode,
                trainable: layer.trainable.unwrap_or(false),
                padding: parse_padding(layer)?,
                output_shape_3d: layer.output_shape_3d,
            };
            Box::new(Upsampling3DLayer::new(options)?)
        }
        "max_pooling3d" => {
            check_fields(layer, index, "max_pooling3d", MAX_POOLING3D_FIELDS)?;
            let pool_size = layer.pool_size.map_or([2, 2, 2], Extent3::to_array);
            let strides = layer.strides.map_or([1, 1, 1], Extent3::to_array);
            Box::new(MaxPool3DLayer::new(pool_size, strides, parse_padding(layer)?, scope)?)
        }
        _ => {
            return Err(invalid(
                index,
                format!(
                    "Invalid layer type '{}'. Must be one of: conv3d, conv3d_transpose, upsampling3d, max_pooling3d",
                    layer.layer_type
                ),
            ));
        }
    };
    Ok(built)
}

/// Validates an architecture configuration.
///
/// Checks that the layer list is non-empty, the defaults are in range, scopes are
/// unique, every layer is well formed, and every layer accepts the shape produced
/// by the previous one.
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    build_model(config, &mut SimpleRng::new(config.defaults.seed)).map(|_| ())
}

/// Builds a model from an architecture configuration.
///
/// Layers are created in order; the channel count of each layer's input is taken
/// from the output shape of the previous layer.
///
/// # Returns
///
/// A vector of boxed trait objects implementing the Layer trait, ordered as specified in config.
///
/// # Examples
///
/// ```no_run
/// use volumetric_nn::architecture::{build_model, load_architecture};
/// use volumetric_nn::utils::SimpleRng;
///
/// let config = load_architecture("config/architectures/unet_small.json").unwrap();
/// let mut rng = SimpleRng::new(config.defaults.seed);
/// let layers = build_model(&config, &mut rng).unwrap();
/// assert_eq!(layers.len(), config.layers.len());
/// ```
pub fn build_model(
    config: &ArchitectureConfig,
    rng: &mut SimpleRng,
) -> Result<Vec<Box<dyn Layer>>> {
    if config.layers.is_empty() {
        return Err(LayerError::InvalidConfig(
            "Architecture must have at least one layer".to_string(),
        ));
    }
    if config.input_shape.contains(&0) {
        return Err(LayerError::InvalidConfig(
            "input_shape entries must be positive".to_string(),
        ));
    }
    validate_defaults(&config.defaults)?;

    let mut scopes = HashSet::new();
    let mut shape = config.input_volume_shape(1);
    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());

    for (i, layer_config) in config.layers.iter().enumerate() {
        if let Some(scope) = layer_config.scope.as_deref().filter(|s| !s.is_empty()) {
            if !scopes.insert(scope) {
                return Err(invalid(i, format!("duplicate scope '{}'", scope)));
            }
        }

        let layer = build_layer(layer_config, i, shape.channels, &config.defaults, rng)
            .map_err(|e| match e {
                LayerError::InvalidConfig(_) => e,
                other => invalid(i, other),
            })?;
        let next = layer.output_shape(shape).map_err(|e| invalid(i, e))?;
        debug!(
            index = i,
            layer_type = %layer_config.layer_type,
            scope = layer.scope(),
            input = %shape,
            output = %next,
            parameters = layer.parameter_count(),
            "added layer"
        );
        shape = next;
        layers.push(layer);
    }

    Ok(layers)
}

/// Runs `input` through every layer in order.
pub fn forward_model(layers: &[Box<dyn Layer>], input: &Volume) -> Result<Volume> {
    let mut net = input.clone();
    for layer in layers {
        net = layer.forward(&net)?;
    }
    Ok(net)
}

/// Output shape of the whole model for `input`.
pub fn model_output_shape(layers: &[Box<dyn Layer>], input: VolumeShape) -> Result<VolumeShape> {
    layers
        .iter()
        .try_fold(input, |shape, layer| layer.output_shape(shape))
}
