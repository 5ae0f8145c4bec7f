//! 3D upsampling with custom interpolation kernels
//!
//! Key features:
//! - Any separable upsampling kernel; nearest neighbour and trilinear are provided
//! - Border padding modes `CONSTANT`, `REFLECT` and `SYMMETRIC`
//!
//! Limitations:
//! - Only integer scales
//! - Only `valid` mode; `same` is accepted with a warning and treated as `valid`
//!
//! The input is first padded by one voxel per side so the interpolation has
//! neighbours at the border. Nearest neighbour then repeats every voxel `scale`
//! times per axis; trilinear runs a stride-`scale` transposed convolution with the
//! fixed interpolation kernel on each channel separately. Finally `scale` voxels
//! are cropped from the front of every axis.
//!
//! For an axis of length `n` the default output length is `scale·(n + 1) − 1`
//! (`2n + 1` for the default scale of 2).

use crate::error::{LayerError, Result};
use crate::kernels::trilinear_kernel;
use crate::layers::geometry::{
    conv_backward_input, conv_backward_kernel, conv_forward, ConvGeometry, Padding,
};
use crate::layers::r#trait::scoped_name;
use crate::layers::Layer;
use crate::volume::{
    crop_spatial, crop_spatial_adjoint, pad_spatial, pad_spatial_adjoint, PaddingMode, Volume,
    VolumeShape,
};
use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace, warn};

/// Border padding applied before interpolating.
const PAD_SIZE: usize = 1;

/// Interpolation scheme of [`Upsampling3DLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolator {
    #[default]
    Trilinear,
    NearestNeighbor,
}

impl FromStr for Interpolator {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trilinear" => Ok(Interpolator::Trilinear),
            "nearest_neighbor" => Ok(Interpolator::NearestNeighbor),
            _ => Err(LayerError::UnknownInterpolator {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Interpolator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpolator::Trilinear => write!(f, "trilinear"),
            Interpolator::NearestNeighbor => write!(f, "nearest_neighbor"),
        }
    }
}

/// Construction options of an [`Upsampling3DLayer`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpsamplingOptions {
    pub scope: String,
    /// Integer upsampling factor on every axis
    pub scale: usize,
    pub interpolator: Interpolator,
    /// Border handling; `Constant` carries the fill value
    pub padding_mode: PaddingMode,
    /// Whether the trilinear kernel receives gradient updates
    pub trainable: bool,
    pub padding: Padding,
    /// Requested spatial output extent; `None` gives `scale·(n + 1) − 1`
    pub output_shape_3d: Option<[usize; 3]>,
}

impl Default for UpsamplingOptions {
    fn default() -> Self {
        Self {
            scope: String::new(),
            scale: 2,
            interpolator: Interpolator::Trilinear,
            padding_mode: PaddingMode::Symmetric,
            trainable: false,
            padding: Padding::Valid,
            output_shape_3d: None,
        }
    }
}

/// Fixed-kernel 3D upsampling.
///
/// # Example
///
/// ```
/// use volumetric_nn::layers::{Layer, Upsampling3DLayer, UpsamplingOptions};
/// use volumetric_nn::volume::{Volume, VolumeShape};
///
/// let up = Upsampling3DLayer::new(UpsamplingOptions::default()).unwrap();
/// let input = Volume::filled(VolumeShape::new(1, 4, 4, 4, 2), 3.0);
/// let output = up.forward(&input).unwrap();
/// assert_eq!(output.shape(), VolumeShape::new(1, 9, 9, 9, 2));
/// assert!(output.data().iter().all(|v| (v - 3.0).abs() < 1e-5));
/// ```
pub struct Upsampling3DLayer {
    options: UpsamplingOptions,
    // [k, k, k, 1, 1] kernel shared by every channel; empty for nearest neighbour
    kernel: Vec<f32>,
    grad_kernel: RefCell<Vec<f32>>,
}

impl Upsampling3DLayer {
    /// # Errors
    ///
    /// `InvalidParameter` if `scale` is zero.
    pub fn new(options: UpsamplingOptions) -> Result<Self> {
        if options.scale == 0 {
            return Err(LayerError::InvalidParameter(
                "upsampling scale must be at least 1".to_string(),
            ));
        }
        if options.padding != Padding::Valid {
            warn!(
                scope = %options.scope,
                padding = %options.padding,
                "upsampling3d is only implemented for valid mode; falling back to valid"
            );
        }

        let kernel = match options.interpolator {
            Interpolator::Trilinear => trilinear_kernel(options.scale)?,
            Interpolator::NearestNeighbor => Vec::new(),
        };
        debug!(
            scope = %options.scope,
            scale = options.scale,
            interpolator = %options.interpolator,
            padding_mode = ?options.padding_mode,
            "built upsampling3d"
        );

        Ok(Self {
            grad_kernel: RefCell::new(vec![0.0f32; kernel.len()]),
            kernel,
            options,
        })
    }

    pub fn options(&self) -> &UpsamplingOptions {
        &self.options
    }

    pub fn scale(&self) -> usize {
        self.options.scale
    }

    pub fn interpolator(&self) -> Interpolator {
        self.options.interpolator
    }

    /// The `(2·scale − 1)³` interpolation kernel (empty for nearest neighbour).
    pub fn kernel(&self) -> &[f32] {
        &self.kernel
    }

    fn kernel_extent(&self) -> [usize; 3] {
        let k = 2 * self.options.scale - 1;
        [k, k, k]
    }

    /// Output spatial extent for input extent `spatial`, validating any
    /// requested `output_shape_3d`.
    fn target_extent(&self, spatial: [usize; 3]) -> Result<[usize; 3]> {
        let s = self.options.scale;
        let mut target = [0; 3];
        for axis in 0..3 {
            let n = spatial[axis];
            if n == 0 {
                return Err(LayerError::ShapeMismatch(
                    "cannot upsample an empty axis".to_string(),
                ));
            }
            let min = (n + 1) * s - 1;
            let max = match self.options.interpolator {
                Interpolator::Trilinear => (n + 2) * s - 2,
                Interpolator::NearestNeighbor => (n + 1) * s,
            };
            target[axis] = match self.options.output_shape_3d {
                None => min,
                Some(requested) => {
                    let r = requested[axis];
                    if r < min || r > max {
                        return Err(LayerError::ShapeMismatch(format!(
                            "output_shape_3d {:?} is incompatible with input {:?} at scale {} (axis {} accepts {}..={})",
                            requested, spatial, s, axis, min, max
                        )));
                    }
                    r
                }
            };
        }
        Ok(target)
    }

    /// Geometry of the trilinear transposed convolution on the padded input.
    fn trilinear_geometry(&self, padded: [usize; 3], target: [usize; 3]) -> Result<ConvGeometry> {
        let s = self.options.scale;
        let big = [
            target[0] + 2 * s * PAD_SIZE,
            target[1] + 2 * s * PAD_SIZE,
            target[2] + 2 * s * PAD_SIZE,
        ];
        ConvGeometry::transposed_to(padded, big, self.kernel_extent(), [s, s, s], Padding::Valid)
    }

    fn crop_start(&self) -> [usize; 3] {
        let front = self.options.scale * PAD_SIZE;
        [front, front, front]
    }

    /// Repeat every voxel `scale` times along each spatial axis.
    fn repeat_nearest(&self, input: &Volume) -> Volume {
        let s = self.options.scale;
        let shape = input.shape();
        let out_shape = VolumeShape::new(
            shape.batch,
            shape.depth * s,
            shape.height * s,
            shape.width * s,
            shape.channels,
        );
        Volume::from_fn(out_shape, |b, d, h, w, c| input.get(b, d / s, h / s, w / s, c))
    }

    /// Adjoint of [`Self::repeat_nearest`]: sum each `scale³` block.
    fn repeat_nearest_adjoint(&self, grad: &Volume, small: VolumeShape) -> Volume {
        let s = self.options.scale;
        let g = grad.shape();
        let mut out = Volume::zeros(small);
        for b in 0..g.batch {
            for d in 0..g.depth {
                for h in 0..g.height {
                    for w in 0..g.width {
                        for c in 0..g.channels {
                            let idx = small.offset(b, d / s, h / s, w / s, c);
                            out.data_mut()[idx] += grad.get(b, d, h, w, c);
                        }
                    }
                }
            }
        }
        out
    }

    fn pad_input(&self, input: &Volume) -> Result<Volume> {
        pad_spatial(input, PAD_SIZE, self.options.padding_mode)
    }
}

impl Layer for Upsampling3DLayer {
    fn forward(&self, input: &Volume) -> Result<Volume> {
        let shape = input.shape();
        let target = self.target_extent(shape.spatial())?;
        let padded = self.pad_input(input)?;

        let upsampled = match self.options.interpolator {
            Interpolator::NearestNeighbor => self.repeat_nearest(&padded),
            Interpolator::Trilinear => {
                let geom = self.trilinear_geometry(padded.shape().spatial(), target)?;
                let channels = (0..shape.channels)
                    .map(|c| conv_backward_input(&geom, &padded.channel(c)?, &self.kernel, 1))
                    .collect::<Result<Vec<_>>>()?;
                Volume::concat_channels(&channels)?
            }
        };

        let output = crop_spatial(&upsampled, self.crop_start(), target)?;
        trace!(
            scope = %self.options.scope,
            input = %shape,
            output = %output.shape(),
            "upsampling3d forward"
        );
        Ok(output)
    }

    fn backward(&self, input: &Volume, grad_output: &Volume) -> Result<Volume> {
        let shape = input.shape();
        let expected = self.output_shape(shape)?;
        if grad_output.shape() != expected {
            return Err(LayerError::ShapeMismatch(format!(
                "upsampling3d gradient has shape {}, expected {}",
                grad_output.shape(),
                expected
            )));
        }
        let target = expected.spatial();
        let padded_shape = VolumeShape::new(
            shape.batch,
            shape.depth + 2 * PAD_SIZE,
            shape.height + 2 * PAD_SIZE,
            shape.width + 2 * PAD_SIZE,
            shape.channels,
        );

        let grad_padded = match self.options.interpolator {
            Interpolator::NearestNeighbor => {
                let s = self.options.scale;
                let full = [
                    padded_shape.depth * s,
                    padded_shape.height * s,
                    padded_shape.width * s,
                ];
                let grad_full = crop_spatial_adjoint(grad_output, self.crop_start(), full)?;
                self.repeat_nearest_adjoint(&grad_full, padded_shape)
            }
            Interpolator::Trilinear => {
                let geom = self.trilinear_geometry(padded_shape.spatial(), target)?;
                let grad_full = crop_spatial_adjoint(grad_output, self.crop_start(), geom.input)?;
                let padded = if self.options.trainable {
                    Some(self.pad_input(input)?)
                } else {
                    None
                };

                let mut parts = Vec::with_capacity(shape.channels);
                for c in 0..shape.channels {
                    let grad_c = grad_full.channel(c)?;
                    if let Some(padded) = &padded {
                        conv_backward_kernel(
                            &geom,
                            &grad_c,
                            &padded.channel(c)?,
                            &mut self.grad_kernel.borrow_mut(),
                        )?;
                    }
                    parts.push(conv_forward(&geom, &grad_c, &self.kernel, 1)?);
                }
                Volume::concat_channels(&parts)?
            }
        };

        pad_spatial_adjoint(&grad_padded, shape, PAD_SIZE, self.options.padding_mode)
    }

    fn update_parameters(&mut self, learning_rate: f32) {
        if !self.options.trainable {
            return;
        }
        let mut grad_kernel = self.grad_kernel.borrow_mut();
        for (w, g) in self.kernel.iter_mut().zip(grad_kernel.iter_mut()) {
            *w -= learning_rate * *g;
            *g = 0.0;
        }
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        let target = self.target_extent(input.spatial())?;
        Ok(VolumeShape::from_spatial(input.batch, target, input.channels))
    }

    fn parameter_count(&self) -> usize {
        self.kernel.len()
    }

    fn scope(&self) -> &str {
        &self.options.scope
    }

    fn named_parameters(&self) -> Vec<(String, Vec<f32>)> {
        if self.kernel.is_empty() {
            return Vec::new();
        }
        vec![(
            scoped_name(&self.options.scope, "kernel_transposed_3d"),
            self.kernel.clone(),
        )]
    }
}
