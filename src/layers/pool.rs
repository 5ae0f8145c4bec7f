//! 3D max pooling
//!
//! Slides a `pool_size` window over every channel and keeps the maximum. With
//! `same` padding the implicit border never wins the maximum.

use crate::error::{LayerError, Result};
use crate::layers::geometry::{ConvGeometry, Padding};
use crate::layers::Layer;
use crate::volume::{Volume, VolumeShape};
use std::cell::RefCell;
use tracing::{debug, trace};

/// 3D max pooling layer (no parameters).
///
/// Defaults mirror the usual volumetric pipeline: `2 × 2 × 2` windows with unit
/// strides and valid padding.
pub struct MaxPool3DLayer {
    pool_size: [usize; 3],
    strides: [usize; 3],
    padding: Padding,
    scope: String,
    // Flat input index of the winner for every output element
    cached_argmax: RefCell<Vec<usize>>,
}

impl MaxPool3DLayer {
    /// # Errors
    ///
    /// `InvalidParameter` if any pool extent or stride is zero.
    pub fn new(
        pool_size: [usize; 3],
        strides: [usize; 3],
        padding: Padding,
        scope: impl Into<String>,
    ) -> Result<Self> {
        if pool_size.contains(&0) || strides.contains(&0) {
            return Err(LayerError::InvalidParameter(
                "pool_size and strides must be at least 1 on every axis".to_string(),
            ));
        }
        let scope = scope.into();
        debug!(
            scope = %scope,
            pool = ?pool_size,
            strides = ?strides,
            padding = %padding,
            "built max_pooling3d"
        );
        Ok(Self {
            pool_size,
            strides,
            padding,
            scope,
            cached_argmax: RefCell::new(Vec::new()),
        })
    }

    pub fn pool_size(&self) -> [usize; 3] {
        self.pool_size
    }

    pub fn strides(&self) -> [usize; 3] {
        self.strides
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    fn geometry(&self, input: VolumeShape) -> Result<ConvGeometry> {
        ConvGeometry::conv(
            input.spatial(),
            self.pool_size,
            self.strides,
            [1, 1, 1],
            self.padding,
        )
    }
}

impl Default for MaxPool3DLayer {
    fn default() -> Self {
        Self {
            pool_size: [2, 2, 2],
            strides: [1, 1, 1],
            padding: Padding::Valid,
            scope: String::new(),
            cached_argmax: RefCell::new(Vec::new()),
        }
    }
}

impl Layer for MaxPool3DLayer {
    fn forward(&self, input: &Volume) -> Result<Volume> {
        let s = input.shape();
        let geom = self.geometry(s)?;
        let out_shape = VolumeShape::from_spatial(s.batch, geom.output, s.channels);
        let c = s.channels;
        let in_sample = s.voxels() * c;
        let out_sample = out_shape.voxels() * c;

        let mut output = Volume::filled(out_shape, f32::NEG_INFINITY);
        let mut argmax = vec![usize::MAX; out_shape.len()];
        let x = input.data();
        let y = output.data_mut();

        for b in 0..s.batch {
            geom.for_each_tap(|o, i, _| {
                for ch in 0..c {
                    let src = b * in_sample + i * c + ch;
                    let dst = b * out_sample + o * c + ch;
                    // strict comparison keeps the first maximum on ties
                    if argmax[dst] == usize::MAX || x[src] > y[dst] {
                        y[dst] = x[src];
                        argmax[dst] = src;
                    }
                }
            });
        }

        trace!(scope = %self.scope, input = %s, output = %out_shape, "max_pooling3d forward");
        *self.cached_argmax.borrow_mut() = argmax;
        Ok(output)
    }

    fn backward(&self, input: &Volume, grad_output: &Volume) -> Result<Volume> {
        let expected = self.output_shape(input.shape())?;
        if grad_output.shape() != expected {
            return Err(LayerError::ShapeMismatch(format!(
                "max_pooling3d gradient has shape {}, expected {}",
                grad_output.shape(),
                expected
            )));
        }
        let argmax = self.cached_argmax.borrow();
        if argmax.len() != expected.len() {
            return Err(LayerError::ShapeMismatch(
                "max_pooling3d backward called without a matching forward pass".to_string(),
            ));
        }

        let mut grad_input = Volume::zeros(input.shape());
        let gi = grad_input.data_mut();
        for (&src, &g) in argmax.iter().zip(grad_output.data()) {
            if src != usize::MAX {
                gi[src] += g;
            }
        }
        Ok(grad_input)
    }

    fn update_parameters(&mut self, _learning_rate: f32) {}

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        let geom = self.geometry(input)?;
        Ok(VolumeShape::from_spatial(input.batch, geom.output, input.channels))
    }

    fn parameter_count(&self) -> usize {
        0
    }

    fn scope(&self) -> &str {
        &self.scope
    }
}
