//! Batch normalization over channels-last volumes
//!
//! This module provides `BatchNorm3D`, which normalizes every channel of a volume
//! across the batch and all spatial positions, then applies a learnable scale
//! (gamma) and shift (beta):
//!
//! 1. Compute per-channel statistics: mean μ and biased variance σ²
//! 2. Normalize: x_norm = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ * x_norm + β
//!
//! In training mode the batch statistics are used and the running statistics are
//! updated with an exponential moving average. In inference mode the running
//! statistics are used instead.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::error::{LayerError, Result};
use crate::volume::Volume;
use std::cell::RefCell;

/// Per-channel batch normalization with running statistics.
///
/// Gamma starts at 1, beta at 0, the running mean at 0 and the running variance
/// at 1, so a fresh layer in inference mode is the identity up to epsilon.
pub struct BatchNorm3D {
    channels: usize,
    epsilon: f32,
    momentum: f32,
    training: bool,

    gamma: Vec<f32>,
    beta: Vec<f32>,

    grad_gamma: RefCell<Vec<f32>>,
    grad_beta: RefCell<Vec<f32>>,

    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,

    // Forward cache for the backward pass
    cached_normalized: RefCell<Vec<f32>>,
    cached_inv_std: RefCell<Vec<f32>>,
}

impl BatchNorm3D {
    /// Creates a batch normalization layer for `channels` feature maps.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `channels` is zero, `epsilon <= 0` or `momentum` is
    /// outside `[0, 1]`.
    pub fn new(channels: usize, epsilon: f32, momentum: f32, training: bool) -> Result<Self> {
        if channels == 0 {
            return Err(LayerError::InvalidParameter(
                "batch normalization needs at least 1 channel".to_string(),
            ));
        }
        if epsilon <= 0.0 {
            return Err(LayerError::InvalidParameter(
                "epsilon must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&momentum) {
            return Err(LayerError::InvalidParameter(
                "momentum must be in range [0.0, 1.0]".to_string(),
            ));
        }

        Ok(Self {
            channels,
            epsilon,
            momentum,
            training,
            gamma: vec![1.0f32; channels],
            beta: vec![0.0f32; channels],
            grad_gamma: RefCell::new(vec![0.0f32; channels]),
            grad_beta: RefCell::new(vec![0.0f32; channels]),
            running_mean: RefCell::new(vec![0.0f32; channels]),
            running_var: RefCell::new(vec![1.0f32; channels]),
            cached_normalized: RefCell::new(Vec::new()),
            cached_inv_std: RefCell::new(Vec::new()),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn gamma(&self) -> &[f32] {
        &self.gamma
    }

    pub fn beta(&self) -> &[f32] {
        &self.beta
    }

    /// Copy of the running mean.
    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    /// Copy of the running variance.
    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    /// Trainable parameter count: gamma plus beta.
    pub fn parameter_count(&self) -> usize {
        2 * self.channels
    }

    fn check_channels(&self, volume: &Volume) -> Result<()> {
        if volume.shape().channels != self.channels {
            return Err(LayerError::ShapeMismatch(format!(
                "batch normalization expects {} channels, got {}",
                self.channels,
                volume.shape().channels
            )));
        }
        Ok(())
    }

    /// Normalize `input` per channel.
    pub fn forward(&self, input: &Volume) -> Result<Volume> {
        self.check_channels(input)?;
        let c = self.channels;
        let x = input.data();
        let count = x.len() / c.max(1);

        let (mean, var) = if self.training {
            if count == 0 {
                return Err(LayerError::ShapeMismatch(
                    "batch normalization needs at least one sample in training mode".to_string(),
                ));
            }
            let mut mean = vec![0.0f32; c];
            let mut var = vec![0.0f32; c];
            for voxel in x.chunks_exact(c) {
                for (m, &v) in mean.iter_mut().zip(voxel) {
                    *m += v;
                }
            }
            for m in &mut mean {
                *m /= count as f32;
            }
            for voxel in x.chunks_exact(c) {
                for ((s, &v), &m) in var.iter_mut().zip(voxel).zip(&mean) {
                    let diff = v - m;
                    *s += diff * diff;
                }
            }
            for s in &mut var {
                *s /= count as f32;
            }

            // running = momentum * running + (1 - momentum) * batch
            let mut running_mean = self.running_mean.borrow_mut();
            let mut running_var = self.running_var.borrow_mut();
            for j in 0..c {
                running_mean[j] = self.momentum * running_mean[j] + (1.0 - self.momentum) * mean[j];
                running_var[j] = self.momentum * running_var[j] + (1.0 - self.momentum) * var[j];
            }
            (mean, var)
        } else {
            (self.running_mean(), self.running_var())
        };

        let inv_std: Vec<f32> = var
            .iter()
            .map(|&v| 1.0 / (v + self.epsilon).sqrt())
            .collect();

        let mut output = input.clone();
        let mut normalized = vec![0.0f32; x.len()];
        for (voxel, (out, norm)) in x.chunks_exact(c).zip(
            output
                .data_mut()
                .chunks_exact_mut(c)
                .zip(normalized.chunks_exact_mut(c)),
        ) {
            for j in 0..c {
                norm[j] = (voxel[j] - mean[j]) * inv_std[j];
                out[j] = self.gamma[j] * norm[j] + self.beta[j];
            }
        }

        *self.cached_normalized.borrow_mut() = normalized;
        *self.cached_inv_std.borrow_mut() = inv_std;
        Ok(output)
    }

    /// Gradient with respect to the input of the last `forward` call.
    /// Accumulates gamma and beta gradients.
    pub fn backward(&self, grad_output: &Volume) -> Result<Volume> {
        self.check_channels(grad_output)?;
        let c = self.channels;
        let g = grad_output.data();
        let normalized = self.cached_normalized.borrow();
        let inv_std = self.cached_inv_std.borrow();
        if normalized.len() != g.len() || inv_std.len() != c {
            return Err(LayerError::ShapeMismatch(
                "batch normalization backward called without a matching forward pass".to_string(),
            ));
        }

        let mut sum_g = vec![0.0f32; c];
        let mut sum_g_norm = vec![0.0f32; c];
        for (gv, nv) in g.chunks_exact(c).zip(normalized.chunks_exact(c)) {
            for j in 0..c {
                sum_g[j] += gv[j];
                sum_g_norm[j] += gv[j] * nv[j];
            }
        }

        {
            let mut grad_gamma = self.grad_gamma.borrow_mut();
            let mut grad_beta = self.grad_beta.borrow_mut();
            for j in 0..c {
                grad_gamma[j] += sum_g_norm[j];
                grad_beta[j] += sum_g[j];
            }
        }

        let mut grad_input = grad_output.clone();
        let gi = grad_input.data_mut();
        if self.training {
            // dx = gamma * inv_std / m * (m * g - sum(g) - x_norm * sum(g * x_norm))
            let m = (g.len() / c) as f32;
            for (gi_v, (gv, nv)) in gi
                .chunks_exact_mut(c)
                .zip(g.chunks_exact(c).zip(normalized.chunks_exact(c)))
            {
                for j in 0..c {
                    gi_v[j] = self.gamma[j] * inv_std[j] / m
                        * (m * gv[j] - sum_g[j] - nv[j] * sum_g_norm[j]);
                }
            }
        } else {
            for (gi_v, gv) in gi.chunks_exact_mut(c).zip(g.chunks_exact(c)) {
                for j in 0..c {
                    gi_v[j] = gv[j] * self.gamma[j] * inv_std[j];
                }
            }
        }
        Ok(grad_input)
    }

    /// Gradient step on gamma and beta, then clear the accumulators.
    pub fn update_parameters(&mut self, learning_rate: f32) {
        let mut grad_gamma = self.grad_gamma.borrow_mut();
        let mut grad_beta = self.grad_beta.borrow_mut();
        for j in 0..self.channels {
            self.gamma[j] -= learning_rate * grad_gamma[j];
            self.beta[j] -= learning_rate * grad_beta[j];
            grad_gamma[j] = 0.0;
            grad_beta[j] = 0.0;
        }
    }
}
