//! Optional batch-norm and activation tail shared by the convolution blocks.

use crate::config::LayerDefaults;
use crate::error::{LayerError, Result};
use crate::layers::batchnorm::BatchNorm3D;
use crate::layers::r#trait::scoped_name;
use crate::utils::Activation;
use crate::volume::Volume;
use std::cell::RefCell;

/// `[batch norm] -> [activation]` applied after a convolution.
pub(crate) struct BlockTail {
    batchnorm: Option<BatchNorm3D>,
    activation: Option<Activation>,
    cached_pre_activation: RefCell<Option<Volume>>,
}

impl BlockTail {
    /// `bn_training`: `None` skips batch normalization, `Some(true)` normalizes
    /// with batch statistics, `Some(false)` with running statistics.
    pub(crate) fn new(
        channels: usize,
        bn_training: Option<bool>,
        activation: Option<Activation>,
        defaults: &LayerDefaults,
    ) -> Result<Self> {
        let batchnorm = match bn_training {
            Some(training) => Some(BatchNorm3D::new(
                channels,
                defaults.batchnorm_epsilon,
                defaults.batchnorm_momentum,
                training,
            )?),
            None => None,
        };
        Ok(Self {
            batchnorm,
            activation,
            cached_pre_activation: RefCell::new(None),
        })
    }

    pub(crate) fn batchnorm(&self) -> Option<&BatchNorm3D> {
        self.batchnorm.as_ref()
    }

    pub(crate) fn batchnorm_mut(&mut self) -> Option<&mut BatchNorm3D> {
        self.batchnorm.as_mut()
    }

    pub(crate) fn activation(&self) -> Option<Activation> {
        self.activation
    }

    pub(crate) fn forward(&self, mut net: Volume) -> Result<Volume> {
        if let Some(bn) = &self.batchnorm {
            net = bn.forward(&net)?;
        }
        if let Some(activation) = self.activation {
            *self.cached_pre_activation.borrow_mut() = Some(net.clone());
            activation.apply_inplace(net.data_mut());
        }
        Ok(net)
    }

    /// Gradient with respect to the convolution output.
    pub(crate) fn backward(&self, grad_output: &Volume) -> Result<Volume> {
        let mut grad = grad_output.clone();
        if let Some(activation) = self.activation {
            let cached = self.cached_pre_activation.borrow();
            let pre = cached.as_ref().ok_or_else(|| {
                LayerError::ShapeMismatch("backward called before forward".to_string())
            })?;
            if pre.shape() != grad.shape() {
                return Err(LayerError::ShapeMismatch(format!(
                    "gradient shape {} does not match forward output {}",
                    grad.shape(),
                    pre.shape()
                )));
            }
            activation.backward_inplace(pre.data(), grad.data_mut());
        }
        if let Some(bn) = &self.batchnorm {
            grad = bn.backward(&grad)?;
        }
        Ok(grad)
    }

    pub(crate) fn update_parameters(&mut self, learning_rate: f32) {
        if let Some(bn) = &mut self.batchnorm {
            bn.update_parameters(learning_rate);
        }
    }

    pub(crate) fn parameter_count(&self) -> usize {
        self.batchnorm.as_ref().map_or(0, |bn| bn.parameter_count())
    }

    pub(crate) fn named_parameters(&self, scope: &str) -> Vec<(String, Vec<f32>)> {
        let Some(bn) = &self.batchnorm else {
            return Vec::new();
        };
        let prefix = scoped_name(scope, "batch_normalization");
        vec![
            (format!("{}/gamma", prefix), bn.gamma().to_vec()),
            (format!("{}/beta", prefix), bn.beta().to_vec()),
            (format!("{}/moving_mean", prefix), bn.running_mean()),
            (format!("{}/moving_variance", prefix), bn.running_var()),
        ]
    }
}
