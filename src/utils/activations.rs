//! Activation functions applied at the end of convolution blocks
//!
//! Three activations are supported, selected by name:
//! - `"LReLu"` / `"leaky_relu"`: leaky ReLU, negative slope 0.2 by default
//! - `"ReLu"` / `"relu"`: rectified linear unit
//! - `"ELu"` / `"elu"`: exponential linear unit, alpha 1.0 by default

use crate::error::{LayerError, Result};
use std::fmt;
use std::str::FromStr;

/// Default negative slope of the leaky ReLU.
pub const DEFAULT_LEAKY_RELU_ALPHA: f32 = 0.2;

/// Default alpha of the ELU.
pub const DEFAULT_ELU_ALPHA: f32 = 1.0;

/// Element-wise activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    LeakyRelu { alpha: f32 },
    Relu,
    Elu { alpha: f32 },
}

impl Activation {
    /// Parse an activation name. `context` names the operation in the error
    /// message (for example `"conv3d"`).
    pub fn parse(name: &str, context: &'static str) -> Result<Self> {
        match name {
            "LReLu" | "leaky_relu" => Ok(Activation::LeakyRelu {
                alpha: DEFAULT_LEAKY_RELU_ALPHA,
            }),
            "ReLu" | "relu" => Ok(Activation::Relu),
            "ELu" | "elu" => Ok(Activation::Elu {
                alpha: DEFAULT_ELU_ALPHA,
            }),
            _ => Err(LayerError::UnknownActivation {
                name: name.to_string(),
                context,
            }),
        }
    }

    /// Replace the slope/alpha with configured values.
    pub fn with_alphas(self, leaky_relu_alpha: f32, elu_alpha: f32) -> Self {
        match self {
            Activation::LeakyRelu { .. } => Activation::LeakyRelu {
                alpha: leaky_relu_alpha,
            },
            Activation::Relu => Activation::Relu,
            Activation::Elu { .. } => Activation::Elu { alpha: elu_alpha },
        }
    }

    /// Activation of a single value.
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Relu => x.max(0.0),
            Activation::Elu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * (x.exp() - 1.0)
                }
            }
        }
    }

    /// Derivative with respect to the pre-activation value `x`.
    #[inline]
    pub fn derivative(&self, x: f32) -> f32 {
        match *self {
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Elu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha * x.exp()
                }
            }
        }
    }

    /// Apply the activation in place.
    pub fn apply_inplace(&self, data: &mut [f32]) {
        for value in data.iter_mut() {
            *value = self.apply(*value);
        }
    }

    /// Multiply `grad` in place by the derivative evaluated at `pre_activation`.
    pub fn backward_inplace(&self, pre_activation: &[f32], grad: &mut [f32]) {
        for (g, &x) in grad.iter_mut().zip(pre_activation) {
            *g *= self.derivative(x);
        }
    }
}

impl FromStr for Activation {
    type Err = LayerError;

    /// Parse without an operation; errors report the context `"activation"`.
    fn from_str(s: &str) -> Result<Self> {
        Activation::parse(s, "activation")
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::LeakyRelu { .. } => write!(f, "LReLu"),
            Activation::Relu => write!(f, "ReLu"),
            Activation::Elu { .. } => write!(f, "ELu"),
        }
    }
}
