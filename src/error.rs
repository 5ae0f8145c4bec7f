//! Error type shared by every layer constructor and forward/backward pass.

use thiserror::Error;

/// Errors raised while configuring or running volumetric layers.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Activation name not recognised.
    #[error("activation={name} is not defined in {context}. Valid options: \"ReLu\", \"LReLu\", \"ELu\"")]
    UnknownActivation { name: String, context: &'static str },

    /// Kernel initializer name not recognised.
    #[error("initializer={name} is not defined in conv3d_transpose. Valid options: \"trilinear\"")]
    UnknownInitializer { name: String },

    /// Upsampling interpolator name not recognised.
    #[error("interpolator={name} is not defined in upsampling3d. Valid options: \"trilinear\", \"nearest_neighbor\"")]
    UnknownInterpolator { name: String },

    /// Border padding mode not recognised.
    #[error("padding_mode={name} is not defined. Valid options: \"CONSTANT\", \"REFLECT\", \"SYMMETRIC\"")]
    UnknownPaddingMode { name: String },

    /// Convolution padding scheme not recognised.
    #[error("padding={name} is not defined. Valid options: \"valid\", \"same\"")]
    UnknownPadding { name: String },

    /// A numeric parameter is out of its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Tensor shapes do not line up.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Architecture or defaults file is structurally invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LayerError>;
