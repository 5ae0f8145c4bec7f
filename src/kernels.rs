//! Fixed interpolation kernels for transposed-convolution upsampling
//!
//! The trilinear kernel is the outer product of one 1D triangle function per axis.
//! Used as the weights of a stride-`scale` transposed convolution, every output voxel
//! becomes a linear-interpolation weighted average of its neighbouring input voxels.
//!
//! For `scale = 2` the 1D triangle is `[0.5, 1.0, 0.5]` and the 3D kernel is
//! `3 × 3 × 3` with a centre weight of 1.

use crate::error::{LayerError, Result};

/// 1D triangle (linear interpolation) kernel of length `2·scale − 1`.
///
/// Tap `i` has weight `1 − |i − (scale − 1)| / scale`.
pub fn up_kernel_1d(scale: usize) -> Result<Vec<f32>> {
    if scale == 0 {
        return Err(LayerError::InvalidParameter(
            "upsampling scale must be at least 1".to_string(),
        ));
    }
    let centre = (scale - 1) as f32;
    let s = scale as f32;
    Ok((0..2 * scale - 1)
        .map(|i| 1.0 - (i as f32 - centre).abs() / s)
        .collect())
}

/// Separable interpolation kernel with a per-axis scale.
///
/// The result is row-major with the first axis slowest; its extent along axis
/// `a` is `2·scales[a] − 1`.
pub fn separable_up_kernel(scales: &[usize]) -> Result<Vec<f32>> {
    if scales.is_empty() {
        return Err(LayerError::InvalidParameter(
            "kernel dimension must be at least 1".to_string(),
        ));
    }

    let mut kernel = vec![1.0f32];
    for &scale in scales {
        let axis = up_kernel_1d(scale)?;
        let mut next = Vec::with_capacity(kernel.len() * axis.len());
        for &outer in &kernel {
            for &inner in &axis {
                next.push(outer * inner);
            }
        }
        kernel = next;
    }
    Ok(kernel)
}

/// Isotropic `dim`-dimensional linear-interpolation kernel.
///
/// `bilinear_up_kernel(3, 2)` is the `3 × 3 × 3` trilinear kernel.
pub fn bilinear_up_kernel(dim: usize, scale: usize) -> Result<Vec<f32>> {
    separable_up_kernel(&vec![scale; dim])
}

/// The 3D trilinear kernel, extent `2·scale − 1` on every axis.
pub fn trilinear_kernel(scale: usize) -> Result<Vec<f32>> {
    bilinear_up_kernel(3, scale)
}

/// Per-axis scale implied by an odd kernel extent `k = 2·scale − 1`.
pub fn scale_for_extent(extent: usize) -> Result<usize> {
    if extent == 0 || extent % 2 == 0 {
        return Err(LayerError::InvalidParameter(format!(
            "trilinear kernel extent must be odd, got {}",
            extent
        )));
    }
    Ok((extent + 1) / 2)
}
