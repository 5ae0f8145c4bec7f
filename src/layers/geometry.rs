//! Convolution geometry and the three strided-convolution kernels
//!
//! A `ConvGeometry` describes how a (possibly strided, dilated, padded) 3D
//! convolution maps input voxels to output voxels. The same tap enumeration drives
//! the forward pass, the gradient with respect to the input, and the gradient with
//! respect to the kernel. A transposed convolution is the input-gradient of the
//! convolution running in the opposite direction, so it reuses these routines.
//!
//! Kernels are stored as `[kd, kh, kw, conv_in_channels, conv_out_channels]`.

use crate::error::{LayerError, Result};
use crate::volume::{Volume, VolumeShape};
use std::fmt;
use std::str::FromStr;

/// Spatial padding scheme for convolutions and pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    /// No implicit padding; windows must fit inside the input.
    #[default]
    Valid,
    /// Pad so that `output = ceil(input / stride)`.
    Same,
}

impl FromStr for Padding {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "valid" => Ok(Padding::Valid),
            "same" => Ok(Padding::Same),
            _ => Err(LayerError::UnknownPadding {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Padding::Valid => write!(f, "valid"),
            Padding::Same => write!(f, "same"),
        }
    }
}

/// Output length and front padding of one convolution axis.
///
/// `kernel` is the effective extent `(k − 1)·dilation + 1`.
pub fn conv_axis(
    n: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize)> {
    if stride == 0 || kernel == 0 {
        return Err(LayerError::InvalidParameter(
            "kernel size, stride and dilation must be at least 1".to_string(),
        ));
    }
    match padding {
        Padding::Valid => {
            if n < kernel {
                return Err(LayerError::ShapeMismatch(format!(
                    "input length {} is smaller than the kernel extent {}",
                    n, kernel
                )));
            }
            Ok(((n - kernel) / stride + 1, 0))
        }
        Padding::Same => {
            if n == 0 {
                return Err(LayerError::ShapeMismatch(
                    "cannot convolve an empty axis".to_string(),
                ));
            }
            let out = n.div_ceil(stride);
            let total = ((out - 1) * stride + kernel).saturating_sub(n);
            Ok((out, total / 2))
        }
    }
}

/// Output length of one transposed-convolution axis.
pub fn conv_transpose_axis(
    n: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<usize> {
    if stride == 0 || kernel == 0 {
        return Err(LayerError::InvalidParameter(
            "kernel size and stride must be at least 1".to_string(),
        ));
    }
    if n == 0 {
        return Err(LayerError::ShapeMismatch(
            "cannot upsample an empty axis".to_string(),
        ));
    }
    Ok(match padding {
        Padding::Valid => (n - 1) * stride + kernel,
        Padding::Same => n * stride,
    })
}

/// Index mapping of a 3D convolution from `input` spatial extents to `output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub input: [usize; 3],
    pub output: [usize; 3],
    pub kernel: [usize; 3],
    pub strides: [usize; 3],
    pub dilation: [usize; 3],
    pub pad_front: [usize; 3],
}

impl ConvGeometry {
    /// Geometry of a forward convolution over `input`.
    pub fn conv(
        input: [usize; 3],
        kernel: [usize; 3],
        strides: [usize; 3],
        dilation: [usize; 3],
        padding: Padding,
    ) -> Result<Self> {
        let mut output = [0; 3];
        let mut pad_front = [0; 3];
        for axis in 0..3 {
            if dilation[axis] == 0 || kernel[axis] == 0 {
                return Err(LayerError::InvalidParameter(
                    "kernel size, stride and dilation must be at least 1".to_string(),
                ));
            }
            let effective = (kernel[axis] - 1) * dilation[axis] + 1;
            let (out, front) = conv_axis(input[axis], effective, strides[axis], padding)?;
            output[axis] = out;
            pad_front[axis] = front;
        }
        Ok(Self {
            input,
            output,
            kernel,
            strides,
            dilation,
            pad_front,
        })
    }

    /// Geometry of the convolution whose input-gradient is the transposed
    /// convolution of a volume with spatial extents `small`.
    ///
    /// `input` of the returned geometry is the upsampled extent.
    pub fn transposed(
        small: [usize; 3],
        kernel: [usize; 3],
        strides: [usize; 3],
        padding: Padding,
    ) -> Result<Self> {
        let mut big = [0; 3];
        for axis in 0..3 {
            big[axis] = conv_transpose_axis(small[axis], kernel[axis], strides[axis], padding)?;
        }
        Self::transposed_to(small, big, kernel, strides, padding)
    }

    /// Like [`ConvGeometry::transposed`] with an explicit upsampled extent.
    /// Fails when `big` would not convolve back down to `small`.
    pub fn transposed_to(
        small: [usize; 3],
        big: [usize; 3],
        kernel: [usize; 3],
        strides: [usize; 3],
        padding: Padding,
    ) -> Result<Self> {
        let geom = Self::conv(big, kernel, strides, [1, 1, 1], padding)?;
        if geom.output != small {
            return Err(LayerError::ShapeMismatch(format!(
                "transposed convolution output {:?} is inconsistent with input {:?} for kernel {:?} and strides {:?}",
                big, small, kernel, strides
            )));
        }
        Ok(geom)
    }

    pub fn kernel_volume(&self) -> usize {
        self.kernel[0] * self.kernel[1] * self.kernel[2]
    }

    /// Call `f(output_voxel, input_voxel, kernel_tap)` for every tap that
    /// lands inside the input. Indices are flat within one sample.
    pub fn for_each_tap<F: FnMut(usize, usize, usize)>(&self, mut f: F) {
        let [od_n, oh_n, ow_n] = self.output;
        let [kd_n, kh_n, kw_n] = self.kernel;
        for od in 0..od_n {
            for oh in 0..oh_n {
                for ow in 0..ow_n {
                    let out_vox = (od * oh_n + oh) * ow_n + ow;
                    let base = [od, oh, ow];
                    for kd in 0..kd_n {
                        let Some(id) = self.input_coord(0, base[0], kd) else {
                            continue;
                        };
                        for kh in 0..kh_n {
                            let Some(ih) = self.input_coord(1, base[1], kh) else {
                                continue;
                            };
                            for kw in 0..kw_n {
                                let Some(iw) = self.input_coord(2, base[2], kw) else {
                                    continue;
                                };
                                let in_vox = (id * self.input[1] + ih) * self.input[2] + iw;
                                let tap = (kd * kh_n + kh) * kw_n + kw;
                                f(out_vox, in_vox, tap);
                            }
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn input_coord(&self, axis: usize, out: usize, k: usize) -> Option<usize> {
        let pos = (out * self.strides[axis] + k * self.dilation[axis]) as isize
            - self.pad_front[axis] as isize;
        if pos >= 0 && (pos as usize) < self.input[axis] {
            Some(pos as usize)
        } else {
            None
        }
    }

    fn check_spatial(&self, shape: VolumeShape, expected: [usize; 3], what: &str) -> Result<()> {
        if shape.spatial() != expected {
            return Err(LayerError::ShapeMismatch(format!(
                "{} has spatial extent {:?}, expected {:?}",
                what,
                shape.spatial(),
                expected
            )));
        }
        Ok(())
    }
}

fn check_kernel(kernel: &[f32], geom: &ConvGeometry, cin: usize, cout: usize) -> Result<()> {
    let expected = geom.kernel_volume() * cin * cout;
    if kernel.len() != expected {
        return Err(LayerError::ShapeMismatch(format!(
            "kernel has {} weights, expected {}",
            kernel.len(),
            expected
        )));
    }
    Ok(())
}

/// Forward convolution: `out[o, co] = Σ in[i, ci] · w[tap, ci, co]`.
pub fn conv_forward(
    geom: &ConvGeometry,
    input: &Volume,
    kernel: &[f32],
    cout: usize,
) -> Result<Volume> {
    let s = input.shape();
    geom.check_spatial(s, geom.input, "convolution input")?;
    let cin = s.channels;
    check_kernel(kernel, geom, cin, cout)?;

    let out_shape = VolumeShape::from_spatial(s.batch, geom.output, cout);
    let in_sample = s.voxels() * cin;
    let out_sample = out_shape.voxels() * cout;
    let x = input.data();
    let mut out = Volume::zeros(out_shape);
    let y = out.data_mut();

    for b in 0..s.batch {
        let xb = &x[b * in_sample..(b + 1) * in_sample];
        let yb = &mut y[b * out_sample..(b + 1) * out_sample];
        geom.for_each_tap(|o, i, tap| {
            let xi = &xb[i * cin..(i + 1) * cin];
            let yo = &mut yb[o * cout..(o + 1) * cout];
            let w = &kernel[tap * cin * cout..(tap + 1) * cin * cout];
            for (ci, &xv) in xi.iter().enumerate() {
                let row = &w[ci * cout..(ci + 1) * cout];
                for (yv, &wv) in yo.iter_mut().zip(row) {
                    *yv += xv * wv;
                }
            }
        });
    }
    Ok(out)
}

/// Gradient of [`conv_forward`] with respect to its input:
/// `gin[i, ci] = Σ gout[o, co] · w[tap, ci, co]`.
///
/// With `grad_output` being any volume on the output grid this is the
/// transposed convolution.
pub fn conv_backward_input(
    geom: &ConvGeometry,
    grad_output: &Volume,
    kernel: &[f32],
    cin: usize,
) -> Result<Volume> {
    let s = grad_output.shape();
    geom.check_spatial(s, geom.output, "convolution output gradient")?;
    let cout = s.channels;
    check_kernel(kernel, geom, cin, cout)?;

    let in_shape = VolumeShape::from_spatial(s.batch, geom.input, cin);
    let in_sample = in_shape.voxels() * cin;
    let out_sample = s.voxels() * cout;
    let g = grad_output.data();
    let mut grad_input = Volume::zeros(in_shape);
    let gi = grad_input.data_mut();

    for b in 0..s.batch {
        let gb = &g[b * out_sample..(b + 1) * out_sample];
        let gib = &mut gi[b * in_sample..(b + 1) * in_sample];
        geom.for_each_tap(|o, i, tap| {
            let go = &gb[o * cout..(o + 1) * cout];
            let gii = &mut gib[i * cin..(i + 1) * cin];
            let w = &kernel[tap * cin * cout..(tap + 1) * cin * cout];
            for (ci, acc) in gii.iter_mut().enumerate() {
                let row = &w[ci * cout..(ci + 1) * cout];
                *acc += go.iter().zip(row).map(|(a, b)| a * b).sum::<f32>();
            }
        });
    }
    Ok(grad_input)
}

/// Accumulate the kernel gradient `gw[tap, ci, co] += Σ in[i, ci] · gout[o, co]`.
pub fn conv_backward_kernel(
    geom: &ConvGeometry,
    input: &Volume,
    grad_output: &Volume,
    grad_kernel: &mut [f32],
) -> Result<()> {
    let si = input.shape();
    let so = grad_output.shape();
    geom.check_spatial(si, geom.input, "convolution input")?;
    geom.check_spatial(so, geom.output, "convolution output gradient")?;
    if si.batch != so.batch {
        return Err(LayerError::ShapeMismatch(format!(
            "input batch {} does not match gradient batch {}",
            si.batch, so.batch
        )));
    }
    let cin = si.channels;
    let cout = so.channels;
    check_kernel(grad_kernel, geom, cin, cout)?;

    let in_sample = si.voxels() * cin;
    let out_sample = so.voxels() * cout;
    let x = input.data();
    let g = grad_output.data();

    for b in 0..si.batch {
        let xb = &x[b * in_sample..(b + 1) * in_sample];
        let gb = &g[b * out_sample..(b + 1) * out_sample];
        geom.for_each_tap(|o, i, tap| {
            let xi = &xb[i * cin..(i + 1) * cin];
            let go = &gb[o * cout..(o + 1) * cout];
            let gw = &mut grad_kernel[tap * cin * cout..(tap + 1) * cin * cout];
            for (ci, &xv) in xi.iter().enumerate() {
                for (w, &gv) in gw[ci * cout..(ci + 1) * cout].iter_mut().zip(go) {
                    *w += xv * gv;
                }
            }
        });
    }
    Ok(())
}
