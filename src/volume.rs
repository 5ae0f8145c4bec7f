//! Channels-last volumetric tensors
//!
//! This module provides the 5D `Volume` container used by every layer, laid out as
//! `[batch, depth, height, width, channels]` in row-major order, plus the spatial
//! padding and cropping helpers (and their adjoints for backward passes).

use crate::error::{LayerError, Result};
use std::fmt;
use std::str::FromStr;

/// Shape of a channels-last 5D volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeShape {
    pub batch: usize,
    pub depth: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl VolumeShape {
    pub fn new(batch: usize, depth: usize, height: usize, width: usize, channels: usize) -> Self {
        Self {
            batch,
            depth,
            height,
            width,
            channels,
        }
    }

    /// Build a shape from a batch size, spatial extents and channel count.
    pub fn from_spatial(batch: usize, spatial: [usize; 3], channels: usize) -> Self {
        Self::new(batch, spatial[0], spatial[1], spatial[2], channels)
    }

    /// Spatial extents `[depth, height, width]`.
    pub fn spatial(&self) -> [usize; 3] {
        [self.depth, self.height, self.width]
    }

    /// Number of spatial positions per sample.
    pub fn voxels(&self) -> usize {
        self.depth * self.height * self.width
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.batch * self.voxels() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same shape with a different channel count.
    pub fn with_channels(&self, channels: usize) -> Self {
        Self { channels, ..*self }
    }

    /// Flat offset of element `(b, d, h, w, c)`.
    #[inline]
    pub fn offset(&self, b: usize, d: usize, h: usize, w: usize, c: usize) -> usize {
        (((b * self.depth + d) * self.height + h) * self.width + w) * self.channels + c
    }

    /// Flat index of a spatial position inside one sample.
    #[inline]
    pub fn voxel_index(&self, pos: [usize; 3]) -> usize {
        (pos[0] * self.height + pos[1]) * self.width + pos[2]
    }
}

impl fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}, {}]",
            self.batch, self.depth, self.height, self.width, self.channels
        )
    }
}

/// Dense channels-last 5D tensor of `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: VolumeShape,
    data: Vec<f32>,
}

impl Volume {
    /// Zero-filled volume.
    pub fn zeros(shape: VolumeShape) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Volume with every element set to `value`.
    pub fn filled(shape: VolumeShape, value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// Wrap existing data. Fails if `data.len()` does not match the shape.
    pub fn from_vec(shape: VolumeShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(LayerError::ShapeMismatch(format!(
                "shape {} needs {} elements, got {}",
                shape,
                shape.len(),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Volume whose element at `(b, d, h, w, c)` is `f(b, d, h, w, c)`.
    pub fn from_fn<F>(shape: VolumeShape, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize, usize, usize) -> f32,
    {
        let mut data = Vec::with_capacity(shape.len());
        for b in 0..shape.batch {
            for d in 0..shape.depth {
                for h in 0..shape.height {
                    for w in 0..shape.width {
                        for c in 0..shape.channels {
                            data.push(f(b, d, h, w, c));
                        }
                    }
                }
            }
        }
        Self { shape, data }
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn get(&self, b: usize, d: usize, h: usize, w: usize, c: usize) -> f32 {
        self.data[self.shape.offset(b, d, h, w, c)]
    }

    #[inline]
    pub fn set(&mut self, b: usize, d: usize, h: usize, w: usize, c: usize, value: f32) {
        let idx = self.shape.offset(b, d, h, w, c);
        self.data[idx] = value;
    }

    /// Apply `f` to every element in place.
    pub fn map_inplace<F: FnMut(f32) -> f32>(&mut self, mut f: F) {
        for value in &mut self.data {
            *value = f(*value);
        }
    }

    /// Extract channel `c` as a single-channel volume.
    pub fn channel(&self, c: usize) -> Result<Volume> {
        let channels = self.shape.channels;
        if c >= channels {
            return Err(LayerError::ShapeMismatch(format!(
                "channel {} out of range for shape {}",
                c, self.shape
            )));
        }
        let data = self
            .data
            .chunks_exact(channels)
            .map(|voxel| voxel[c])
            .collect();
        Ok(Volume {
            shape: self.shape.with_channels(1),
            data,
        })
    }

    /// Concatenate volumes along the channel axis. All parts must agree on
    /// batch and spatial extents.
    pub fn concat_channels(parts: &[Volume]) -> Result<Volume> {
        let first = parts.first().ok_or_else(|| {
            LayerError::ShapeMismatch("cannot concatenate an empty list of volumes".to_string())
        })?;
        let base = first.shape;
        for part in parts {
            let s = part.shape;
            if s.batch != base.batch || s.spatial() != base.spatial() {
                return Err(LayerError::ShapeMismatch(format!(
                    "cannot concatenate {} with {}",
                    base, s
                )));
            }
        }

        let total_channels: usize = parts.iter().map(|p| p.shape.channels).sum();
        let shape = base.with_channels(total_channels);
        let positions = base.batch * base.voxels();
        let mut data = Vec::with_capacity(shape.len());
        for pos in 0..positions {
            for part in parts {
                let ch = part.shape.channels;
                data.extend_from_slice(&part.data[pos * ch..(pos + 1) * ch]);
            }
        }
        Ok(Volume { shape, data })
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &Volume) -> Result<()> {
        if self.shape != other.shape {
            return Err(LayerError::ShapeMismatch(format!(
                "cannot add {} to {}",
                other.shape, self.shape
            )));
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
        Ok(())
    }
}

/// Border handling used when padding a volume before upsampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaddingMode {
    /// Fill with a constant value.
    Constant(f32),
    /// Mirror without repeating the edge sample: `dcb|abcd|cba`.
    Reflect,
    /// Mirror including the edge sample: `cba|abcd|dcb`.
    Symmetric,
}

impl PaddingMode {
    /// Parse a mode name, taking the fill value for `CONSTANT` from `constant`
    /// (zero when absent).
    pub fn parse(name: &str, constant: Option<f32>) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "CONSTANT" => Ok(PaddingMode::Constant(constant.unwrap_or(0.0))),
            "REFLECT" => Ok(PaddingMode::Reflect),
            "SYMMETRIC" => Ok(PaddingMode::Symmetric),
            _ => Err(LayerError::UnknownPaddingMode {
                name: name.to_string(),
            }),
        }
    }

    /// Map a coordinate in the padded axis to its source index in an axis
    /// of length `n`, or `None` for constant fill.
    fn source_index(&self, padded: usize, n: usize, pad: usize) -> Option<usize> {
        let i = padded as isize - pad as isize;
        let n_i = n as isize;
        if (0..n_i).contains(&i) {
            return Some(i as usize);
        }
        match self {
            PaddingMode::Constant(_) => None,
            PaddingMode::Reflect => {
                let j = if i < 0 { -i } else { 2 * (n_i - 1) - i };
                Some(j as usize)
            }
            PaddingMode::Symmetric => {
                let j = if i < 0 { -i - 1 } else { 2 * n_i - 1 - i };
                Some(j as usize)
            }
        }
    }

    fn check_axis(&self, n: usize, pad: usize) -> Result<()> {
        let ok = match self {
            PaddingMode::Constant(_) => true,
            PaddingMode::Reflect => pad < n,
            PaddingMode::Symmetric => pad <= n,
        };
        if ok {
            Ok(())
        } else {
            Err(LayerError::ShapeMismatch(format!(
                "{:?} padding of {} needs a larger axis than {}",
                self, pad, n
            )))
        }
    }
}

impl FromStr for PaddingMode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self> {
        PaddingMode::parse(s, None)
    }
}

/// Pad depth, height and width by `pad` on both sides.
pub fn pad_spatial(input: &Volume, pad: usize, mode: PaddingMode) -> Result<Volume> {
    let s = input.shape();
    for n in s.spatial() {
        mode.check_axis(n, pad)?;
    }
    let out_shape = VolumeShape::new(
        s.batch,
        s.depth + 2 * pad,
        s.height + 2 * pad,
        s.width + 2 * pad,
        s.channels,
    );
    let fill = match mode {
        PaddingMode::Constant(value) => value,
        _ => 0.0,
    };

    let mut out = Volume::filled(out_shape, fill);
    for b in 0..s.batch {
        for d in 0..out_shape.depth {
            let Some(sd) = mode.source_index(d, s.depth, pad) else {
                continue;
            };
            for h in 0..out_shape.height {
                let Some(sh) = mode.source_index(h, s.height, pad) else {
                    continue;
                };
                for w in 0..out_shape.width {
                    let Some(sw) = mode.source_index(w, s.width, pad) else {
                        continue;
                    };
                    let src = s.offset(b, sd, sh, sw, 0);
                    let dst = out_shape.offset(b, d, h, w, 0);
                    out.data[dst..dst + s.channels]
                        .copy_from_slice(&input.data[src..src + s.channels]);
                }
            }
        }
    }
    Ok(out)
}

/// Adjoint of [`pad_spatial`]: fold the gradient of the padded volume back
/// onto the samples it was copied from.
pub fn pad_spatial_adjoint(
    grad: &Volume,
    original: VolumeShape,
    pad: usize,
    mode: PaddingMode,
) -> Result<Volume> {
    let g = grad.shape();
    let expected = VolumeShape::new(
        original.batch,
        original.depth + 2 * pad,
        original.height + 2 * pad,
        original.width + 2 * pad,
        original.channels,
    );
    if g != expected {
        return Err(LayerError::ShapeMismatch(format!(
            "padded gradient has shape {}, expected {}",
            g, expected
        )));
    }

    let mut out = Volume::zeros(original);
    for b in 0..g.batch {
        for d in 0..g.depth {
            let Some(sd) = mode.source_index(d, original.depth, pad) else {
                continue;
            };
            for h in 0..g.height {
                let Some(sh) = mode.source_index(h, original.height, pad) else {
                    continue;
                };
                for w in 0..g.width {
                    let Some(sw) = mode.source_index(w, original.width, pad) else {
                        continue;
                    };
                    let src = g.offset(b, d, h, w, 0);
                    let dst = original.offset(b, sd, sh, sw, 0);
                    for c in 0..g.channels {
                        out.data[dst + c] += grad.data[src + c];
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Crop a spatial window of extent `len` starting at `start`.
pub fn crop_spatial(input: &Volume, start: [usize; 3], len: [usize; 3]) -> Result<Volume> {
    let s = input.shape();
    let spatial = s.spatial();
    for axis in 0..3 {
        if start[axis] + len[axis] > spatial[axis] {
            return Err(LayerError::ShapeMismatch(format!(
                "crop of {} from {} exceeds axis {} of length {}",
                len[axis], start[axis], axis, spatial[axis]
            )));
        }
    }

    let out_shape = VolumeShape::from_spatial(s.batch, len, s.channels);
    let mut data = Vec::with_capacity(out_shape.len());
    for b in 0..s.batch {
        for d in 0..len[0] {
            for h in 0..len[1] {
                let row = s.offset(b, start[0] + d, start[1] + h, start[2], 0);
                data.extend_from_slice(&input.data[row..row + len[2] * s.channels]);
            }
        }
    }
    Ok(Volume {
        shape: out_shape,
        data,
    })
}

/// Adjoint of [`crop_spatial`]: place `grad` at `start` inside a zero volume
/// of spatial extent `full`.
pub fn crop_spatial_adjoint(grad: &Volume, start: [usize; 3], full: [usize; 3]) -> Result<Volume> {
    let g = grad.shape();
    let len = g.spatial();
    for axis in 0..3 {
        if start[axis] + len[axis] > full[axis] {
            return Err(LayerError::ShapeMismatch(format!(
                "cropped gradient of length {} at {} does not fit axis {} of length {}",
                len[axis], start[axis], axis, full[axis]
            )));
        }
    }

    let out_shape = VolumeShape::from_spatial(g.batch, full, g.channels);
    let mut out = Volume::zeros(out_shape);
    for b in 0..g.batch {
        for d in 0..len[0] {
            for h in 0..len[1] {
                let src = g.offset(b, d, h, 0, 0);
                let dst = out_shape.offset(b, start[0] + d, start[1] + h, start[2], 0);
                let n = len[2] * g.channels;
                out.data[dst..dst + n].copy_from_slice(&grad.data[src..src + n]);
            }
        }
    }
    Ok(out)
}
