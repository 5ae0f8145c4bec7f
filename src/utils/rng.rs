//! Deterministic random numbers for weight initialization.
//!
//! A small xorshift generator keeps layer construction reproducible: the same seed
//! always produces the same kernels.

/// Xorshift PRNG used to draw initial weights.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state }
    }

    /// Basic xorshift to generate u32.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Convert to [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Glorot (Xavier) uniform kernel for a 3D convolution.
    ///
    /// Samples from `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`,
    /// where `fan_in = receptive_field × in_channels` and
    /// `fan_out = receptive_field × out_channels`.
    pub fn glorot_uniform(
        &mut self,
        kernel: [usize; 3],
        in_channels: usize,
        out_channels: usize,
    ) -> Vec<f32> {
        let receptive = kernel[0] * kernel[1] * kernel[2];
        let fan_in = (receptive * in_channels) as f32;
        let fan_out = (receptive * out_channels) as f32;
        let limit = glorot_limit(fan_in, fan_out);

        (0..receptive * in_channels * out_channels)
            .map(|_| self.gen_range_f32(-limit, limit))
            .collect()
    }
}

/// Bound of the Glorot uniform distribution.
pub fn glorot_limit(fan_in: f32, fan_out: f32) -> f32 {
    (6.0f32 / (fan_in + fan_out)).sqrt()
}
