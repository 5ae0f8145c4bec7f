//! Property tests for the separable interpolation kernels
//!
//! This file checks the closed-form properties every upsampling kernel must have:
//! - Symmetry under reversal of every axis
//! - Total sum of `scale^dim`
//! - Partition of unity: for every output phase the contributing taps sum to 1

use approx::assert_relative_eq;
use proptest::prelude::*;
use volumetric_nn::kernels::{
    bilinear_up_kernel, separable_up_kernel, trilinear_kernel, up_kernel_1d,
};

/// Sum of the taps of a 3D kernel that hit an output with the given phase.
fn phase_sum(kernel: &[f32], extent: [usize; 3], scales: [usize; 3], phase: [usize; 3]) -> f32 {
    let mut total = 0.0;
    for d in (phase[0]..extent[0]).step_by(scales[0]) {
        for h in (phase[1]..extent[1]).step_by(scales[1]) {
            for w in (phase[2]..extent[2]).step_by(scales[2]) {
                total += kernel[(d * extent[1] + h) * extent[2] + w];
            }
        }
    }
    total
}

// ============================================================================
// Fixed-value tests
// ============================================================================

#[test]
fn test_scale_two_trilinear_matches_closed_form() {
    let kernel = trilinear_kernel(2).unwrap();
    let axis = [0.5f32, 1.0, 0.5];
    for d in 0..3 {
        for h in 0..3 {
            for w in 0..3 {
                assert_eq!(kernel[(d * 3 + h) * 3 + w], axis[d] * axis[h] * axis[w]);
            }
        }
    }
}

#[test]
fn test_bilinear_is_two_dimensional() {
    let kernel = bilinear_up_kernel(2, 2).unwrap();
    assert_eq!(
        kernel,
        vec![0.25, 0.5, 0.25, 0.5, 1.0, 0.5, 0.25, 0.5, 0.25]
    );
}

#[test]
fn test_constant_per_output_phase() {
    let kernel = trilinear_kernel(2).unwrap();
    for pd in 0..2 {
        for ph in 0..2 {
            for pw in 0..2 {
                let sum = phase_sum(&kernel, [3, 3, 3], [2, 2, 2], [pd, ph, pw]);
                assert_relative_eq!(sum, 1.0, epsilon = 1e-6);
            }
        }
    }
}

// ============================================================================
// Properties over arbitrary scales
// ============================================================================

proptest! {
    #[test]
    fn prop_triangle_is_symmetric(scale in 1usize..12) {
        let k = up_kernel_1d(scale).unwrap();
        prop_assert_eq!(k.len(), 2 * scale - 1);
        for i in 0..k.len() {
            prop_assert!((k[i] - k[k.len() - 1 - i]).abs() < 1e-6);
        }
        prop_assert_eq!(k[scale - 1], 1.0);
    }

    #[test]
    fn prop_kernel_sums_to_scale_power(dim in 1usize..4, scale in 1usize..6) {
        let k = bilinear_up_kernel(dim, scale).unwrap();
        let expected = (scale as f32).powi(dim as i32);
        let total: f32 = k.iter().sum();
        prop_assert!((total - expected).abs() < 1e-3 * expected);
    }

    #[test]
    fn prop_separable_kernel_is_symmetric(sd in 1usize..5, sh in 1usize..5, sw in 1usize..5) {
        let extent = [2 * sd - 1, 2 * sh - 1, 2 * sw - 1];
        let k = separable_up_kernel(&[sd, sh, sw]).unwrap();
        prop_assert_eq!(k.len(), extent[0] * extent[1] * extent[2]);
        for d in 0..extent[0] {
            for h in 0..extent[1] {
                for w in 0..extent[2] {
                    let a = k[(d * extent[1] + h) * extent[2] + w];
                    let (md, mh, mw) = (extent[0] - 1 - d, extent[1] - 1 - h, extent[2] - 1 - w);
                    let mirrored = k[(md * extent[1] + mh) * extent[2] + mw];
                    prop_assert!((a - mirrored).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn prop_partition_of_unity(sd in 1usize..5, sh in 1usize..5, sw in 1usize..5) {
        let scales = [sd, sh, sw];
        let extent = [2 * sd - 1, 2 * sh - 1, 2 * sw - 1];
        let k = separable_up_kernel(&scales).unwrap();
        for pd in 0..sd {
            for ph in 0..sh {
                for pw in 0..sw {
                    let sum = phase_sum(&k, extent, scales, [pd, ph, pw]);
                    prop_assert!(
                        (sum - 1.0).abs() < 1e-4,
                        "phase {:?} sums to {}",
                        [pd, ph, pw],
                        sum
                    );
                }
            }
        }
    }
}
