//! Integration tests for fixed-kernel upsampling
//!
//! This file tests the Upsampling3DLayer including:
//! - Constant volumes staying constant for every scale and reflective padding mode
//! - Linear ramps being reproduced in the interior
//! - Backward pass against finite differences
//! - Gradient mass conservation with symmetric padding
//! - Trainable kernels receiving exact gradient steps

use approx::assert_relative_eq;
use proptest::prelude::*;
use volumetric_nn::layers::{Interpolator, Layer, Upsampling3DLayer, UpsamplingOptions};
use volumetric_nn::volume::{PaddingMode, Volume, VolumeShape};

fn pattern(shape: VolumeShape) -> Volume {
    Volume::from_fn(shape, |b, d, h, w, c| ((b + 2 * d + 3 * h + 5 * w + 7 * c) % 11) as f32 * 0.25)
}

fn dot(a: &Volume, b: &Volume) -> f32 {
    a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum()
}

// ============================================================================
// Forward
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_constant_volume_is_preserved(
        scale in 1usize..4,
        n in 2usize..5,
        reflect in any::<bool>(),
        nearest in any::<bool>(),
        value in -10.0f32..10.0,
    ) {
        let options = UpsamplingOptions {
            scale,
            padding_mode: if reflect { PaddingMode::Reflect } else { PaddingMode::Symmetric },
            interpolator: if nearest {
                Interpolator::NearestNeighbor
            } else {
                Interpolator::Trilinear
            },
            ..UpsamplingOptions::default()
        };
        let up = Upsampling3DLayer::new(options).unwrap();
        let input = Volume::filled(VolumeShape::new(1, n, n + 1, n, 2), value);
        let output = up.forward(&input).unwrap();

        let expected = scale * (n + 1) - 1;
        prop_assert_eq!(output.shape().spatial(), [expected, scale * (n + 2) - 1, expected]);
        for v in output.data() {
            prop_assert!((v - value).abs() < 1e-4 * (1.0 + value.abs()));
        }
    }
}

#[test]
fn test_ramp_reproduced_along_every_axis() {
    let up = Upsampling3DLayer::new(UpsamplingOptions::default()).unwrap();
    let shape = VolumeShape::new(1, 4, 4, 4, 1);
    let input = Volume::from_fn(shape, |_, d, h, w, _| (d + 2 * h + 3 * w) as f32);
    let output = up.forward(&input).unwrap();
    assert_eq!(output.shape().spatial(), [9, 9, 9]);

    // output index j maps to input coordinate (j - 1) / 2 away from the border
    for d in 1..8 {
        for h in 1..8 {
            for w in 1..8 {
                let x = |j: usize| (j as f32 - 1.0) / 2.0;
                let expected = x(d) + 2.0 * x(h) + 3.0 * x(w);
                assert_relative_eq!(output.get(0, d, h, w, 0), expected, epsilon = 1e-4);
            }
        }
    }
}

#[test]
fn test_scale_three_interpolates_thirds() {
    let up = Upsampling3DLayer::new(UpsamplingOptions {
        scale: 3,
        ..UpsamplingOptions::default()
    })
    .unwrap();
    let input = Volume::from_fn(VolumeShape::new(1, 1, 1, 3, 1), |_, _, _, w, _| 3.0 * w as f32);
    let output = up.forward(&input).unwrap();
    assert_eq!(output.shape().spatial(), [5, 5, 11]);

    // samples land on 3i + 2, with two interpolated voxels between neighbours
    let row: Vec<f32> = (2..9).map(|w| output.get(0, 2, 2, w, 0)).collect();
    let expected = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    for (a, b) in row.iter().zip(expected) {
        assert_relative_eq!(*a, b, epsilon = 1e-4);
    }
}

#[test]
fn test_output_shape_matches_forward() {
    for interpolator in [Interpolator::Trilinear, Interpolator::NearestNeighbor] {
        let up = Upsampling3DLayer::new(UpsamplingOptions {
            interpolator,
            output_shape_3d: Some([7, 8, 9]),
            ..UpsamplingOptions::default()
        })
        .unwrap();
        let input = pattern(VolumeShape::new(2, 3, 3, 4, 3));
        let predicted = up.output_shape(input.shape()).unwrap();
        let output = up.forward(&input).unwrap();
        assert_eq!(predicted, output.shape());
        assert_eq!(output.shape(), VolumeShape::new(2, 7, 8, 9, 3));
    }
}

// ============================================================================
// Backward
// ============================================================================

fn check_gradient(up: &Upsampling3DLayer, input: &Volume) {
    let output = up.forward(input).unwrap();
    let weights = pattern(output.shape());
    let grad = up.backward(input, &weights).unwrap();
    assert_eq!(grad.shape(), input.shape());

    // the layer is affine in its input, so a large step is exact
    let h = 0.5;
    for idx in 0..input.data().len() {
        let mut plus = input.clone();
        plus.data_mut()[idx] += h;
        let mut minus = input.clone();
        minus.data_mut()[idx] -= h;
        let numeric = (dot(&up.forward(&plus).unwrap(), &weights)
            - dot(&up.forward(&minus).unwrap(), &weights))
            / (2.0 * h);
        assert_relative_eq!(grad.data()[idx], numeric, epsilon = 1e-2, max_relative = 1e-3);
    }
}

#[test]
fn test_trilinear_backward_reflect() {
    let up = Upsampling3DLayer::new(UpsamplingOptions {
        padding_mode: PaddingMode::Reflect,
        ..UpsamplingOptions::default()
    })
    .unwrap();
    check_gradient(&up, &pattern(VolumeShape::new(1, 3, 2, 3, 2)));
}

#[test]
fn test_trilinear_backward_constant_with_requested_extent() {
    let up = Upsampling3DLayer::new(UpsamplingOptions {
        padding_mode: PaddingMode::Constant(1.5),
        output_shape_3d: Some([8, 6, 7]),
        ..UpsamplingOptions::default()
    })
    .unwrap();
    check_gradient(&up, &pattern(VolumeShape::new(1, 3, 2, 3, 1)));
}

#[test]
fn test_nearest_backward_symmetric() {
    let up = Upsampling3DLayer::new(UpsamplingOptions {
        interpolator: Interpolator::NearestNeighbor,
        ..UpsamplingOptions::default()
    })
    .unwrap();
    check_gradient(&up, &pattern(VolumeShape::new(2, 2, 3, 2, 1)));
}

#[test]
fn test_symmetric_padding_conserves_gradient_mass() {
    for interpolator in [Interpolator::Trilinear, Interpolator::NearestNeighbor] {
        let up = Upsampling3DLayer::new(UpsamplingOptions {
            interpolator,
            ..UpsamplingOptions::default()
        })
        .unwrap();
        let input = pattern(VolumeShape::new(1, 3, 4, 2, 2));
        let output = up.forward(&input).unwrap();
        let grad = up
            .backward(&input, &Volume::filled(output.shape(), 1.0))
            .unwrap();
        let total: f32 = grad.data().iter().sum();
        assert_relative_eq!(total, output.data().len() as f32, max_relative = 1e-4);
    }
}

#[test]
fn test_backward_rejects_wrong_gradient_shape() {
    let up = Upsampling3DLayer::new(UpsamplingOptions::default()).unwrap();
    let input = pattern(VolumeShape::new(1, 2, 2, 2, 1));
    let wrong = Volume::zeros(VolumeShape::new(1, 4, 4, 4, 1));
    assert!(up.backward(&input, &wrong).is_err());
}

// ============================================================================
// Trainable kernel
// ============================================================================

#[test]
fn test_trainable_kernel_updates() {
    let mut up = Upsampling3DLayer::new(UpsamplingOptions {
        scope: "up1".to_string(),
        trainable: true,
        ..UpsamplingOptions::default()
    })
    .unwrap();
    let before = up.kernel().to_vec();
    assert_eq!(before.len(), 27);

    let input = pattern(VolumeShape::new(1, 2, 2, 2, 1));
    let output = up.forward(&input).unwrap();
    up.backward(&input, &Volume::filled(output.shape(), 1.0))
        .unwrap();
    up.update_parameters(0.01);

    assert_ne!(up.kernel(), before.as_slice());
    let params = up.named_parameters();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].0, "up1/kernel_transposed_3d");
    assert_eq!(params[0].1, up.kernel());
}

/// The interpolation is linear in its kernel, so a unit-rate step on
/// `<forward(x), g>` lowers it by exactly the squared norm of the kernel change.
fn check_kernel_step(options: UpsamplingOptions, input: &Volume) {
    let mut up = Upsampling3DLayer::new(options).unwrap();
    let output = up.forward(input).unwrap();
    let weights = Volume::from_fn(output.shape(), |b, d, h, w, c| {
        ((3 * b + d + 2 * h + 4 * w + c) % 7) as f32 / 3.0 - 1.0
    });
    let loss_before = dot(&output, &weights);

    let before = up.kernel().to_vec();
    up.backward(input, &weights).unwrap();
    up.update_parameters(1.0);
    let step: f32 = before
        .iter()
        .zip(up.kernel())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    assert!(step > 0.0);

    let loss_after = dot(&up.forward(input).unwrap(), &weights);
    assert_relative_eq!(
        loss_after,
        loss_before - step,
        epsilon = 1e-4 * (loss_before.abs() + step)
    );
}

#[test]
fn test_trainable_kernel_gradient_exact_step() {
    let options = UpsamplingOptions {
        trainable: true,
        ..UpsamplingOptions::default()
    };
    check_kernel_step(options, &pattern(VolumeShape::new(2, 2, 3, 2, 2)));
}

#[test]
fn test_trainable_kernel_gradient_exact_step_with_requested_extent() {
    let options = UpsamplingOptions {
        trainable: true,
        padding_mode: PaddingMode::Constant(0.5),
        output_shape_3d: Some([8, 6, 7]),
        ..UpsamplingOptions::default()
    };
    check_kernel_step(options, &pattern(VolumeShape::new(1, 3, 2, 3, 1)));
}

#[test]
fn test_trainable_kernel_gradient_exact_step_scale_three() {
    let options = UpsamplingOptions {
        scale: 3,
        trainable: true,
        padding_mode: PaddingMode::Reflect,
        ..UpsamplingOptions::default()
    };
    check_kernel_step(options, &pattern(VolumeShape::new(1, 2, 3, 2, 1)));
}
