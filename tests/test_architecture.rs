//! Tests for architecture parsing and model building
//!
//! This file tests the architecture module including:
//! - Loading the shipped JSON architectures
//! - Parsing every layer type and its options
//! - Handling invalid JSON and missing files
//! - Rejecting unknown activation, initializer and padding names with the offending layer index

use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use volumetric_nn::architecture::{
    build_model, forward_model, load_architecture, model_output_shape, Extent3,
};
use volumetric_nn::utils::rng::SimpleRng;
use volumetric_nn::volume::{Volume, VolumeShape};
use volumetric_nn::LayerError;

fn write_temp_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}

fn shipped(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("architectures")
        .join(name)
}

// ============================================================================
// Shipped architectures
// ============================================================================

mod shipped_architecture_tests {
    use super::*;

    #[test]
    fn test_load_unet_small() {
        let config = load_architecture(shipped("unet_small.json")).unwrap();
        assert_eq!(config.input_shape, [16, 16, 16, 1]);
        assert_eq!(config.defaults.seed, 7);
        assert_eq!(config.layers.len(), 5);
        assert_eq!(config.layers[0].kernel_size, Some(Extent3::Uniform(3)));
        assert_eq!(config.layers[3].initializer.as_deref(), Some("trilinear"));
    }

    #[test]
    fn test_unet_small_round_trip_shape() {
        let config = load_architecture(shipped("unet_small.json")).unwrap();
        let mut rng = SimpleRng::new(config.defaults.seed);
        let layers = build_model(&config, &mut rng).unwrap();
        let shape = model_output_shape(&layers, config.input_volume_shape(2)).unwrap();
        assert_eq!(shape, VolumeShape::new(2, 16, 16, 16, 1));

        let names: Vec<String> = layers
            .iter()
            .flat_map(|l| l.named_parameters())
            .map(|(name, _)| name)
            .collect();
        assert!(names.contains(&"enc1/conv3d/kernel".to_string()));
        assert!(names.contains(&"enc2/batch_normalization/moving_variance".to_string()));
        assert!(names.contains(&"dec1/conv3d_transpose/kernel".to_string()));
    }

    #[test]
    fn test_upsample_refine_forward() {
        let config = load_architecture(shipped("upsample_refine.json")).unwrap();
        let mut rng = SimpleRng::new(config.defaults.seed);
        let layers = build_model(&config, &mut rng).unwrap();

        let input = Volume::from_fn(config.input_volume_shape(1), |_, d, h, w, c| {
            (d + h + w + c) as f32 * 0.1
        });
        let output = forward_model(&layers, &input).unwrap();
        assert_eq!(output.shape(), VolumeShape::new(1, 20, 19, 20, 4));
        assert!(output.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_same_seed_same_model() {
        let config = load_architecture(shipped("unet_small.json")).unwrap();
        let a = build_model(&config, &mut SimpleRng::new(3)).unwrap();
        let b = build_model(&config, &mut SimpleRng::new(3)).unwrap();
        let c = build_model(&config, &mut SimpleRng::new(4)).unwrap();
        assert_eq!(a[0].named_parameters(), b[0].named_parameters());
        assert_ne!(a[0].named_parameters(), c[0].named_parameters());
    }
}

// ============================================================================
// Invalid input
// ============================================================================

mod invalid_architecture_tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let result = load_architecture("does/not/exist.json");
        assert!(matches!(result, Err(LayerError::Io(_))));
    }

    #[test]
    fn test_malformed_json() {
        let file = write_temp_config(r#"{"input_shape": [4, 4, 4, 1], "layers": ["#);
        assert!(matches!(load_architecture(file.path()), Err(LayerError::Json(_))));
    }

    #[test]
    fn test_unknown_activation_names_value_and_layer() {
        let file = write_temp_config(
            r#"{"input_shape": [6, 6, 6, 1], "layers": [
                {"layer_type": "max_pooling3d"},
                {"layer_type": "conv3d", "filters": 2, "kernel_size": 3, "activation": "tanh"}
            ]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("Layer 1"));
        assert!(err.contains("activation=tanh"));
        assert!(err.contains("\"ReLu\", \"LReLu\", \"ELu\""));
    }

    #[test]
    fn test_unknown_initializer() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "layers": [
                {"layer_type": "conv3d_transpose", "filters": 1, "kernel_size": 3, "initializer": "he_normal"}
            ]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("initializer=he_normal"));
    }

    #[test]
    fn test_unknown_padding_mode() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "layers": [
                {"layer_type": "upsampling3d", "padding_mode": "WRAP"}
            ]}"#,
        );
        assert!(load_architecture(file.path()).is_err());
    }

    #[test]
    fn test_upsampling_output_shape_out_of_range() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "layers": [
                {"layer_type": "upsampling3d", "output_shape_3d": [12, 9, 9]}
            ]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("Layer 0"));
        assert!(err.contains("output_shape_3d"));
    }

    #[test]
    fn test_field_of_another_layer_type_rejected() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 2], "layers": [
                {"layer_type": "conv3d", "filters": 2, "kernel_size": 1},
                {"layer_type": "max_pooling3d", "filters": 4}
            ]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("Layer 1"));
        assert!(err.contains("max_pooling3d layer does not accept filters"));
    }

    #[test]
    fn test_conv3d_rejects_transpose_only_fields() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "layers": [
                {"layer_type": "conv3d", "filters": 1, "kernel_size": 3, "initializer": "trilinear"}
            ]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("does not accept initializer"));
    }

    #[test]
    fn test_padding_constant_needs_constant_mode() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "layers": [
                {"layer_type": "upsampling3d", "padding_mode": "SYMMETRIC", "padding_constant": 2.0}
            ]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("Layer 0"));
        assert!(err.contains("padding_constant"));

        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "layers": [
                {"layer_type": "upsampling3d", "padding_mode": "CONSTANT", "padding_constant": 2.0}
            ]}"#,
        );
        assert!(load_architecture(file.path()).is_ok());
    }

    #[test]
    fn test_zero_input_dimension() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 0, 4, 1], "layers": [{"layer_type": "max_pooling3d"}]}"#,
        );
        assert!(load_architecture(file.path()).is_err());
    }

    #[test]
    fn test_bad_defaults_rejected() {
        let file = write_temp_config(
            r#"{"input_shape": [4, 4, 4, 1], "defaults": {"batchnorm_momentum": 1.5},
                "layers": [{"layer_type": "max_pooling3d"}]}"#,
        );
        let err = load_architecture(file.path()).unwrap_err().to_string();
        assert!(err.contains("batchnorm_momentum"));
    }
}
