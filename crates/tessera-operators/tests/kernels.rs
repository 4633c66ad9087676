//! Shader composition tests. These run naga_oil and the naga validator on
//! every kernel variant the operators request, without a GPU.

mod common;

use common::init_tracing;
use tessera_core::{Activation, ProgramCache, ProgramKey, compose_module};
use tessera_operators::{BWBias, Convolution2D, Convolution2DConfig, kernel_source};

fn compose_and_validate(key: &ProgramKey) -> naga::Module {
    let source = kernel_source(key.source_id()).unwrap();
    let module = compose_module(key, source).unwrap_or_else(|e| panic!("{key}: {e}"));
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .unwrap_or_else(|e| panic!("{key} failed validation: {e:?}"));
    module
}

fn conv_configs() -> Vec<Convolution2DConfig> {
    let mut configs = Vec::new();
    for activation in [
        Activation::Identity,
        Activation::Relu,
        Activation::Tanh,
        Activation::Sigmoid,
        Activation::Relu6,
    ] {
        for bias in [true, false] {
            let mut config = Convolution2DConfig::new(8, 3);
            config.bias = bias;
            config.activation = activation;
            configs.push(config);
        }
    }

    let mut strided = Convolution2DConfig::new(4, 5);
    strided.kernel = [5, 2];
    strided.stride = [2, 3];
    strided.dilate = [2, 1];
    strided.pad = [2, 0];
    configs.push(strided);
    configs
}

#[test]
fn test_all_conv_variants_compose() {
    init_tracing();
    for config in conv_configs() {
        for key in Convolution2D::program_keys(&config) {
            let module = compose_and_validate(&key);
            assert_eq!(module.entry_points.len(), 1, "{key}");
            assert_eq!(module.entry_points[0].name, "main", "{key}");
        }
    }
}

#[test]
fn test_gemm_bias_binding_follows_key() {
    let mut config = Convolution2DConfig::new(8, 3);
    let [_, with_bias] = Convolution2D::program_keys(&config);
    config.bias = false;
    let [_, without_bias] = Convolution2D::program_keys(&config);

    let bindings = |module: &naga::Module| {
        module
            .global_variables
            .iter()
            .filter(|(_, var)| var.binding.is_some())
            .count()
    };
    assert_eq!(bindings(&compose_and_validate(&with_bias)), 5);
    assert_eq!(bindings(&compose_and_validate(&without_bias)), 4);
}

#[test]
fn test_bwd_bias_variants_compose() {
    for rows_columns in [1, 64, 100, 128, 300, 4096] {
        for key in BWBias::program_keys(rows_columns) {
            compose_and_validate(&key);
        }
    }
}

#[test]
fn test_cache_compiles_each_variant_once() {
    let cache: ProgramCache<naga::Module> = ProgramCache::new();
    let configs = conv_configs();

    for _ in 0..2 {
        for config in &configs {
            for key in Convolution2D::program_keys(config) {
                let source = kernel_source(key.source_id()).unwrap();
                cache
                    .get_or_compile(&key, |key| compose_module(key, source))
                    .unwrap();
            }
        }
    }

    // Two im2col variants; the strided config reuses the biased identity GEMM
    let expected = 2 + 10;
    assert_eq!(cache.compile_count(), expected);
    assert_eq!(cache.len(), expected);
}
