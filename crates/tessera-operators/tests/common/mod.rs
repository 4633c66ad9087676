//! Common test utilities for operator tests.
//!
//! Reference implementations here are deliberately naive loops so that the
//! im2col and GEMM paths are checked against an independent formulation.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_core::{Activation, Context, DataType, Operator, Tensor, TensorSpecs};
use tessera_operators::{Convolution2D, Convolution2DConfig, apply_activation, output_extent};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Uniform values in [-1, 1) from a fixed seed.
pub fn random_vec(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Direct convolution over an NCHW input.
pub fn reference_conv(
    config: &Convolution2DConfig,
    input_shape: [usize; 4],
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
) -> (Vec<f32>, [usize; 4]) {
    let [batch, cin, in_h, in_w] = input_shape;
    let [kh, kw] = config.kernel;
    let axis = |i: usize| {
        output_extent(
            [in_h, in_w][i],
            config.kernel[i],
            config.stride[i],
            config.pad[i],
            config.dilate[i],
        )
        .unwrap()
    };
    let (out_h, out_w) = (axis(0), axis(1));
    let cout = config.channels_out;

    let mut out = vec![0.0f32; batch * cout * out_h * out_w];
    for b in 0..batch {
        for co in 0..cout {
            for r in 0..out_h {
                for c in 0..out_w {
                    let mut sum = bias.map_or(0.0, |bias| bias[co]);
                    for ci in 0..cin {
                        for dy in 0..kh {
                            for dx in 0..kw {
                                let y = (r * config.stride[0] + dy * config.dilate[0]) as isize
                                    - config.pad[0] as isize;
                                let x = (c * config.stride[1] + dx * config.dilate[1]) as isize
                                    - config.pad[1] as isize;
                                if y < 0 || x < 0 || y as usize >= in_h || x as usize >= in_w {
                                    continue;
                                }
                                let src = ((b * cin + ci) * in_h + y as usize) * in_w + x as usize;
                                let w = ((co * cin + ci) * kh + dy) * kw + dx;
                                sum += input[src] * weight[w];
                            }
                        }
                    }
                    out[((b * cout + co) * out_h + r) * out_w + c] = sum;
                }
            }
        }
    }
    apply_activation(&mut out, config.activation);
    (out, [batch, cout, out_h, out_w])
}

/// Build and set up a convolution on `ctx` with seeded weights and bias.
pub fn seeded_conv(
    ctx: &Context,
    config: Convolution2DConfig,
    input_shape: [usize; 4],
    seed: u64,
) -> (Convolution2D, Vec<f32>, Option<Vec<f32>>, TensorSpecs) {
    let mut conv = Convolution2D::new(ctx, config, DataType::F32).unwrap();
    let setup = conv
        .setup(&[TensorSpecs::new(input_shape, DataType::F32)])
        .unwrap();

    let params = conv.parameters_mut();
    let weight = random_vec(seed, params[0].len());
    params[0].write_host(ctx, &weight).unwrap();
    let bias = params.get_mut(1).map(|b| {
        let data = random_vec(seed + 1, b.len());
        b.write_host(ctx, &data).unwrap();
        data
    });

    (conv, weight, bias, setup.outputs[0].clone())
}

pub fn assert_close(got: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (&g, &e)) in got.iter().zip(expected).enumerate() {
        assert!(
            (g - e).abs() <= tolerance * (1.0 + e.abs()),
            "Mismatch at index {i}: got {g}, expected {e}"
        );
    }
}

pub fn relu_config() -> Convolution2DConfig {
    let mut config = Convolution2DConfig::new(4, 3);
    config.pad = [1, 1];
    config.activation = Activation::Relu;
    config
}

pub fn output_tensor(ctx: &Context, specs: &TensorSpecs) -> Tensor {
    Tensor::new(ctx, specs.clone()).unwrap()
}
