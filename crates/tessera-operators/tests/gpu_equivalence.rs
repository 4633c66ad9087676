//! Device tests: the wgpu path must match the host path.

mod common;

use common::{assert_close, init_tracing, output_tensor, random_vec, relu_config, seeded_conv};
use tessera_core::{Context, DataType, ExecutionContext, Operator, Tensor, TensorSpecs};
use tessera_operators::{BWBias, Convolution2DConfig};

/// Run the same seeded convolution on both backends and compare.
async fn compare_conv(config: Convolution2DConfig, input_shape: [usize; 4], seed: u64) {
    init_tracing();
    let cpu = Context::cpu();
    let gpu = Context::request_gpu().await.unwrap();
    let input_data = random_vec(seed + 7, input_shape.iter().product());

    let (mut cpu_conv, _, _, out_specs) = seeded_conv(&cpu, config.clone(), input_shape, seed);
    let input = Tensor::from_host(&cpu, input_shape, &input_data).unwrap();
    let mut expected = output_tensor(&cpu, &out_specs);
    cpu_conv
        .forward(&[input], std::slice::from_mut(&mut expected), &ExecutionContext::new(&cpu))
        .unwrap();

    let (mut gpu_conv, _, _, _) = seeded_conv(&gpu, config, input_shape, seed);
    let input = Tensor::from_host(&gpu, input_shape, &input_data).unwrap();
    let mut output = output_tensor(&gpu, &out_specs);
    let ectx = ExecutionContext::new(&gpu);
    gpu_conv
        .forward(&[input], std::slice::from_mut(&mut output), &ectx)
        .unwrap();

    let done = ectx.completion().unwrap();
    assert_eq!(done.name(), "gemm");
    assert_eq!(done.index(), input_shape[0] - 1);
    done.wait(&gpu).unwrap();

    let got = output.read_host(&gpu).unwrap();
    assert_close(&got, expected.host_data().unwrap(), 1e-4);
}

#[ignore = "requires GPU"]
#[pollster::test]
async fn test_conv_matches_cpu() {
    compare_conv(relu_config(), [2, 3, 8, 8], 1).await;
}

#[ignore = "requires GPU"]
#[pollster::test]
async fn test_conv_strided_multi_tile() {
    // 130 output channels and a 12x12 plane span two tiles along M and N
    let mut config = Convolution2DConfig::new(130, 3);
    config.stride = [1, 2];
    config.dilate = [2, 1];
    config.pad = [2, 1];
    config.bias = false;
    compare_conv(config, [2, 5, 12, 23], 2).await;
}

#[ignore = "requires GPU"]
#[pollster::test]
async fn test_conv_offset_views() {
    init_tracing();
    let gpu = Context::request_gpu().await.unwrap();
    let cpu = Context::cpu();
    let config = relu_config();
    let shape = [1, 3, 8, 8];
    let input_data = random_vec(21, shape.iter().product());

    let (mut cpu_conv, _, _, out_specs) = seeded_conv(&cpu, config.clone(), shape, 20);
    let mut expected = output_tensor(&cpu, &out_specs);
    cpu_conv
        .forward(
            &[Tensor::from_host(&cpu, shape, &input_data).unwrap()],
            std::slice::from_mut(&mut expected),
            &ExecutionContext::new(&cpu),
        )
        .unwrap();

    // Input and output share one buffer, neither at offset zero
    let input_len = input_data.len();
    let output_len = out_specs.shape().total_size();
    let buffer = std::sync::Arc::new(gpu.device().unwrap().create_buffer(&wgpu::BufferDescriptor {
        label: Some("shared"),
        size: ((16 + input_len + output_len) * 4) as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    }));
    let specs = TensorSpecs::new(shape, DataType::F32);
    let mut input = Tensor::from_device_buffer(buffer.clone(), 16, specs).unwrap();
    input.write_host(&gpu, &input_data).unwrap();
    let mut output = Tensor::from_device_buffer(buffer, 16 + input_len, out_specs).unwrap();

    let (mut gpu_conv, _, _, _) = seeded_conv(&gpu, config, shape, 20);
    let ectx = ExecutionContext::new(&gpu);
    gpu_conv
        .forward(&[input.clone()], std::slice::from_mut(&mut output), &ectx)
        .unwrap();
    ectx.synchronize().unwrap();

    assert_close(&output.read_host(&gpu).unwrap(), expected.host_data().unwrap(), 1e-4);
    assert_eq!(input.read_host(&gpu).unwrap(), input_data);
}

#[ignore = "requires GPU"]
#[pollster::test]
async fn test_second_conv_hits_program_cache() {
    let gpu = Context::request_gpu().await.unwrap();
    let cache = gpu.program_cache().unwrap();

    let _ = seeded_conv(&gpu, relu_config(), [1, 3, 8, 8], 1);
    assert_eq!(cache.compile_count(), 2);

    let _ = seeded_conv(&gpu, relu_config(), [4, 3, 16, 16], 2);
    assert_eq!(cache.compile_count(), 2);

    let mut other = relu_config();
    other.bias = false;
    let _ = seeded_conv(&gpu, other, [1, 3, 8, 8], 3);
    assert_eq!(cache.compile_count(), 3);
}

#[ignore = "requires GPU"]
#[pollster::test]
async fn test_bwd_bias_matches_cpu() {
    init_tracing();
    let cpu = Context::cpu();
    let gpu = Context::request_gpu().await.unwrap();

    for (shape, beta) in [([4, 6, 1, 1], 0.0), ([3, 5, 7, 9], 1.0), ([2, 3, 20, 20], 0.5)] {
        let [_, features, h, w] = shape;
        let dy_data = random_vec(30, shape.iter().product());
        let prior = random_vec(31, features);

        let op = BWBias::new(&cpu, h * w, DataType::F32).unwrap();
        let mut expected = Tensor::from_host(&cpu, [features], &prior).unwrap();
        op.backward(
            &Tensor::from_host(&cpu, shape, &dy_data).unwrap(),
            &mut expected,
            beta,
            &ExecutionContext::new(&cpu),
        )
        .unwrap();

        let op = BWBias::new(&gpu, h * w, DataType::F32).unwrap();
        let mut dw = Tensor::from_host(&gpu, [features], &prior).unwrap();
        let ectx = ExecutionContext::new(&gpu);
        op.backward(&Tensor::from_host(&gpu, shape, &dy_data).unwrap(), &mut dw, beta, &ectx)
            .unwrap();
        assert_eq!(ectx.completion().unwrap().name(), "bwd_bias");

        assert_close(&dw.read_host(&gpu).unwrap(), expected.host_data().unwrap(), 1e-4);
    }
}
