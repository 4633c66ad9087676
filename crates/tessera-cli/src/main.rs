//! Tessera CLI - run operators on seeded data, compare backends, inspect kernels.

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tessera_core::{Context, DataType, ExecutionContext, Operator, Tensor, TensorSpecs, compose_module};
use tessera_operators::{BWBias, Convolution2D, Convolution2DConfig, kernel_source};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Convolution and bias-gradient operators on CPU and wgpu", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Cpu,
    Gpu,
    /// Run on both and report the largest difference
    Compare,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Convolution2D forward pass on random data
    Conv {
        /// Operator config as inline JSON or a path to a JSON file
        #[arg(short, long, value_name = "JSON|FILE")]
        config: String,

        /// Input shape as N,C,H,W
        #[arg(short, long, value_parser = parse_dims)]
        input: [usize; 4],

        #[arg(short, long, value_enum, default_value = "cpu")]
        backend: Backend,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Run the bias-gradient reduction on random data
    BwdBias {
        /// Gradient shape as N,F,H,W
        #[arg(short, long, value_parser = parse_dims)]
        input: [usize; 4],

        /// Scale applied to the prior gradient
        #[arg(long, default_value = "0")]
        beta: f32,

        #[arg(short, long, value_enum, default_value = "cpu")]
        backend: Backend,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Compose every kernel variant a conv config needs, without a GPU
    Kernels {
        /// Operator config as inline JSON or a path to a JSON file
        #[arg(short, long, value_name = "JSON|FILE")]
        config: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Conv {
            config,
            input,
            backend,
            seed,
        } => {
            let config = Convolution2DConfig::from_json(&load_config(&config)?)
                .context("Invalid Convolution2D config")?;
            compare_backends(backend, |ctx| run_conv(ctx, &config, input, seed))?;
        }
        Commands::BwdBias {
            input,
            beta,
            backend,
            seed,
        } => {
            compare_backends(backend, |ctx| run_bwd_bias(ctx, input, beta, seed))?;
        }
        Commands::Kernels { config } => {
            let config = Convolution2DConfig::from_json(&load_config(&config)?)
                .context("Invalid Convolution2D config")?;
            cmd_kernels(&config)?;
        }
    }

    Ok(())
}

fn parse_dims(text: &str) -> std::result::Result<[usize; 4], String> {
    let dims = text
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid dimension in '{text}': {e}"))?;
    dims.try_into()
        .map_err(|d: Vec<usize>| format!("expected 4 dimensions, got {}", d.len()))
}

/// Read `arg` as a JSON file if it names one, otherwise as inline JSON.
fn load_config(arg: &str) -> Result<serde_json::Value> {
    let path = Path::new(arg);
    let text = if path.is_file() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?
    } else {
        arg.to_string()
    };
    serde_json::from_str(&text).with_context(|| format!("Config is not valid JSON: {text}"))
}

fn gpu_context() -> Result<Context> {
    pollster::block_on(Context::request_gpu()).context("Failed to create GPU context")
}

fn seeded(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Run `run` on the requested backend(s) and print what it produced.
fn compare_backends<F>(backend: Backend, run: F) -> Result<()>
where
    F: Fn(&Context) -> Result<(TensorSpecs, Vec<f32>)>,
{
    let cpu = (backend != Backend::Gpu)
        .then(|| run(&Context::cpu()))
        .transpose()?;
    let gpu = (backend != Backend::Cpu)
        .then(|| gpu_context().and_then(|ctx| run(&ctx)))
        .transpose()?;

    for (name, result) in [("cpu", &cpu), ("gpu", &gpu)] {
        if let Some((specs, data)) = result {
            print_summary(name, specs, data);
        }
    }

    if let (Some((_, a)), Some((_, b))) = (&cpu, &gpu) {
        let max_diff = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        println!("max |cpu - gpu| = {max_diff:e}");
    }
    Ok(())
}

fn print_summary(backend: &str, specs: &TensorSpecs, data: &[f32]) {
    let min = data.iter().copied().fold(f32::INFINITY, f32::min);
    let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mean = data.iter().sum::<f32>() / data.len().max(1) as f32;
    println!("{backend}: {specs} min={min:.6} max={max:.6} mean={mean:.6}");
}

fn run_conv(
    ctx: &Context,
    config: &Convolution2DConfig,
    input_shape: [usize; 4],
    seed: u64,
) -> Result<(TensorSpecs, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut conv = Convolution2D::new(ctx, config.clone(), DataType::F32)?;
    let setup = conv.setup(&[TensorSpecs::new(input_shape, DataType::F32)])?;
    tracing::info!(
        context = %ctx.name(),
        output = %setup.outputs[0],
        workspace = setup.workspace,
        "convolution configured"
    );

    for param in conv.parameters_mut() {
        let data = seeded(&mut rng, param.len());
        param.write_host(ctx, &data)?;
    }
    let input = Tensor::from_host(ctx, input_shape, &seeded(&mut rng, input_shape.iter().product()))?;
    let mut output = Tensor::new(ctx, setup.outputs[0].clone())?;

    let ectx = ExecutionContext::new(ctx);
    conv.forward(&[input], std::slice::from_mut(&mut output), &ectx)?;
    ectx.synchronize()?;

    Ok((output.specs().clone(), output.read_host(ctx)?))
}

fn run_bwd_bias(
    ctx: &Context,
    shape: [usize; 4],
    beta: f32,
    seed: u64,
) -> Result<(TensorSpecs, Vec<f32>)> {
    let [_, features, h, w] = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let op = BWBias::new(ctx, h * w, DataType::F32)?;

    let dy = Tensor::from_host(ctx, shape, &seeded(&mut rng, shape.iter().product()))?;
    let mut dw = Tensor::from_host(ctx, [features], &seeded(&mut rng, features))?;

    let ectx = ExecutionContext::new(ctx);
    op.backward(&dy, &mut dw, beta, &ectx)?;
    ectx.synchronize()?;

    Ok((dw.specs().clone(), dw.read_host(ctx)?))
}

fn cmd_kernels(config: &Convolution2DConfig) -> Result<()> {
    for key in Convolution2D::program_keys(config) {
        let Some(source) = kernel_source(key.source_id()) else {
            bail!("No kernel source named '{}'", key.source_id());
        };
        let module = compose_module(&key, source)
            .with_context(|| format!("Failed to compose {key}"))?;
        println!(
            "{key}: {} globals, {} entry point(s)",
            module.global_variables.len(),
            module.entry_points.len()
        );
    }
    Ok(())
}
