//! 2D convolution via im2col and matrix multiply.
//!
//! Each batch item is expanded into a (out_h·out_w) × (channels_in·kh·kw)
//! matrix in the operator's workspace, then multiplied by the weights viewed
//! as channels_out × (channels_in·kh·kw). Bias and activation are fused into
//! the multiply's output.

mod cpu;
mod gpu;

use serde_json::Value;
use tessera_core::config::{get_bool, get_int, require_int};
use tessera_core::{
    Activation, Context, DataType, Error, ExecutionContext, Operator, OperatorSetup,
    OperatorState, ParameterStore, ProgramKey, Result, Shape, Tensor, TensorSpecs, ensure,
    get_1d_nd,
};

/// Convolution hyperparameters. Pairs are (height, width).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convolution2DConfig {
    /// Input channels; `None` until inferred from the first `setup`.
    pub channels_in: Option<usize>,
    pub channels_out: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub dilate: [usize; 2],
    pub pad: [usize; 2],
    pub groups: usize,
    pub bias: bool,
    pub activation: Activation,
}

impl Convolution2DConfig {
    /// Square kernel, unit stride and dilation, no padding, with bias.
    pub fn new(channels_out: usize, kernel: usize) -> Self {
        Self {
            channels_in: None,
            channels_out,
            kernel: [kernel; 2],
            stride: [1; 2],
            dilate: [1; 2],
            pad: [0; 2],
            groups: 1,
            bias: true,
            activation: Activation::Identity,
        }
    }

    /// Parse a config such as
    /// `{"channels_out": 16, "kernel": 3, "pad": [1, 1], "activation": "relu"}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let channels_in = match get_int(value, "channels_in", -1)? {
            -1 => None,
            c if c > 0 => Some(c as usize),
            c => {
                return Err(Error::Validation(format!(
                    "channels_in must be positive or -1, got {c}"
                )));
            }
        };

        Ok(Self {
            channels_in,
            channels_out: positive(require_int(value, "channels_out")?, "channels_out")?,
            kernel: positive_pair(get_1d_nd(value, "kernel", [1, 1], true)?, "kernel")?,
            stride: positive_pair(get_1d_nd(value, "stride", [1, 1], false)?, "stride")?,
            dilate: positive_pair(get_1d_nd(value, "dilate", [1, 1], false)?, "dilate")?,
            pad: non_negative_pair(get_1d_nd(value, "pad", [0, 0], false)?, "pad")?,
            groups: positive(get_int(value, "groups", 1)?, "groups")?,
            bias: get_bool(value, "bias", true)?,
            activation: Activation::from_json(value)?,
        })
    }
}

fn positive(value: i64, name: &str) -> Result<usize> {
    ensure!(value > 0, "{name} must be positive, got {value}");
    Ok(value as usize)
}

fn positive_pair(values: [i64; 2], name: &str) -> Result<[usize; 2]> {
    Ok([positive(values[0], name)?, positive(values[1], name)?])
}

fn non_negative_pair(values: [i64; 2], name: &str) -> Result<[usize; 2]> {
    ensure!(
        values.iter().all(|v| *v >= 0),
        "{name} must not be negative, got {values:?}"
    );
    Ok([values[0] as usize, values[1] as usize])
}

/// Output extent along one spatial axis, or `None` if it is not positive.
pub fn output_extent(input: usize, kernel: usize, stride: usize, pad: usize, dilate: usize) -> Option<usize> {
    let span = input as i64 + 2 * pad as i64 - dilate as i64 * (kernel as i64 - 1) - 1;
    let out = span.div_euclid(stride as i64) + 1;
    (out > 0).then_some(out as usize)
}

/// Sizes of one forward call, shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub batch: usize,
    pub channels_in: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub channels_out: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilate: [usize; 2],
}

impl ConvGeometry {
    /// Columns of the im2col matrix, and the GEMM depth.
    pub fn im2col_width(&self) -> usize {
        self.channels_in * self.kernel[0] * self.kernel[1]
    }

    /// Output positions per channel, and the GEMM width.
    pub fn plane(&self) -> usize {
        self.out_h * self.out_w
    }

    pub fn input_item(&self) -> usize {
        self.channels_in * self.in_h * self.in_w
    }

    pub fn output_item(&self) -> usize {
        self.channels_out * self.plane()
    }

    /// Elements of one batch item's im2col matrix.
    pub fn workspace_len(&self) -> usize {
        self.im2col_width() * self.plane()
    }
}

enum Backend {
    Cpu,
    Gpu(Option<gpu::ConvKernels>),
}

/// 2D convolution operator (NCHW), groups = 1.
pub struct Convolution2D {
    config: Convolution2DConfig,
    dtype: DataType,
    store: ParameterStore,
    backend: Backend,
    state: OperatorState,
}

impl Convolution2D {
    /// Validate `config` and pick the backend from the context kind.
    pub fn new(ctx: &Context, config: Convolution2DConfig, dtype: DataType) -> Result<Self> {
        ensure!(config.channels_out > 0, "channels_out must be positive");
        ensure!(dtype == DataType::F32, "Convolution2D supports float32 only, got {dtype}");
        ensure!(
            config.groups == 1,
            "Convolution2D supports groups == 1 only, got {}",
            config.groups
        );
        ensure!(
            config.kernel.iter().chain(&config.stride).chain(&config.dilate).all(|v| *v > 0),
            "kernel, stride and dilate must be positive"
        );
        ensure!(
            config.channels_in != Some(0),
            "channels_in must be positive"
        );

        let backend = if ctx.is_cpu_context() {
            Backend::Cpu
        } else {
            Backend::Gpu(None)
        };

        Ok(Self {
            config,
            dtype,
            store: ParameterStore::new(ctx),
            backend,
            state: OperatorState::Unconfigured,
        })
    }

    pub fn config(&self) -> &Convolution2DConfig {
        &self.config
    }

    /// Kernel cache keys this configuration compiles on a GPU context.
    pub fn program_keys(config: &Convolution2DConfig) -> [ProgramKey; 2] {
        gpu::program_keys(config)
    }

    /// Output shape for `input`, checking it against the configuration.
    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        ensure!(input.rank() == 4, "Convolution2D expects NCHW input, got {input}");
        let channels_in = self.config.channels_in.ok_or_else(|| {
            Error::Validation("Convolution2D input channels are not resolved".to_string())
        })?;
        ensure!(
            input[1] == channels_in,
            "Convolution2D expects {channels_in} input channels, got {input}"
        );

        let mut out = [0usize; 2];
        for axis in 0..2 {
            out[axis] = output_extent(
                input[2 + axis],
                self.config.kernel[axis],
                self.config.stride[axis],
                self.config.pad[axis],
                self.config.dilate[axis],
            )
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Convolution2D output for input {input} is empty on axis {axis}"
                ))
            })?;
        }

        Ok(Shape::from([input[0], self.config.channels_out, out[0], out[1]]))
    }

    fn geometry(&self, input: &Shape, output: &Shape) -> ConvGeometry {
        ConvGeometry {
            batch: input[0],
            channels_in: input[1],
            in_h: input[2],
            in_w: input[3],
            channels_out: output[1],
            out_h: output[2],
            out_w: output[3],
            kernel: self.config.kernel,
            stride: self.config.stride,
            pad: self.config.pad,
            dilate: self.config.dilate,
        }
    }

    fn parameter_specs(&self, channels_in: usize) -> Vec<TensorSpecs> {
        let c = &self.config;
        let mut specs = vec![TensorSpecs::new(
            [c.channels_out, channels_in / c.groups, c.kernel[0], c.kernel[1]],
            self.dtype,
        )];
        if c.bias {
            specs.push(TensorSpecs::new([c.channels_out], self.dtype));
        }
        specs
    }

    fn check_parameters(&self) -> Result<()> {
        let channels_in = self.config.channels_in.unwrap_or_default();
        let expected = self.parameter_specs(channels_in);
        let params = self.store.parameters();
        ensure!(
            params.len() == expected.len(),
            "Convolution2D expects {} parameters, got {}",
            expected.len(),
            params.len()
        );
        for (param, specs) in params.iter().zip(&expected) {
            ensure!(
                param.shape() == specs.shape(),
                "Convolution2D parameter shape {} does not match {}",
                param.shape(),
                specs.shape()
            );
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        ensure!(
            self.state == OperatorState::Ready,
            "Convolution2D used before setup"
        );
        Ok(())
    }
}

impl Operator for Convolution2D {
    fn name(&self) -> &str {
        "Convolution2D"
    }

    fn state(&self) -> OperatorState {
        self.state
    }

    #[tracing::instrument(skip_all, fields(op = "Convolution2D"))]
    fn setup(&mut self, inputs: &[TensorSpecs]) -> Result<OperatorSetup> {
        ensure!(inputs.len() == 1, "Convolution2D expects 1 input, got {}", inputs.len());
        let input = &inputs[0];
        ensure!(
            input.dtype() == self.dtype,
            "Convolution2D input must be {}, got {}",
            self.dtype,
            input.dtype()
        );
        let shape = input.shape();
        ensure!(shape.rank() == 4, "Convolution2D expects NCHW input, got {shape}");

        ensure!(shape[1] > 0, "Convolution2D input has no channels: {shape}");
        let channels_in = *self.config.channels_in.get_or_insert(shape[1]);
        ensure!(
            channels_in % self.config.groups == 0 && self.config.channels_out % self.config.groups == 0,
            "Channel counts must be divisible by groups"
        );

        let output = self.output_shape(shape)?;
        self.store.setup_parameters(self.parameter_specs(channels_in))?;

        let geometry = self.geometry(shape, &output);
        let workspace = geometry.workspace_len() * self.dtype.size();
        self.store.ensure_workspace(workspace)?;

        if let Backend::Gpu(kernels @ None) = &mut self.backend {
            *kernels = Some(gpu::ConvKernels::new(self.store.context(), &self.config)?);
        }

        tracing::debug!(input = %shape, output = %output, workspace, "configured");
        self.state = OperatorState::Ready;

        Ok(OperatorSetup {
            outputs: vec![TensorSpecs::new(output, self.dtype)],
            workspace,
        })
    }

    fn reshape(&mut self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        self.ensure_ready()?;
        ensure!(inputs.len() == 1, "Convolution2D expects 1 input, got {}", inputs.len());
        Ok(vec![self.output_shape(&inputs[0])?])
    }

    #[tracing::instrument(skip_all, fields(op = "Convolution2D"))]
    fn forward(
        &mut self,
        inputs: &[Tensor],
        outputs: &mut [Tensor],
        ectx: &ExecutionContext,
    ) -> Result<()> {
        self.ensure_ready()?;
        ensure!(inputs.len() == 1, "Convolution2D expects 1 input, got {}", inputs.len());
        ensure!(outputs.len() == 1, "Convolution2D expects 1 output, got {}", outputs.len());

        let input = &inputs[0];
        let output = &mut outputs[0];
        let expected = self.output_shape(input.shape())?;
        ensure!(
            *output.shape() == expected,
            "Convolution2D output shape {} does not match expected {expected}",
            output.shape()
        );
        self.check_parameters()?;

        let geometry = self.geometry(input.shape(), output.shape());
        self.store
            .ensure_workspace(geometry.workspace_len() * self.dtype.size())?;

        let activation = self.config.activation;
        let ctx = self.store.context().clone();
        let (params, workspace) = self.store.split_mut();
        let workspace = workspace
            .ok_or_else(|| Error::Validation("Convolution2D workspace missing".to_string()))?;
        let weight = &params[0];
        let bias = params.get(1);

        match &self.backend {
            Backend::Cpu => {
                cpu::forward(
                    &geometry,
                    input.host_data()?,
                    weight.host_data()?,
                    bias.map(|b| b.host_data()).transpose()?,
                    workspace.host_data_mut()?,
                    output.host_data_mut()?,
                    activation,
                )?;
                ectx.record_host_event("conv2d", geometry.batch);
                Ok(())
            }
            Backend::Gpu(kernels) => {
                let kernels = kernels.as_ref().ok_or_else(|| {
                    Error::Validation("Convolution2D kernels missing".to_string())
                })?;
                kernels.forward(
                    &ctx,
                    &geometry,
                    input,
                    weight,
                    bias,
                    workspace,
                    output,
                    ectx,
                )
            }
        }
    }

    fn backward_data(
        &mut self,
        _outputs: &[Tensor],
        _output_diff: &[Tensor],
        _inputs: &[Tensor],
        _input_diff: &mut [Tensor],
        _ectx: &ExecutionContext,
    ) -> Result<()> {
        Err(Error::NotImplemented("Convolution2D::backward_data".to_string()))
    }

    fn backward_param(
        &mut self,
        _outputs: &[Tensor],
        _output_diff: &[Tensor],
        _inputs: &[Tensor],
        _param_diff: &mut [Tensor],
        _ectx: &ExecutionContext,
    ) -> Result<()> {
        Err(Error::NotImplemented("Convolution2D::backward_param".to_string()))
    }

    fn parameters(&self) -> &[Tensor] {
        self.store.parameters()
    }

    fn parameters_mut(&mut self) -> &mut [Tensor] {
        self.store.parameters_mut()
    }
}
