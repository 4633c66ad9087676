//! Device convolution: one im2col launch and one GEMM launch per batch item.

use super::{ConvGeometry, Convolution2DConfig};
use crate::kernels::{self, to_u32, uniform_buffer, workgroups};
use std::sync::Arc;
use tessera_core::{
    Context, ExecutionContext, KernelLaunch, Program, ProgramKey, Result, Tensor,
};

const IM2COL_WORKGROUP: usize = 64;
const TILE_SIZE: usize = 128;
const BLOCK_SIZE: usize = 8;
const LOCAL_SIZE: usize = TILE_SIZE / BLOCK_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Im2colParams {
    channels: u32,
    in_h: u32,
    in_w: u32,
    out_h: u32,
    out_w: u32,
    src_offset: u32,
    dst_offset: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GemmParams {
    m: u32,
    n: u32,
    k: u32,
    a_offset: u32,
    lda: u32,
    b_offset: u32,
    ldb: u32,
    c_offset: u32,
    ldc: u32,
    bias_offset: u32,
    _pad0: u32,
    _pad1: u32,
}

fn as_param(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn program_keys(config: &Convolution2DConfig) -> [ProgramKey; 2] {
    let im2col = ProgramKey::new("im2col")
        .param("KERN_H", as_param(config.kernel[0]))
        .param("KERN_W", as_param(config.kernel[1]))
        .param("PAD_H", as_param(config.pad[0]))
        .param("PAD_W", as_param(config.pad[1]))
        .param("STRIDE_H", as_param(config.stride[0]))
        .param("STRIDE_W", as_param(config.stride[1]))
        .param("DILATE_H", as_param(config.dilate[0]))
        .param("DILATE_W", as_param(config.dilate[1]));

    let gemm = ProgramKey::new("sgemm")
        .param("BIAS", i32::from(config.bias))
        .param("BTRANS", 1)
        .param("ACTIVATION", config.activation.code())
        .param("TILE_SIZE", as_param(TILE_SIZE))
        .param("BLOCK_SIZE", as_param(BLOCK_SIZE))
        .param("LOCAL_SIZE", as_param(LOCAL_SIZE));

    [im2col, gemm]
}

/// Compiled programs for one convolution configuration.
pub(crate) struct ConvKernels {
    im2col: Arc<Program>,
    gemm: Arc<Program>,
}

impl ConvKernels {
    pub fn new(ctx: &Context, config: &Convolution2DConfig) -> Result<Self> {
        let [im2col_key, gemm_key] = program_keys(config);
        Ok(Self {
            im2col: ctx.get_program(&im2col_key, kernels::IM2COL)?,
            gemm: ctx.get_program(&gemm_key, kernels::SGEMM)?,
        })
    }

    /// Enqueue the whole batch as a series of 2 × batch launches.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        ctx: &Context,
        g: &ConvGeometry,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        workspace: &Tensor,
        output: &Tensor,
        ectx: &ExecutionContext,
    ) -> Result<()> {
        let device = ctx.device()?;
        let input = input.device_view()?;
        let weight = weight.device_view()?;
        let bias = bias.map(Tensor::device_view).transpose()?;
        let workspace = workspace.device_view()?;
        let output = output.device_view()?;

        let m = g.channels_out;
        let k = g.im2col_width();
        let n = g.plane();

        let im2col_groups = workgroups(
            device,
            [n.div_ceil(IM2COL_WORKGROUP), g.channels_in, 1],
        )?;
        let gemm_groups = workgroups(device, [m.div_ceil(TILE_SIZE), n.div_ceil(TILE_SIZE), 1])?;

        let total = 2 * g.batch;
        for item in 0..g.batch {
            let src_offset = to_u32(input.offset + item * g.input_item(), "input offset")?;
            let dst_offset = to_u32(output.offset + item * g.output_item(), "output offset")?;

            let params = uniform_buffer(
                device,
                "im2col_params",
                &Im2colParams {
                    channels: to_u32(g.channels_in, "channels_in")?,
                    in_h: to_u32(g.in_h, "input height")?,
                    in_w: to_u32(g.in_w, "input width")?,
                    out_h: to_u32(g.out_h, "output height")?,
                    out_w: to_u32(g.out_w, "output width")?,
                    src_offset,
                    dst_offset: workspace.offset_u32()?,
                    _pad: 0,
                },
            );
            ectx.generate_series_context(2 * item, total)
                .enqueue_kernel(KernelLaunch {
                    name: "im2col",
                    index: item,
                    program: &self.im2col,
                    buffers: &[&params, input.buffer, workspace.buffer],
                    workgroups: im2col_groups,
                })?;

            let params = uniform_buffer(
                device,
                "gemm_params",
                &GemmParams {
                    m: to_u32(m, "channels_out")?,
                    n: to_u32(n, "output plane")?,
                    k: to_u32(k, "im2col width")?,
                    a_offset: weight.offset_u32()?,
                    lda: to_u32(k, "im2col width")?,
                    b_offset: workspace.offset_u32()?,
                    ldb: to_u32(k, "im2col width")?,
                    c_offset: dst_offset,
                    ldc: to_u32(n, "output plane")?,
                    bias_offset: bias.map(|b| b.offset_u32()).transpose()?.unwrap_or(0),
                    _pad0: 0,
                    _pad1: 0,
                },
            );
            let mut buffers = vec![&params, weight.buffer, workspace.buffer, output.buffer];
            if let Some(bias) = &bias {
                buffers.push(bias.buffer);
            }
            ectx.generate_series_context(2 * item + 1, total)
                .enqueue_kernel(KernelLaunch {
                    name: "gemm",
                    index: item,
                    program: &self.gemm,
                    buffers: &buffers,
                    workgroups: gemm_groups,
                })?;
        }

        tracing::debug!(
            batch = g.batch,
            m,
            n,
            k,
            launches = total,
            "conv2d enqueued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Activation;

    #[test]
    fn test_local_size_covers_tile() {
        assert_eq!(LOCAL_SIZE * BLOCK_SIZE, TILE_SIZE);
    }

    #[test]
    fn test_gemm_key_tracks_bias_and_activation() {
        let mut config = Convolution2DConfig::new(8, 1);
        let [_, with_bias] = program_keys(&config);

        config.bias = false;
        config.activation = Activation::Sigmoid;
        let [_, without_bias] = program_keys(&config);

        assert_ne!(with_bias, without_bias);
        assert!(without_bias.label().starts_with("sgemm[BIAS=0,BTRANS=1,ACTIVATION=3,"));
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<Im2colParams>(), 32);
        assert_eq!(std::mem::size_of::<GemmParams>(), 48);
    }
}
