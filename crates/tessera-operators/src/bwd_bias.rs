//! Bias gradient: `dw = beta * dw + sum over batch and spatial positions of dy`.
//!
//! `dy` is laid out `[batch, features, rows_columns]` (any trailing spatial
//! dims flatten into `rows_columns`) and `dw` is `[features]`.

use crate::kernels::{self, to_u32, uniform_buffer, workgroups};
use std::sync::Arc;
use tessera_core::{
    Context, DataType, ExecutionContext, KernelLaunch, Program, ProgramKey, Result,
    Tensor, ensure,
};

const SCAL_WORKGROUP: usize = 256;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ReduceParams {
    batch: u32,
    features: u32,
    dy_offset: u32,
    dw_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ScalParams {
    n: u32,
    offset: u32,
    beta: f32,
    _pad: u32,
}

struct GpuKernels {
    reduce: Arc<Program>,
    scal: Arc<Program>,
}

/// Bias-gradient reduction for a fixed spatial extent.
pub struct BWBias {
    ctx: Context,
    rows_columns: usize,
    gpu: Option<GpuKernels>,
}

impl BWBias {
    /// Build the reduction for `rows_columns` spatial positions per feature.
    ///
    /// On a GPU context both kernels are compiled (or fetched from the cache)
    /// here, so `backward` never compiles.
    pub fn new(ctx: &Context, rows_columns: usize, dtype: DataType) -> Result<Self> {
        ensure!(dtype == DataType::F32, "BWBias supports float32 only, got {dtype}");
        ensure!(rows_columns > 0, "BWBias needs a positive spatial extent");

        let gpu = if ctx.is_cpu_context() {
            None
        } else {
            let [reduce_key, scal_key] = Self::program_keys(rows_columns);
            Some(GpuKernels {
                reduce: ctx.get_program(&reduce_key, kernels::BWD_BIAS)?,
                scal: ctx.get_program(&scal_key, kernels::SCAL)?,
            })
        };

        Ok(Self {
            ctx: ctx.clone(),
            rows_columns,
            gpu,
        })
    }

    /// Workgroup size used by the reduction kernel.
    pub fn wg_size(rows_columns: usize) -> usize {
        match rows_columns {
            0..=64 => 64,
            65..=128 => 128,
            _ => 256,
        }
    }

    pub fn program_keys(rows_columns: usize) -> [ProgramKey; 2] {
        let wg = Self::wg_size(rows_columns);
        let clamp = |v: usize| i32::try_from(v).unwrap_or(i32::MAX);
        [
            ProgramKey::new("bwd_bias")
                .param("WG_SIZE", clamp(wg))
                .param("ITEMS_PER_WI", clamp(rows_columns.div_ceil(wg)))
                .param("SIZE_2D", clamp(rows_columns)),
            ProgramKey::new("scal"),
        ]
    }

    pub fn rows_columns(&self) -> usize {
        self.rows_columns
    }

    /// Accumulate the bias gradient of `dy` into `dw`.
    #[tracing::instrument(skip_all, fields(op = "BWBias", beta = beta))]
    pub fn backward(&self, dy: &Tensor, dw: &mut Tensor, beta: f32, ectx: &ExecutionContext) -> Result<()> {
        ensure!(
            dw.shape().rank() == 1,
            "BWBias expects a 1-d gradient, got {}",
            dw.shape()
        );
        ensure!(dy.shape().rank() >= 2, "BWBias expects batched input, got {}", dy.shape());
        let batch = dy.shape()[0];
        let features = dw.shape()[0];
        ensure!(features > 0, "BWBias gradient has no features");
        ensure!(
            dy.shape()[1] == features,
            "BWBias input {} does not match {features} features",
            dy.shape()
        );
        ensure!(
            dy.len() == batch * features * self.rows_columns,
            "BWBias input {} does not have {} positions per feature",
            dy.shape(),
            self.rows_columns
        );

        match &self.gpu {
            None => {
                self.backward_cpu(dy.host_data()?, dw.host_data_mut()?, batch, beta);
                ectx.record_host_event("bwd_bias", 0);
                Ok(())
            }
            Some(kernels) => self.backward_gpu(kernels, dy, dw, batch, features, beta, ectx),
        }
    }

    fn backward_cpu(&self, dy: &[f32], dw: &mut [f32], batch: usize, beta: f32) {
        if beta == 0.0 {
            dw.fill(0.0);
        } else {
            dw.iter_mut().for_each(|w| *w *= beta);
        }

        let features = dw.len();
        if self.rows_columns == 1 {
            for item in dy.chunks_exact(features).take(batch) {
                dw.iter_mut().zip(item).for_each(|(w, g)| *w += g);
            }
        } else {
            let per_item = features * self.rows_columns;
            for item in dy.chunks_exact(per_item).take(batch) {
                for (w, plane) in dw.iter_mut().zip(item.chunks_exact(self.rows_columns)) {
                    *w += plane.iter().sum::<f32>();
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_gpu(
        &self,
        kernels: &GpuKernels,
        dy: &Tensor,
        dw: &Tensor,
        batch: usize,
        features: usize,
        beta: f32,
        ectx: &ExecutionContext,
    ) -> Result<()> {
        let device = self.ctx.device()?;
        let dy = dy.device_view()?;
        let dw = dw.device_view()?;

        let params = uniform_buffer(
            device,
            "scal_params",
            &ScalParams {
                n: to_u32(features, "features")?,
                offset: dw.offset_u32()?,
                beta,
                _pad: 0,
            },
        );
        ectx.generate_series_context(0, 2).enqueue_kernel(KernelLaunch {
            name: "bwd_bias_scal",
            index: 0,
            program: &kernels.scal,
            buffers: &[&params, dw.buffer],
            workgroups: workgroups(device, [features.div_ceil(SCAL_WORKGROUP), 1, 1])?,
        })?;

        let params = uniform_buffer(
            device,
            "bwd_bias_params",
            &ReduceParams {
                batch: to_u32(batch, "batch")?,
                features: to_u32(features, "features")?,
                dy_offset: dy.offset_u32()?,
                dw_offset: dw.offset_u32()?,
            },
        );
        ectx.generate_series_context(1, 2).enqueue_kernel(KernelLaunch {
            name: "bwd_bias",
            index: 0,
            program: &kernels.reduce,
            buffers: &[&params, dy.buffer, dw.buffer],
            workgroups: workgroups(device, [features, 1, 1])?,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(rows_columns: usize, dy_shape: &[usize], dy: &[f32], dw: &[f32], beta: f32) -> Vec<f32> {
        let ctx = Context::cpu();
        let op = BWBias::new(&ctx, rows_columns, DataType::F32).unwrap();
        let dy = Tensor::from_host(&ctx, dy_shape, dy).unwrap();
        let mut dw = Tensor::from_host(&ctx, [dw.len()], dw).unwrap();
        op.backward(&dy, &mut dw, beta, &ExecutionContext::new(&ctx)).unwrap();
        dw.host_data().unwrap().to_vec()
    }

    #[test]
    fn test_wg_size_selection() {
        assert_eq!(BWBias::wg_size(1), 64);
        assert_eq!(BWBias::wg_size(64), 64);
        assert_eq!(BWBias::wg_size(65), 128);
        assert_eq!(BWBias::wg_size(128), 128);
        assert_eq!(BWBias::wg_size(129), 256);
        assert_eq!(BWBias::wg_size(4096), 256);
    }

    #[test]
    fn test_program_keys() {
        let [reduce, scal] = BWBias::program_keys(300);
        assert_eq!(reduce.label(), "bwd_bias[WG_SIZE=256,ITEMS_PER_WI=2,SIZE_2D=300]");
        assert_eq!(scal.label(), "scal[]");
    }

    #[test]
    fn test_feature_sum_beta_zero() {
        let dy = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let dw = run(1, &[2, 3], &dy, &[100.0, 100.0, 100.0], 0.0);
        assert_eq!(dw, vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_feature_sum_beta_one() {
        let dy = [1.0, 2.0, 10.0, 20.0];
        let dw = run(1, &[2, 2], &dy, &[0.5, -1.0], 1.0);
        assert_eq!(dw, vec![11.5, 21.0]);
    }

    #[test]
    fn test_spatial_sum_scales_prior() {
        // batch 2, features 2, 2x2 spatial
        let dy: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let dw = run(4, &[2, 2, 2, 2], &dy, &[4.0, 8.0], 0.5);
        // f0: 1+2+3+4 + 9+10+11+12 = 52; f1: 5..=8 + 13..=16 = 84
        assert_eq!(dw, vec![2.0 + 52.0, 4.0 + 84.0]);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let ctx = Context::cpu();
        let ectx = ExecutionContext::new(&ctx);
        let op = BWBias::new(&ctx, 4, DataType::F32).unwrap();
        let dy = Tensor::from_host(&ctx, [2, 3, 2, 2], &[0.0; 24]).unwrap();

        let mut dw = Tensor::from_host(&ctx, [2], &[0.0; 2]).unwrap();
        assert!(op.backward(&dy, &mut dw, 0.0, &ectx).unwrap_err().is_validation());

        let mut dw = Tensor::from_host(&ctx, [3, 1], &[0.0; 3]).unwrap();
        assert!(op.backward(&dy, &mut dw, 0.0, &ectx).unwrap_err().is_validation());

        let op = BWBias::new(&ctx, 9, DataType::F32).unwrap();
        let mut dw = Tensor::from_host(&ctx, [3], &[0.0; 3]).unwrap();
        assert!(op.backward(&dy, &mut dw, 0.0, &ectx).unwrap_err().is_validation());
    }

    #[test]
    fn test_rejects_empty_features() {
        let ctx = Context::cpu();
        let ectx = ExecutionContext::new(&ctx);
        for (rows_columns, dy_shape) in [(1, vec![2, 0]), (4, vec![2, 0, 2, 2])] {
            let op = BWBias::new(&ctx, rows_columns, DataType::F32).unwrap();
            let dy = Tensor::from_host(&ctx, dy_shape.as_slice(), &[]).unwrap();
            let mut dw = Tensor::from_host(&ctx, [0], &[]).unwrap();
            let err = op.backward(&dy, &mut dw, 1.0, &ectx).unwrap_err();
            assert!(err.is_validation(), "rows_columns {rows_columns} gave {err}");
        }
    }

    #[test]
    fn test_rejects_non_float() {
        assert!(BWBias::new(&Context::cpu(), 4, DataType::I32).is_err());
        assert!(BWBias::new(&Context::cpu(), 0, DataType::F32).is_err());
    }
}
