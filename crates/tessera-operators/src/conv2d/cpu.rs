//! Host convolution: im2col into the workspace, then sgemm per batch item.

use super::ConvGeometry;
use crate::activation::apply_activation;
use tessera_core::{Activation, Result, ensure};

/// Expand one image (C×H×W) into the im2col matrix `cols`.
///
/// Row `r * out_w + c` holds output position (r, c). Columns run over input
/// channels, then kernel rows, then kernel columns; out-of-image taps are zero.
pub(crate) fn im2col(g: &ConvGeometry, image: &[f32], cols: &mut [f32]) {
    let [kern_h, kern_w] = g.kernel;
    let window = kern_h * kern_w;
    let row_width = g.im2col_width();

    for chan in 0..g.channels_in {
        let plane = &image[chan * g.in_h * g.in_w..(chan + 1) * g.in_h * g.in_w];
        for r in 0..g.out_h {
            for c in 0..g.out_w {
                let row = r * g.out_w + c;
                let start = row * row_width + chan * window;
                let dst = &mut cols[start..start + window];

                let y0 = (r * g.stride[0]) as isize - g.pad[0] as isize;
                let x0 = (c * g.stride[1]) as isize - g.pad[1] as isize;
                for dy in 0..kern_h {
                    let y = y0 + (dy * g.dilate[0]) as isize;
                    for dx in 0..kern_w {
                        let x = x0 + (dx * g.dilate[1]) as isize;
                        let inside = y >= 0
                            && (y as usize) < g.in_h
                            && x >= 0
                            && (x as usize) < g.in_w;
                        dst[dy * kern_w + dx] = if inside {
                            plane[y as usize * g.in_w + x as usize]
                        } else {
                            0.0
                        };
                    }
                }
            }
        }
    }
}

/// Convolve the whole batch on the host.
pub(crate) fn forward(
    g: &ConvGeometry,
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    workspace: &mut [f32],
    output: &mut [f32],
    activation: Activation,
) -> Result<()> {
    let m = g.channels_out;
    let k = g.im2col_width();
    let n = g.plane();

    ensure!(input.len() >= g.batch * g.input_item(), "input buffer too small");
    ensure!(output.len() >= g.batch * g.output_item(), "output buffer too small");
    ensure!(weight.len() >= m * k, "weight buffer too small");
    ensure!(workspace.len() >= k * n, "workspace too small");
    if let Some(bias) = bias {
        ensure!(bias.len() >= m, "bias buffer too small");
    }

    let cols = &mut workspace[..k * n];
    for b in 0..g.batch {
        let image = &input[b * g.input_item()..(b + 1) * g.input_item()];
        let out = &mut output[b * g.output_item()..(b + 1) * g.output_item()];

        im2col(g, image, cols);

        // out (M×N) = weight (M×K) · colsᵀ, with cols stored N×K
        // SAFETY: the length checks above give weight >= M·K, cols == K·N and
        // out == M·N elements, and every (row, col) stride pair below stays
        // inside those extents.
        unsafe {
            matrixmultiply::sgemm(
                m,
                k,
                n,
                1.0,
                weight.as_ptr(),
                k as isize,
                1,
                cols.as_ptr(),
                1,
                k as isize,
                0.0,
                out.as_mut_ptr(),
                n as isize,
                1,
            );
        }

        if let Some(bias) = bias {
            for (plane, &shift) in out.chunks_exact_mut(n).zip(bias) {
                plane.iter_mut().for_each(|v| *v += shift);
            }
        }
    }

    apply_activation(&mut output[..g.batch * g.output_item()], activation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(channels_in: usize, in_hw: [usize; 2], kernel: usize, pad: usize, stride: usize) -> ConvGeometry {
        let out_h = (in_hw[0] + 2 * pad - kernel) / stride + 1;
        let out_w = (in_hw[1] + 2 * pad - kernel) / stride + 1;
        ConvGeometry {
            batch: 1,
            channels_in,
            in_h: in_hw[0],
            in_w: in_hw[1],
            channels_out: 1,
            out_h,
            out_w,
            kernel: [kernel; 2],
            stride: [stride; 2],
            pad: [pad; 2],
            dilate: [1; 2],
        }
    }

    #[test]
    fn test_im2col_1x1_is_transposed_input() {
        let g = geometry(3, [2, 4], 1, 0, 1);
        let image: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let mut cols = vec![-1.0; g.workspace_len()];
        im2col(&g, &image, &mut cols);

        // (H·W, C): row p holds channel values at position p
        for p in 0..8 {
            for chan in 0..3 {
                assert_eq!(cols[p * 3 + chan], image[chan * 8 + p], "position {p} channel {chan}");
            }
        }
    }

    #[test]
    fn test_im2col_padding_is_zero() {
        let g = geometry(1, [2, 2], 3, 1, 1);
        let image = [1.0, 2.0, 3.0, 4.0];
        let mut cols = vec![-1.0; g.workspace_len()];
        im2col(&g, &image, &mut cols);

        assert_eq!((g.out_h, g.out_w), (2, 2));
        // Window of output (0, 0) covers rows -1..=1, cols -1..=1
        assert_eq!(&cols[..9], &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
        // Window of output (1, 1) covers rows 0..=2, cols 0..=2
        assert_eq!(&cols[27..36], &[1.0, 2.0, 0.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_im2col_stride_and_dilation() {
        let mut g = geometry(1, [5, 5], 2, 0, 2);
        g.dilate = [2, 2];
        g.out_h = 2;
        g.out_w = 2;
        let image: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let mut cols = vec![-1.0; g.workspace_len()];
        im2col(&g, &image, &mut cols);

        // Output (1, 0) starts at (2, 0) and samples rows 2, 4 and cols 0, 2
        assert_eq!(&cols[8..12], &[10.0, 12.0, 20.0, 22.0]);
        // Output (1, 1) starts at (2, 2)
        assert_eq!(&cols[12..16], &[12.0, 14.0, 22.0, 24.0]);
    }

    #[test]
    fn test_forward_single_channel() {
        let g = geometry(1, [3, 3], 2, 0, 1);
        let input: Vec<f32> = (1..=9).map(|i| i as f32).collect();
        let weight = [1.0, 0.0, 0.0, -1.0];
        let bias = [0.5];
        let mut workspace = vec![0.0; g.workspace_len()];
        let mut output = vec![0.0; g.output_item()];

        forward(&g, &input, &weight, Some(&bias), &mut workspace, &mut output, Activation::Identity)
            .unwrap();
        // x[r][c] - x[r+1][c+1] is always -4
        assert_eq!(output, vec![-3.5; 4]);

        forward(&g, &input, &weight, Some(&bias), &mut workspace, &mut output, Activation::Relu)
            .unwrap();
        assert_eq!(output, vec![0.0; 4]);
    }

    #[test]
    fn test_forward_rejects_short_buffers() {
        let g = geometry(1, [3, 3], 2, 0, 1);
        let mut workspace = vec![0.0; 2];
        let mut output = vec![0.0; 4];
        let err = forward(&g, &[0.0; 9], &[0.0; 4], None, &mut workspace, &mut output, Activation::Identity)
            .unwrap_err();
        assert!(err.is_validation());
    }
}
