//! Compute kernels for expert-routed matrix multiplication.
//!
//! The MoE modules never touch weight bytes directly; everything they need is
//! expressed through the small set of primitives in this module:
//!
//! - `gather_matmul` / `gather_quantized_matmul`: batched matmul where each
//!   input row is multiplied against the weight matrix of the expert named by
//!   its index. When the index slice is sorted, same-expert rows form
//!   contiguous runs and each run becomes a single GEMM.
//! - `expert_runs`: run detection over a sorted index slice.
//! - element-wise activations (SiLU, exact and tanh-approximate GELU).

use crate::quantization::QuantizedExpertWeight;
use crate::tensor::{Tensor2, Tensor3};
use ndarray::{s, Axis};
use std::ops::Range;

#[cfg(feature = "parallel")]
use rayon::prelude::*;


/// Split a non-decreasing index slice into maximal runs of equal values.
/// Returns (expert, row range) pairs covering [0, indices.len()).
pub fn expert_runs(indices: &[usize]) -> Vec<(usize, Range<usize>)> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=indices.len() {
        if i == indices.len() || indices[i] != indices[start] {
            runs.push((indices[start], start..i));
            start = i;
        }
    }
    runs
}

/// Indexed batched matmul: out[i] = weight[indices[i]] @ x[i].
/// x: (n, in_dims), weight: (num_experts, out_dims, in_dims) -> out: (n, out_dims)
///
/// With `assume_sorted` the indices are taken to be non-decreasing and each
/// run of equal indices is computed as one (run_len, in_dims) x
/// (in_dims, out_dims) GEMM. The caller must have actually sorted; this is
/// checked by the modules in debug builds, not here.
pub fn gather_matmul(
    x: &Tensor2,
    weight: &Tensor3,
    indices: &[usize],
    assume_sorted: bool,
) -> Tensor2 {
    let n = x.nrows();
    let out_dims = weight.dim().1;
    let mut y = Tensor2::zeros((n, out_dims));

    if assume_sorted {
        let runs = expert_runs(indices);

        #[cfg(feature = "parallel")]
        {
            let blocks: Vec<(Range<usize>, Tensor2)> = runs
                .par_iter()
                .map(|(expert, range)| {
                    let w = weight.index_axis(Axis(0), *expert);
                    let block = x.slice(s![range.clone(), ..]).dot(&w.t());
                    (range.clone(), block)
                })
                .collect();
            for (range, block) in blocks {
                y.slice_mut(s![range, ..]).assign(&block);
            }
        }

        #[cfg(not(feature = "parallel"))]
        for (expert, range) in runs {
            let w = weight.index_axis(Axis(0), expert);
            let block = x.slice(s![range.clone(), ..]).dot(&w.t());
            y.slice_mut(s![range, ..]).assign(&block);
        }
    } else {
        for (i, &expert) in indices.iter().enumerate() {
            let w = weight.index_axis(Axis(0), expert);
            y.row_mut(i).assign(&w.dot(&x.row(i)));
        }
    }

    y
}

/// Indexed batched matmul against group-quantized expert weights.
/// Same contract as `gather_matmul`; the result is within quantization error
/// of the full-precision computation, not bit-exact.
///
/// The sorted path dequantizes each expert matrix once per run and reuses the
/// GEMM; the unsorted path uses the fused dequantize-dot kernel row by row and
/// never materializes a weight matrix.
pub fn gather_quantized_matmul(
    x: &Tensor2,
    weight: &QuantizedExpertWeight,
    indices: &[usize],
    assume_sorted: bool,
) -> Tensor2 {
    let n = x.nrows();
    let out_dims = weight.output_dims();
    let mut y = Tensor2::zeros((n, out_dims));

    if assume_sorted {
        for (expert, range) in expert_runs(indices) {
            let w = weight.dequantize_expert(expert);
            let block = x.slice(s![range.clone(), ..]).dot(&w.t());
            y.slice_mut(s![range, ..]).assign(&block);
        }
    } else {
        for (i, &expert) in indices.iter().enumerate() {
            y.row_mut(i).assign(&weight.matvec(expert, x.row(i)));
        }
    }

    y
}

/// SiLU activation: x * sigmoid(x)
pub fn silu(x: &Tensor2) -> Tensor2 {
    x.mapv(|v| v / (1.0 + (-v).exp()))
}

/// Exact GELU: 0.5 * x * (1 + erf(x / sqrt(2)))
pub fn gelu(x: &Tensor2) -> Tensor2 {
    x.mapv(|v| 0.5 * v * (1.0 + erf(v * std::f32::consts::FRAC_1_SQRT_2)))
}

/// Tanh-approximate GELU: 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
pub fn gelu_approx(x: &Tensor2) -> Tensor2 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    x.mapv(|v| 0.5 * v * (1.0 + (SQRT_2_OVER_PI * (v + 0.044715 * v * v * v)).tanh()))
}

/// Error function, Abramowitz & Stegun 7.1.26 rational approximation.
/// Absolute error below 1.5e-7, more than enough for f32 activations.
pub fn erf(x: f32) -> f32 {
    const A1: f32 = 0.254829592;
    const A2: f32 = -0.284496736;
    const A3: f32 = 1.421413741;
    const A4: f32 = -1.453152027;
    const A5: f32 = 1.061405429;
    const P: f32 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
