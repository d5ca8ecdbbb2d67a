//! Group-wise affine quantization for expert weight tensors.
//!
//! Each weight row is split into groups of `group_size` consecutive input-dim
//! elements. A group stores one (scale, min) pair and `group_size` unsigned
//! codes of `bits` width packed into bytes:
//!
//! ```text
//! dequantize: w[j] = code[j] * scale[g] + min[g]      (g = j / group_size)
//! quantize:   code[j] = round((w[j] - min[g]) / scale[g])   in [0, 2^bits - 1]
//! ```
//!
//! Scales and mins are rounded through f16 before use, so the packed form is
//! exactly reproducible from half-precision storage. Codes are packed
//! low-bits-first within each byte (4-bit: lower nibble first).

use crate::tensor::{Tensor1, Tensor2, Tensor3};
use anyhow::{bail, Result};
use half::f16;
use ndarray::{Array3, ArrayView1};

/// Per-expert weight tensor in group-quantized form.
///
/// Logical shape is [num_experts, output_dims, input_dims], same as the
/// full-precision tensor it was built from. `input_dims` is derived from the
/// scales shape and `group_size`, never stored.
#[derive(Debug, Clone)]
pub struct QuantizedExpertWeight {
    /// Packed codes: [num_experts, output_dims, input_dims * bits / 8]
    packed: Array3<u8>,
    /// Per-group scales: [num_experts, output_dims, input_dims / group_size]
    scales: Tensor3,
    /// Per-group minimums: [num_experts, output_dims, input_dims / group_size]
    mins: Tensor3,
    group_size: usize,
    bits: u32,
}

/// Quantize a per-expert weight tensor [num_experts, output_dims, input_dims].
///
/// `group_size` must divide `input_dims` and be a multiple of the per-byte
/// packing factor; `bits` must be 2, 4 or 8. Both are validated here, at
/// construction time, so the compute path never has to.
pub fn quantize(weight: &Tensor3, group_size: usize, bits: u32) -> Result<QuantizedExpertWeight> {
    let (num_experts, output_dims, input_dims) = weight.dim();

    if !matches!(bits, 2 | 4 | 8) {
        bail!("unsupported quantization width: {} bits (expected 2, 4 or 8)", bits);
    }
    let values_per_byte = (8 / bits) as usize;
    if group_size == 0 || input_dims % group_size != 0 {
        bail!(
            "group_size {} must divide input_dims {}",
            group_size,
            input_dims
        );
    }
    if group_size % values_per_byte != 0 {
        bail!(
            "group_size {} must be a multiple of {} for {}-bit packing",
            group_size,
            values_per_byte,
            bits
        );
    }

    let groups = input_dims / group_size;
    let levels = ((1u32 << bits) - 1) as f32;

    let mut packed = Array3::<u8>::zeros((num_experts, output_dims, input_dims / values_per_byte));
    let mut scales = Tensor3::zeros((num_experts, output_dims, groups));
    let mut mins = Tensor3::zeros((num_experts, output_dims, groups));

    for e in 0..num_experts {
        for o in 0..output_dims {
            for g in 0..groups {
                let base = g * group_size;

                let mut lo = f32::INFINITY;
                let mut hi = f32::NEG_INFINITY;
                for j in base..base + group_size {
                    let v = weight[[e, o, j]];
                    lo = lo.min(v);
                    hi = hi.max(v);
                }

                // Round through f16 so dequantization matches what a
                // half-precision scale store would produce.
                let raw_scale = (hi - lo) / levels;
                let scale = if raw_scale > 0.0 {
                    f16::from_f32(raw_scale).to_f32()
                } else {
                    1.0
                };
                let min = f16::from_f32(lo).to_f32();
                scales[[e, o, g]] = scale;
                mins[[e, o, g]] = min;

                for j in base..base + group_size {
                    let code = ((weight[[e, o, j]] - min) / scale)
                        .round()
                        .clamp(0.0, levels) as u8;
                    packed[[e, o, j / values_per_byte]] |= code << ((j % values_per_byte) as u32 * bits);
                }
            }
        }
    }

    Ok(QuantizedExpertWeight {
        packed,
        scales,
        mins,
        group_size,
        bits,
    })
}

impl QuantizedExpertWeight {
    pub fn num_experts(&self) -> usize {
        self.packed.dim().0
    }

    pub fn output_dims(&self) -> usize {
        self.packed.dim().1
    }

    /// Derived from the scales shape, not stored: groups * group_size.
    pub fn input_dims(&self) -> usize {
        self.scales.dim().2 * self.group_size
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Unpack the code for input element j of row o of the given expert.
    #[inline]
    fn code(&self, expert: usize, o: usize, j: usize) -> u8 {
        let values_per_byte = (8 / self.bits) as usize;
        let byte = self.packed[[expert, o, j / values_per_byte]];
        let shift = (j % values_per_byte) as u32 * self.bits;
        let mask = ((1u32 << self.bits) - 1) as u8;
        (byte >> shift) & mask
    }

    /// Dequantize one expert's weight matrix to [output_dims, input_dims].
    pub fn dequantize_expert(&self, expert: usize) -> Tensor2 {
        Tensor2::from_shape_fn((self.output_dims(), self.input_dims()), |(o, j)| {
            let g = j / self.group_size;
            self.code(expert, o, j) as f32 * self.scales[[expert, o, g]] + self.mins[[expert, o, g]]
        })
    }

    /// Dequantize the full tensor to [num_experts, output_dims, input_dims].
    pub fn dequantize(&self) -> Tensor3 {
        Tensor3::from_shape_fn(
            (self.num_experts(), self.output_dims(), self.input_dims()),
            |(e, o, j)| {
                let g = j / self.group_size;
                self.code(e, o, j) as f32 * self.scales[[e, o, g]] + self.mins[[e, o, g]]
            },
        )
    }

    /// Fused dequantize-dot: weight[expert] @ x without materializing the
    /// expert matrix. x: (input_dims,) -> out: (output_dims,)
    pub fn matvec(&self, expert: usize, x: ArrayView1<f32>) -> Tensor1 {
        let groups = self.scales.dim().2;
        let mut y = Tensor1::zeros(self.output_dims());
        for o in 0..self.output_dims() {
            let mut acc = 0.0f32;
            for g in 0..groups {
                let scale = self.scales[[expert, o, g]];
                let min = self.mins[[expert, o, g]];
                let base = g * self.group_size;
                for j in base..base + self.group_size {
                    acc += (self.code(expert, o, j) as f32 * scale + min) * x[j];
                }
            }
            y[o] = acc;
        }
        y
    }

    /// Bytes consumed by packed codes plus scale/min storage (at f16 width).
    pub fn memory_bytes(&self) -> usize {
        self.packed.len() + 2 * self.scales.len() + 2 * self.mins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor3;

    fn test_weight(num_experts: usize, output_dims: usize, input_dims: usize) -> Tensor3 {
        // Deterministic values spread over roughly [-0.25, 0.25], the range a
        // sqrt(1/input_dims) uniform init produces for input_dims = 16.
        Tensor3::from_shape_fn((num_experts, output_dims, input_dims), |(e, o, j)| {
            let v = (e * 31 + o * 7 + j * 13) % 101;
            (v as f32 - 50.0) / 200.0
        })
    }

    #[test]
    fn test_rejects_bad_group_size() {
        let w = test_weight(2, 4, 48);
        assert!(quantize(&w, 64, 4).is_err());
        assert!(quantize(&w, 0, 4).is_err());
    }

    #[test]
    fn test_rejects_bad_bits() {
        let w = test_weight(2, 4, 64);
        assert!(quantize(&w, 32, 3).is_err());
        assert!(quantize(&w, 32, 16).is_err());
    }

    #[test]
    fn test_derived_dims() {
        let w = test_weight(3, 5, 64);
        let q = quantize(&w, 32, 4).unwrap();
        assert_eq!(q.num_experts(), 3);
        assert_eq!(q.output_dims(), 5);
        assert_eq!(q.input_dims(), 64);
        assert_eq!(q.group_size(), 32);
        assert_eq!(q.bits(), 4);
    }

    #[test]
    fn test_roundtrip_4bit() {
        let w = test_weight(2, 4, 64);
        let q = quantize(&w, 64, 4).unwrap();
        let back = q.dequantize();

        // 4-bit codes over a ~0.5-wide group give a step of ~0.034; rounding
        // error is at most half a step plus f16 noise on scale/min.
        let mut max_err = 0.0f32;
        for (orig, rec) in w.iter().zip(back.iter()) {
            max_err = max_err.max((orig - rec).abs());
        }
        assert!(max_err < 0.05, "4-bit max error too high: {}", max_err);
    }

    #[test]
    fn test_roundtrip_8bit() {
        let w = test_weight(2, 4, 64);
        let q = quantize(&w, 32, 8).unwrap();
        let back = q.dequantize();

        let mut max_err = 0.0f32;
        for (orig, rec) in w.iter().zip(back.iter()) {
            max_err = max_err.max((orig - rec).abs());
        }
        assert!(max_err < 0.005, "8-bit max error too high: {}", max_err);
    }

    #[test]
    fn test_constant_group() {
        // A constant group has zero range; scale falls back to 1.0 and every
        // code quantizes to 0, so dequantization returns the (f16) min.
        let w = Tensor3::from_elem((1, 2, 32), 0.125);
        let q = quantize(&w, 32, 4).unwrap();
        let back = q.dequantize();
        for &v in back.iter() {
            assert!((v - 0.125).abs() < 1e-3);
        }
    }

    #[test]
    fn test_matvec_matches_dequantized_dot() {
        let w = test_weight(3, 6, 32);
        let q = quantize(&w, 32, 8).unwrap();
        let x = crate::tensor::Tensor1::from_shape_fn(32, |j| (j as f32 - 16.0) / 8.0);

        for e in 0..3 {
            let fused = q.matvec(e, x.view());
            let reference = q.dequantize_expert(e).dot(&x);
            for (a, b) in fused.iter().zip(reference.iter()) {
                assert!((a - b).abs() < 1e-4, "fused {} vs dequantized {}", a, b);
            }
        }
    }

    #[test]
    fn test_memory_smaller_than_f32() {
        let w = test_weight(4, 16, 128);
        let q = quantize(&w, 64, 4).unwrap();
        let f32_bytes = w.len() * 4;
        assert!(q.memory_bytes() * 4 < f32_bytes, "4-bit should compress >4x");
    }
}
