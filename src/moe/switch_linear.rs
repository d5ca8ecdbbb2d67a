//! Indexed linear units: per-expert weight banks applied by index.
//!
//! A unit holds one weight matrix per expert, [num_experts, output_dims,
//! input_dims], and computes out[i] = weight[indices[i]] @ x[i] (+ bias) for
//! a batch of (activation row, expert id) pairs. `SwitchLinear` stores full
//! f32 weights; `QuantizedSwitchLinear` stores the group-quantized form. Both
//! share the `IndexedLinear` contract so expert blocks are generic over the
//! weight representation.

use crate::kernels;
use crate::quantization::{self, QuantizedExpertWeight};
use crate::tensor::{Tensor2, Tensor3};
use anyhow::{bail, Result};
use rand::Rng;

/// Common contract for plain and quantized units. `apply` computes one
/// matvec per input row against the expert named by the matching index.
///
/// `assume_sorted` is a caller guarantee that `indices` is non-decreasing so
/// the kernel may batch contiguous runs. It is set only by the dispatch
/// coordinator after actually sorting; debug builds verify it, release
/// builds trust it.
pub trait IndexedLinear {
    fn input_dims(&self) -> usize;
    fn output_dims(&self) -> usize;
    fn num_experts(&self) -> usize;
    fn apply(&self, x: &Tensor2, indices: &[usize], assume_sorted: bool) -> Result<Tensor2>;
}

/// Validate the shared apply contract before touching any weight data.
fn validate_apply<L: IndexedLinear + ?Sized>(
    unit: &L,
    x: &Tensor2,
    indices: &[usize],
    assume_sorted: bool,
) -> Result<()> {
    if x.ncols() != unit.input_dims() {
        bail!(
            "shape mismatch: input has {} features, unit expects {}",
            x.ncols(),
            unit.input_dims()
        );
    }
    if x.nrows() != indices.len() {
        bail!(
            "shape mismatch: {} input rows for {} expert indices",
            x.nrows(),
            indices.len()
        );
    }
    if let Some(&bad) = indices.iter().find(|&&e| e >= unit.num_experts()) {
        bail!(
            "expert index {} out of range for {} experts",
            bad,
            unit.num_experts()
        );
    }
    debug_assert!(
        !assume_sorted || indices.windows(2).all(|w| w[0] <= w[1]),
        "assume_sorted set on unsorted indices"
    );
    Ok(())
}

fn add_expert_bias(y: &mut Tensor2, bias: &Tensor2, indices: &[usize]) {
    for (i, &expert) in indices.iter().enumerate() {
        let mut row = y.row_mut(i);
        row += &bias.row(expert);
    }
}

/// Full-precision indexed linear unit.
///
/// Weight and bias are immutable after construction; `to_quantized` produces
/// a new unit and leaves this one untouched.
pub struct SwitchLinear {
    /// [num_experts, output_dims, input_dims]
    weight: Tensor3,
    /// [num_experts, output_dims]
    bias: Option<Tensor2>,
}

impl SwitchLinear {
    /// Uniform init over +-sqrt(1/input_dims), zero bias.
    pub fn new(input_dims: usize, output_dims: usize, num_experts: usize, bias: bool) -> Self {
        let scale = (1.0 / input_dims as f32).sqrt();
        let mut rng = rand::thread_rng();
        let weight = Tensor3::from_shape_fn((num_experts, output_dims, input_dims), |_| {
            rng.gen_range(-scale..scale)
        });
        let bias = bias.then(|| Tensor2::zeros((num_experts, output_dims)));
        Self { weight, bias }
    }

    /// Build from externally produced tensors (e.g. loaded weights).
    pub fn from_parts(weight: Tensor3, bias: Option<Tensor2>) -> Result<Self> {
        if let Some(b) = &bias {
            let (num_experts, output_dims, _) = weight.dim();
            if b.dim() != (num_experts, output_dims) {
                bail!(
                    "shape mismatch: bias is {:?}, expected [{}, {}]",
                    b.dim(),
                    num_experts,
                    output_dims
                );
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Tensor3 {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor2> {
        self.bias.as_ref()
    }

    /// Convert to the group-quantized representation. Dims and bias carry
    /// over; this unit is unaffected.
    pub fn to_quantized(&self, group_size: usize, bits: u32) -> Result<QuantizedSwitchLinear> {
        Ok(QuantizedSwitchLinear {
            weight: quantization::quantize(&self.weight, group_size, bits)?,
            bias: self.bias.clone(),
        })
    }
}

impl IndexedLinear for SwitchLinear {
    fn input_dims(&self) -> usize {
        self.weight.dim().2
    }

    fn output_dims(&self) -> usize {
        self.weight.dim().1
    }

    fn num_experts(&self) -> usize {
        self.weight.dim().0
    }

    fn apply(&self, x: &Tensor2, indices: &[usize], assume_sorted: bool) -> Result<Tensor2> {
        validate_apply(self, x, indices, assume_sorted)?;
        let mut y = kernels::gather_matmul(x, &self.weight, indices, assume_sorted);
        if let Some(bias) = &self.bias {
            add_expert_bias(&mut y, bias, indices);
        }
        Ok(y)
    }
}

/// Group-quantized indexed linear unit. Results are within quantization
/// error of the full-precision unit, not bit-exact.
pub struct QuantizedSwitchLinear {
    weight: QuantizedExpertWeight,
    /// Bias stays full precision: [num_experts, output_dims]
    bias: Option<Tensor2>,
}

impl QuantizedSwitchLinear {
    /// Fresh unit: uniform random init quantized in place.
    pub fn new(
        input_dims: usize,
        output_dims: usize,
        num_experts: usize,
        bias: bool,
        group_size: usize,
        bits: u32,
    ) -> Result<Self> {
        SwitchLinear::new(input_dims, output_dims, num_experts, bias).to_quantized(group_size, bits)
    }

    pub fn weight(&self) -> &QuantizedExpertWeight {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor2> {
        self.bias.as_ref()
    }

    pub fn group_size(&self) -> usize {
        self.weight.group_size()
    }

    pub fn bits(&self) -> u32 {
        self.weight.bits()
    }
}

impl IndexedLinear for QuantizedSwitchLinear {
    fn input_dims(&self) -> usize {
        self.weight.input_dims()
    }

    fn output_dims(&self) -> usize {
        self.weight.output_dims()
    }

    fn num_experts(&self) -> usize {
        self.weight.num_experts()
    }

    fn apply(&self, x: &Tensor2, indices: &[usize], assume_sorted: bool) -> Result<Tensor2> {
        validate_apply(self, x, indices, assume_sorted)?;
        let mut y = kernels::gather_quantized_matmul(x, &self.weight, indices, assume_sorted);
        if let Some(bias) = &self.bias {
            add_expert_bias(&mut y, bias, indices);
        }
        Ok(y)
    }
}
