//! Expert MLP blocks built from indexed linear units.
//!
//! Both blocks share the same scaffolding: flatten the batch to token rows,
//! conditionally sort (token, slot) pairs by expert, run the unit stack on
//! the reordered rows, then scatter back to original order. Output shape is
//! [batch, tokens, slots_per_token, output_dims] with one independent result
//! per selected expert slot, repeats included.

use super::routing::{Dispatch, DEFAULT_SORT_THRESHOLD};
use super::switch_linear::{IndexedLinear, QuantizedSwitchLinear, SwitchLinear};
use crate::kernels;
use crate::tensor::{ExpertIndices, Tensor2, Tensor3, Tensor4};
use anyhow::{bail, Result};

/// Element-wise activation applied between projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Silu,
    /// Exact, erf-based GELU.
    Gelu,
    /// Tanh-approximate GELU.
    GeluApprox,
}

impl Activation {
    pub fn apply(&self, x: &Tensor2) -> Tensor2 {
        match self {
            Activation::Identity => x.clone(),
            Activation::Silu => kernels::silu(x),
            Activation::Gelu => kernels::gelu(x),
            Activation::GeluApprox => kernels::gelu_approx(x),
        }
    }
}

fn check_forward_shapes(
    x: &Tensor3,
    indices: &ExpertIndices,
    input_dims: usize,
) -> Result<()> {
    let (b, t, d) = x.dim();
    let (bi, ti, _) = indices.dim();
    if (b, t) != (bi, ti) {
        bail!(
            "shape mismatch: activations [{}, {}, ..] vs indices [{}, {}, ..]",
            b,
            t,
            bi,
            ti
        );
    }
    if d != input_dims {
        bail!(
            "shape mismatch: activations have {} features, block expects {}",
            d,
            input_dims
        );
    }
    Ok(())
}

/// Gated expert block: out = down(act(gate(x, i)) * up(x, i)), one result per
/// (token, slot) pair.
pub struct SwitchGlu<L = SwitchLinear> {
    gate_proj: L,
    up_proj: L,
    down_proj: L,
    activation: Activation,
    sort_threshold: usize,
}

impl SwitchGlu<SwitchLinear> {
    pub fn new(
        input_dims: usize,
        hidden_dims: usize,
        num_experts: usize,
        activation: Activation,
        bias: bool,
    ) -> Self {
        SwitchGlu {
            gate_proj: SwitchLinear::new(input_dims, hidden_dims, num_experts, bias),
            up_proj: SwitchLinear::new(input_dims, hidden_dims, num_experts, bias),
            down_proj: SwitchLinear::new(hidden_dims, input_dims, num_experts, bias),
            activation,
            sort_threshold: DEFAULT_SORT_THRESHOLD,
        }
    }

    /// Build from pre-constructed units (e.g. loaded weights). The three
    /// projections must agree on dims and expert count.
    pub fn from_units(
        gate_proj: SwitchLinear,
        up_proj: SwitchLinear,
        down_proj: SwitchLinear,
        activation: Activation,
    ) -> Result<Self> {
        if gate_proj.num_experts() != up_proj.num_experts()
            || gate_proj.num_experts() != down_proj.num_experts()
        {
            bail!("expert count mismatch across projections");
        }
        if gate_proj.input_dims() != up_proj.input_dims()
            || gate_proj.output_dims() != up_proj.output_dims()
            || down_proj.input_dims() != gate_proj.output_dims()
            || down_proj.output_dims() != gate_proj.input_dims()
        {
            bail!("projection dims do not compose: gate/up must map input -> hidden and down must map hidden -> input");
        }
        Ok(SwitchGlu {
            gate_proj,
            up_proj,
            down_proj,
            activation,
            sort_threshold: DEFAULT_SORT_THRESHOLD,
        })
    }

    /// Quantize all three projections, producing a new block.
    pub fn to_quantized(
        &self,
        group_size: usize,
        bits: u32,
    ) -> Result<SwitchGlu<QuantizedSwitchLinear>> {
        Ok(SwitchGlu {
            gate_proj: self.gate_proj.to_quantized(group_size, bits)?,
            up_proj: self.up_proj.to_quantized(group_size, bits)?,
            down_proj: self.down_proj.to_quantized(group_size, bits)?,
            activation: self.activation,
            sort_threshold: self.sort_threshold,
        })
    }
}

impl<L: IndexedLinear> SwitchGlu<L> {
    /// Override the pair-count cutoff for sorted dispatch.
    pub fn with_sort_threshold(mut self, sort_threshold: usize) -> Self {
        self.sort_threshold = sort_threshold;
        self
    }

    pub fn gate_proj(&self) -> &L {
        &self.gate_proj
    }

    pub fn up_proj(&self) -> &L {
        &self.up_proj
    }

    pub fn down_proj(&self) -> &L {
        &self.down_proj
    }

    /// x: (batch, tokens, input_dims); indices: (batch, tokens, slots)
    /// -> (batch, tokens, slots, input_dims)
    pub fn forward(&self, x: &Tensor3, indices: &ExpertIndices) -> Result<Tensor4> {
        check_forward_shapes(x, indices, self.gate_proj.input_dims())?;
        let (b, t, d) = x.dim();
        let k = indices.dim().2;

        let x_tokens = x.to_shape((b * t, d))?;
        let flat: Vec<usize> = indices.iter().copied().collect();
        let dispatch = Dispatch::prepare(x_tokens.view(), &flat, k, self.sort_threshold);
        let sorted = dispatch.is_sorted();

        let up = self.up_proj.apply(&dispatch.x_rows, &dispatch.indices, sorted)?;
        let gate = self.gate_proj.apply(&dispatch.x_rows, &dispatch.indices, sorted)?;
        let hidden = self.activation.apply(&gate) * &up;
        let y = self.down_proj.apply(&hidden, &dispatch.indices, sorted)?;

        let y = dispatch.finish(y);
        Ok(y.into_shape_with_order((b, t, k, self.down_proj.output_dims()))?)
    }
}

/// Plain two-layer expert block: out = fc2(act(fc1(x, i)), i).
pub struct SwitchMlp<L = SwitchLinear> {
    fc1: L,
    fc2: L,
    activation: Activation,
    sort_threshold: usize,
}

impl SwitchMlp<SwitchLinear> {
    pub fn new(
        input_dims: usize,
        hidden_dims: usize,
        num_experts: usize,
        activation: Activation,
        bias: bool,
    ) -> Self {
        SwitchMlp {
            fc1: SwitchLinear::new(input_dims, hidden_dims, num_experts, bias),
            fc2: SwitchLinear::new(hidden_dims, input_dims, num_experts, bias),
            activation,
            sort_threshold: DEFAULT_SORT_THRESHOLD,
        }
    }

    pub fn from_units(fc1: SwitchLinear, fc2: SwitchLinear, activation: Activation) -> Result<Self> {
        if fc1.num_experts() != fc2.num_experts() {
            bail!("expert count mismatch across projections");
        }
        if fc2.input_dims() != fc1.output_dims() || fc2.output_dims() != fc1.input_dims() {
            bail!("projection dims do not compose: fc1 must map input -> hidden and fc2 must map hidden -> input");
        }
        Ok(SwitchMlp {
            fc1,
            fc2,
            activation,
            sort_threshold: DEFAULT_SORT_THRESHOLD,
        })
    }

    pub fn to_quantized(
        &self,
        group_size: usize,
        bits: u32,
    ) -> Result<SwitchMlp<QuantizedSwitchLinear>> {
        Ok(SwitchMlp {
            fc1: self.fc1.to_quantized(group_size, bits)?,
            fc2: self.fc2.to_quantized(group_size, bits)?,
            activation: self.activation,
            sort_threshold: self.sort_threshold,
        })
    }
}

impl<L: IndexedLinear> SwitchMlp<L> {
    pub fn with_sort_threshold(mut self, sort_threshold: usize) -> Self {
        self.sort_threshold = sort_threshold;
        self
    }

    pub fn fc1(&self) -> &L {
        &self.fc1
    }

    pub fn fc2(&self) -> &L {
        &self.fc2
    }

    /// x: (batch, tokens, input_dims); indices: (batch, tokens, slots)
    /// -> (batch, tokens, slots, input_dims)
    pub fn forward(&self, x: &Tensor3, indices: &ExpertIndices) -> Result<Tensor4> {
        check_forward_shapes(x, indices, self.fc1.input_dims())?;
        let (b, t, d) = x.dim();
        let k = indices.dim().2;

        let x_tokens = x.to_shape((b * t, d))?;
        let flat: Vec<usize> = indices.iter().copied().collect();
        let dispatch = Dispatch::prepare(x_tokens.view(), &flat, k, self.sort_threshold);
        let sorted = dispatch.is_sorted();

        let hidden = self.fc1.apply(&dispatch.x_rows, &dispatch.indices, sorted)?;
        let hidden = self.activation.apply(&hidden);
        let y = self.fc2.apply(&hidden, &dispatch.indices, sorted)?;

        let y = dispatch.finish(y);
        Ok(y.into_shape_with_order((b, t, k, self.fc2.output_dims()))?)
    }
}
