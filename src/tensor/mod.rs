use ndarray::{Array, Ix1, Ix2, Ix3, Ix4};

pub type Tensor1 = Array<f32, Ix1>;
pub type Tensor2 = Array<f32, Ix2>;
pub type Tensor3 = Array<f32, Ix3>;
pub type Tensor4 = Array<f32, Ix4>;

/// Per-token expert selections: [batch, tokens, experts_per_token].
/// Values must lie in [0, num_experts).
pub type ExpertIndices = Array<usize, Ix3>;
