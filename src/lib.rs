pub mod kernels;
pub mod moe;
pub mod quantization;
pub mod tensor;

pub use moe::{
    Activation, IndexedLinear, QuantizedSwitchLinear, SwitchGlu, SwitchLinear, SwitchMlp,
    DEFAULT_SORT_THRESHOLD,
};
pub use quantization::{quantize, QuantizedExpertWeight};
pub use tensor::{ExpertIndices, Tensor1, Tensor2, Tensor3, Tensor4};
