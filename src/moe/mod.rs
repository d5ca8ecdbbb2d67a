mod blocks;
pub mod routing;
mod switch_linear;


pub use blocks::{Activation, SwitchGlu, SwitchMlp};
pub use routing::{Dispatch, DEFAULT_SORT_THRESHOLD};
pub use switch_linear::{IndexedLinear, QuantizedSwitchLinear, SwitchLinear};
