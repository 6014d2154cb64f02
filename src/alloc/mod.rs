pub mod contract;
pub mod default;
pub mod diagnostic;
pub mod pointer_set;
pub mod stdlib;
