pub mod ahi;
pub mod stats;

pub use ahi::*;
pub use stats::*;
