pub mod respiratory;

pub use respiratory::*;
