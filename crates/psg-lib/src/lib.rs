pub mod access;
pub mod analysis;
pub mod config;
pub mod detectors;
pub mod error;
pub mod io;
pub mod metrics;
pub mod signal;
pub mod synth;

pub use access::*;
pub use analysis::{run_ahi_analysis, AhiAnalysis, AhiAnalyzer, CancelToken};
pub use config::*;
pub use detectors::*;
pub use error::*;
pub use metrics::*;
pub use signal::*;
