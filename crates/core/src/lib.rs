//! Motion-adaptive frame upsampling for timestamped image sequences.

pub mod assembler;
pub mod config;
pub mod estimators;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod sequence;
pub mod types;
pub mod upsampler;
pub mod warp;
pub mod writer;
