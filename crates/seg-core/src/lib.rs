//! Core types and utilities for the segmentation experiment.
//!
//! This crate provides the error type, the immutable experiment
//! configuration, sample/batch containers and streaming metrics used
//! across the workspace.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
