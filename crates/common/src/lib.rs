//! Switchyard common library
//!
//! This crate contains shared code used across Switchyard components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::SwitchyardConfig;
pub use error::{Result, SwitchyardError};
pub use metrics::{MetricsRegistry, METRICS};
