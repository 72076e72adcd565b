//! Utilities Module
//!
//! Provider metrics and monitoring helpers.

mod metrics;
mod reporter;

pub use metrics::*;
pub use reporter::*;
