//! Configuration Module
//!
//! Orchestration settings and the settings collaborator.

mod settings;
mod store;

pub use settings::*;
pub use store::*;
