//! Stagehand Core
//!
//! Pipeline model, rule engine, and error handling for Stagehand.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod context;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod rules;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
