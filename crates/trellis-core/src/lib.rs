//! Trellis Core
//!
//! Core domain types, traits, and error handling for Trellis.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod dag;
pub mod duration;
pub mod error;
pub mod ports;
pub mod signal;
pub mod step;

pub use error::{Error, Result};
