//! Common types for the crossent softmax cross-entropy operators
//!
//! This crate provides the foundational pieces shared by the kernel and
//! operator crates: error handling, configuration and the tensor layout
//! math for the dense and spatial modes.

pub mod config;
pub mod error;
pub mod shape;

pub use config::*;
pub use error::*;
pub use shape::*;
