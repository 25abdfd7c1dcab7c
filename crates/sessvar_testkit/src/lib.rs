//! # SessVar Testkit
//!
//! Test utilities for SessVar.
//!
//! This crate provides:
//! - Session fixtures and row helpers
//! - Property-based test generators using proptest
//! - A model-checked transaction harness and the end-to-end scenarios
//!
//! ## Usage
//!
//! ```rust
//! use sessvar_testkit::prelude::*;
//!
//! with_session(|session| {
//!     session.set("pkg", "x", sessvar_core::Value::Int(1), true).unwrap();
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
