//! Stasis Core Library
//!
//! This crate provides the pieces shared by every Stasis crate:
//! the error taxonomy and the configuration model.

pub mod config;
pub mod error;

pub use error::{Error, Result};

/// Stasis version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
