//! pgview Common Types and Utilities
//!
//! Shared records, configuration, and error handling for the view
//! compilation platform.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::PlatformConfig;
pub use error::{Error, Result};
