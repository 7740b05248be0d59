//! Shared utilities for conduit.
//!
//! This crate provides common utilities used across the conduit workspace:
//! - Logging setup with tracing
//! - Platform directories for configuration, credentials and logs

pub mod log;
pub mod paths;

pub use log::{LogConfig, LogLevel};
