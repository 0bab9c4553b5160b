//! dmp Common - Shared configuration and error types
//!
//! This crate provides the configuration model and the common error type
//! used by the dmp target library and the gateway binary.

pub mod config;
pub mod error;

pub use config::{Config, DispatchConfig, LoggingConfig, NbdConfig, StatConfig, VolumeConfig};
pub use error::{Error, Result};
