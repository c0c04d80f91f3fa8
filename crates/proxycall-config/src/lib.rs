//! Configuration for the proxycall service.
//!
//! TOML files with `${VAR}` environment substitution, a small set of
//! environment overrides, and validation of the cross-component rules
//! (most importantly that the order expiry age exceeds the pool
//! reservation TTL).

use thiserror::Error;

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::{
	ConfirmationSection, OrdersSection, PoolSection, ProxycallConfig, ServiceConfig, StoreSection,
	TelephonySection,
};

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}
