//! Error types for prom-relay
//!
//! Per-module error enums live next to their modules; this module provides
//! the top-level aggregate used at the initialization seam. Everything here
//! is fatal at startup — the only error recovered at runtime is a per-record
//! [`SerializeError`](crate::serializer::SerializeError), which the routers
//! log and count without aborting the batch.

use thiserror::Error;

/// Application error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Rule build error
    #[error("Rule error: {0}")]
    Rule(#[from] crate::transformer::RuleError),

    /// Avro schema load error
    #[error("Schema error: {0}")]
    Schema(#[from] crate::serializer::SchemaError),

    /// Topic template compile error
    #[error("Template error: {0}")]
    Template(#[from] handlebars::TemplateError),
}

/// Result type alias for application errors
pub type RelayResult<T> = Result<T, RelayError>;
