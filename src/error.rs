//! Custom error types for the application.
//!
//! This module defines the primary error type, `CalError`, used by every driver,
//! the workbook adapter and the test sequencer. Using the `thiserror` crate, it
//! provides a centralized way to report failures ranging from configuration
//! problems to instruments that stop answering.
//!
//! ## Error Hierarchy
//!
//! - **`Config` / `Configuration`**: figment load failures and semantic validation
//!   errors in the configuration file.
//! - **`Io`** / **`Csv`**: file access for workbooks and their backups.
//! - **`Transport`**: a single VISA read or write failed. These are retryable.
//! - **`Timeout`**: the retry policy gave up on an operation.
//! - **`InvalidResponse`** / **`InvalidArgument`**: an instrument said something we
//!   could not parse, or a driver was asked for something the hardware cannot do.
//! - **`Workbook`** / **`MissingNamedRange`**: the results workbook is not laid out
//!   the way a test plan must be.
//! - **`UnsupportedInstrument`**: no driver exists for the connected UUT.
//! - **`Aborted`**: the operator cancelled a prompt.
//! - **`FeatureNotEnabled`**: functionality compiled out via cargo features.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CalError>;

#[derive(Error, Debug)]
pub enum CalError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Transport error on {resource}: {message}")]
    Transport { resource: String, message: String },

    #[error("Timed out after {attempts} attempts: {operation}")]
    Timeout { operation: String, attempts: u32 },

    #[error("Invalid response to '{command}': '{response}'")]
    InvalidResponse { command: String, response: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Workbook error: {0}")]
    Workbook(String),

    #[error("Named range '{0}' not found in workbook")]
    MissingNamedRange(String),

    #[error("Unsupported instrument: {0}")]
    UnsupportedInstrument(String),

    #[error("Instrument not connected: {0}")]
    NotConnected(String),

    #[error("Aborted by operator")]
    Aborted,

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl CalError {
    /// Shorthand for a transport failure on `resource`.
    pub fn transport(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}
