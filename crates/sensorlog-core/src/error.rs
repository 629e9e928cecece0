//! Error type shared by the sensorlog core.
//!
//! Per-record outcomes (a rejected value, a vetoed transform, an empty
//! synchronized frame) are reported as values, not errors. [`Error`] is for
//! failures the caller has to look at: the store cannot be opened, a config
//! file does not parse, a calculation function blew up.

use thiserror::Error;

/// Errors from sensorlog operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// The reading store cannot be opened or read back. Fatal for the process.
    #[error("reading store unavailable at {path}: {reason}")]
    StorageUnavailable { path: String, reason: String },

    #[error("invalid series key '{0}'")]
    InvalidKey(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' failed: {reason}")]
    Function { name: String, reason: String },

    #[error("expression error: {0}")]
    Expression(String),

    #[error("invalid parameters: {0}")]
    Params(String),
}

impl Error {
    /// Shorthand for a [`Error::Function`] failure.
    pub fn function(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Function {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
