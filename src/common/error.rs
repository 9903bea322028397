//! Error types for the bulk-data tester
//!
//! Messages end up verbatim in test reports, so they should tell the reader
//! which step of the export workflow was missing or what the server said.

use std::io;
use thiserror::Error;

use crate::testing::HookKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bulk-data tester
#[derive(Error, Debug)]
pub enum Error {
    // === Tree Errors ===
    #[error("No test or group found at path '{0}'")]
    PathNotFound(String),

    // === Runner Errors ===
    #[error("Hook '{hook}' of group '{group}' failed: {message}")]
    HookFailed {
        hook: HookKind,
        group: String,
        message: String,
    },

    #[error("Cannot {action} while runner is {state}")]
    InvalidState { action: String, state: String },

    #[error("{failed} of {total} tests failed")]
    RunFailed { failed: usize, total: usize },

    // === Test Errors ===
    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    #[error("Test panicked: {0}")]
    TestPanicked(String),

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Remote(String),

    #[error("Unable to authorize. {0}")]
    Authorization(String),

    #[error("No file was found at \"output[{0}]\" in the status response")]
    MissingOutputFile(usize),

    // === Transport Errors ===
    #[error("HTTP request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Signing error: {0}")]
    Signing(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a hook failure for the given group
    pub fn hook_failed(hook: HookKind, group: &str, message: &str) -> Self {
        Self::HookFailed {
            hook,
            group: group.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: &str) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a transport error for a request URL
    pub fn transport(url: &str, message: impl ToString) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an invalid URL error
    pub fn invalid_url(url: &str, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is a missing-prerequisite protocol error
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
