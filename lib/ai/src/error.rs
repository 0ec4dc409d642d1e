//! Error types for the AI crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `CompletionError`: Completion service requests, responses and streams

use std::fmt;

/// Errors from completion service operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The service could not be reached.
    ProviderUnavailable { endpoint: String, reason: String },
    /// The service answered with a non-success status.
    RequestFailed { status: u16, body: String },
    /// Response parsing failed.
    ResponseParseFailed { reason: String },
    /// The chunk stream broke off or reported an error.
    StreamFailed { reason: String },
    /// Timeout waiting for response.
    Timeout,
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Invalid configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderUnavailable { endpoint, reason } => {
                write!(f, "completion endpoint '{endpoint}' unavailable: {reason}")
            }
            Self::RequestFailed { status, body } => {
                write!(f, "completion request failed with HTTP {status}: {body}")
            }
            Self::ResponseParseFailed { reason } => {
                write!(f, "failed to parse completion response: {reason}")
            }
            Self::StreamFailed { reason } => write!(f, "completion stream failed: {reason}"),
            Self::Timeout => write!(f, "completion request timed out"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid completion configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for CompletionError {}
