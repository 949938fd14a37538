//! Broker Error Taxonomy
//!
//! Every request that enters the broker leaves it with either generated text
//! or exactly one of these error kinds. All retrying happens inside the
//! broker; by the time an error reaches a caller it is final.
//!
//! # Design Philosophy
//!
//! Callers make different decisions for different kinds: `QuotaExhausted`
//! means "fall back to stale data until tomorrow", `RateLimited` means "maybe
//! later", `UpstreamRejected` means "fix the request, this is a bug". The
//! taxonomy exists so those decisions can be made with a `match` instead of
//! string inspection.

use thiserror::Error;

/// Terminal error surfaced to broker callers
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// No API credential configured; failed before anything was enqueued
    #[error("API key not configured: {0}")]
    Configuration(String),

    /// The provider's longer-horizon quota is exhausted; retrying before the
    /// provider-side reset cannot help
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Rate limited and still failing after the attempt cap
    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimited {
        /// Attempts made before giving up
        attempts: u32,
        /// Last provider message
        message: String,
    },

    /// The provider returned no usable content after all attempts, including
    /// after budget escalation
    #[error("provider returned no usable content: {0}")]
    EmptyResult(String),

    /// The provider response could not be decoded
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// The provider rejected the request outright (non-429 4xx); not retried
    #[error("request rejected by provider (HTTP {status}): {message}")]
    UpstreamRejected {
        /// HTTP status code
        status: u16,
        /// Provider error message
        message: String,
    },

    /// The provider or network stayed unreachable through the attempt cap
    #[error("provider unavailable after {attempts} attempts: {message}")]
    Unavailable {
        /// Attempts made before giving up
        attempts: u32,
        /// Last observed failure
        message: String,
    },

    /// The caller withdrew interest before the request completed
    #[error("request cancelled before completion")]
    Cancelled,
}

impl BrokerError {
    /// Whether the caller may reasonably retry later
    ///
    /// `QuotaExhausted`, `UpstreamRejected` and `Configuration` are not worth
    /// retrying soon; the rest are transient from the caller's perspective.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::EmptyResult(_)
                | Self::MalformedResponse(_)
                | Self::Unavailable { .. }
        )
    }
}
