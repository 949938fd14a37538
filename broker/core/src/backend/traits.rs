//! Generative Backend Traits
//!
//! Trait definitions for generative-text backends. This abstraction lets the
//! broker queue, rate-limit and retry without knowing which provider it is
//! talking to, and lets tests substitute a scripted backend for the real one.
//!
//! # Design Philosophy
//!
//! The trait sits at the wire boundary: implementations turn a
//! [`GenerateRequest`] into provider JSON and turn provider JSON back into a
//! [`GenerateResponse`] or a [`BackendError`]. Everything above the trait --
//! validation, classification, budgets, pacing -- is provider-agnostic.

use std::time::Duration;

use async_trait::async_trait;

/// One part of a prompt payload
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationPart {
    /// Plain text
    Text(String),
    /// Inline binary content, already base64-encoded
    InlineData {
        /// MIME type of the encoded bytes (e.g. `image/jpeg`)
        mime_type: String,
        /// Base64-encoded payload
        data: String,
    },
}

/// A single generation request as handed to a backend
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    /// Ordered prompt parts
    pub parts: Vec<GenerationPart>,
    /// Sampling temperature
    pub temperature: f32,
    /// Output-token ceiling for this attempt
    pub max_output_tokens: u32,
}

impl GenerateRequest {
    /// Create a text-only request
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            parts: vec![GenerationPart::Text(prompt.into())],
            temperature: 0.7,
            max_output_tokens: 1024,
        }
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set the output-token ceiling
    #[must_use]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Prepend an inline binary part (e.g. an image to analyze)
    #[must_use]
    pub fn with_inline_data(
        mut self,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        self.parts.insert(
            0,
            GenerationPart::InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        );
        self
    }
}

/// One completion candidate from the provider
#[derive(Clone, Debug, Default)]
pub struct Candidate {
    /// Concatenated text parts, if any
    pub text: Option<String>,
    /// The provider's terminal reason (e.g. `STOP`, `MAX_TOKENS`)
    pub finish_reason: Option<String>,
}

impl Candidate {
    /// Whether generation stopped because it hit the output-token ceiling
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("MAX_TOKENS")
    }
}

/// Token accounting reported by the provider
#[derive(Clone, Copy, Debug, Default)]
pub struct UsageMetadata {
    /// Tokens consumed by the prompt
    pub prompt_tokens: Option<u32>,
    /// Tokens in the visible output
    pub output_tokens: Option<u32>,
    /// Tokens spent on internal reasoning before visible output
    pub reasoning_tokens: Option<u32>,
}

/// A decoded generation response
#[derive(Clone, Debug, Default)]
pub struct GenerateResponse {
    /// Completion candidates (possibly empty)
    pub candidates: Vec<Candidate>,
    /// Token usage, when reported
    pub usage: Option<UsageMetadata>,
}

impl GenerateResponse {
    /// The first candidate, if any
    #[must_use]
    pub fn primary(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// Information about one listed model
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    /// Provider identifier (e.g. `models/gemini-2.0-flash`)
    pub name: String,
    /// Human-readable name, if the provider supplies one
    pub display_name: Option<String>,
}

/// A provider-reported failure, carried raw
///
/// The backend records what the provider said without interpreting it; all
/// meaning (quota vs. rate limit, suggested delays) is assigned by the retry
/// classifier in one place.
#[derive(Clone, Debug, Default)]
pub struct ProviderFailure {
    /// HTTP status, when the failure came with one
    pub status: Option<u16>,
    /// Provider error code from the body, when present
    pub code: Option<i64>,
    /// Provider error message
    pub message: String,
    /// Raw `error.details` entries from the body
    pub details: Vec<serde_json::Value>,
    /// Parsed `Retry-After` header, when present
    pub retry_after: Option<Duration>,
}

/// Failure of a single backend call
#[derive(Clone, Debug)]
pub enum BackendError {
    /// The provider answered with an error status or error object
    Provider(ProviderFailure),
    /// The request never completed (connect, TLS, timeout)
    Network(String),
    /// The response body could not be decoded
    Decode(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(failure) => match failure.status {
                Some(status) => write!(f, "provider error (HTTP {status}): {}", failure.message),
                None => write!(f, "provider error: {}", failure.message),
            },
            Self::Network(e) => write!(f, "network error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Generative backend trait
///
/// Implement this to point the broker at a different provider.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Backend name for logs (e.g. "Gemini")
    fn name(&self) -> &str;

    /// Check that the backend is reachable
    async fn health_check(&self) -> bool;

    /// List the models this backend can address
    async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError>;

    /// Execute one generation attempt against the given model
    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, BackendError>;
}
