//! Generative backend abstraction
//!
//! The [`GenerativeBackend`] trait is the wire boundary between the broker
//! and a provider; [`GeminiBackend`] is the production implementation.

mod gemini;
mod traits;

pub use gemini::{GeminiBackend, DEFAULT_BASE_URL};
pub use traits::{
    BackendError, Candidate, GenerateRequest, GenerateResponse, GenerationPart, GenerativeBackend,
    ModelInfo, ProviderFailure, UsageMetadata,
};
