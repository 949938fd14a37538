//! Broker Core - Rate-Safe Access to a Generative-Text Endpoint
//!
//! This crate sits between application code and a rate-limited,
//! quota-constrained remote generation API. It accepts text and image
//! requests from any number of concurrent callers, executes them one at a
//! time without violating the provider's per-minute quota, retries transient
//! failures, and distinguishes "try again later" from "stop trying until
//! tomorrow."
//!
//! # Architecture
//!
//! ```text
//! callers ──┬── generate_text ──┐
//!           └── analyze_image ──┤
//!                               ▼
//!                      ┌─────────────────┐
//!                      │     Broker      │  credential check, defaults
//!                      └────────┬────────┘
//!                               ▼
//!                      ┌─────────────────┐
//!                      │  RequestQueue   │  FIFO, single drain task
//!                      └────────┬────────┘
//!                               ▼
//!          RateLimiter ──▶ ModelResolver ──▶ attempt loop
//!        (window+spacing)    (cached id)   (RetryClassifier:
//!                               │           escalate/backoff/fail)
//!                               ▼
//!                      ┌─────────────────┐
//!                      │ GenerativeBackend│  HTTP (Gemini) or a test mock
//!                      └─────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Broker`]: the facade; one instance per quota (or share a limiter)
//! - [`GenerateOptions`]: per-request temperature / budget / attempts / cancel
//! - [`BrokerError`]: the final error taxonomy surfaced to callers
//! - [`GenerativeBackend`]: the provider seam; [`GeminiBackend`] in production
//!
//! # Quick Start
//!
//! ```ignore
//! use broker_core::{load_config, Broker, GenerateOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Broker::new(load_config()?);
//!
//!     let text = broker
//!         .generate_text("Name three dog breeds.", GenerateOptions::new())
//!         .await?;
//!     println!("{text}");
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees
//!
//! - Requests start in strict submission order; at most one provider call is
//!   in flight at any time.
//! - No sliding window ever holds more admissions than configured, and
//!   consecutive admissions respect the spacing floor.
//! - Every request resolves with final text or exactly one [`BrokerError`]
//!   kind; failures are never silently swallowed.
//!
//! # Module Overview
//!
//! - [`backend`]: provider abstraction and the Gemini HTTP implementation
//! - [`broker`]: the public facade
//! - [`config`]: defaults, TOML file and environment layering
//! - [`error`]: caller-facing error taxonomy
//! - [`queue`]: FIFO queue, drain loop and per-request attempt loop
//! - [`ratelimit`]: sliding-window + minimum-spacing admission control
//! - [`resolver`]: model discovery and caching
//! - [`retry`]: failure classification and budget escalation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod queue;
pub mod ratelimit;
pub mod resolver;
pub mod retry;

// Re-exports for convenience
pub use backend::{
    BackendError, Candidate, GeminiBackend, GenerateRequest, GenerateResponse, GenerationPart,
    GenerativeBackend, ModelInfo, ProviderFailure, UsageMetadata,
};
pub use broker::{Broker, GenerateOptions};
pub use config::{default_config_path, load_config, load_config_from_path, BrokerConfig, ConfigError};
pub use error::BrokerError;
pub use queue::{PendingRequest, RequestId, RequestQueue};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use resolver::ModelResolver;
pub use retry::{AttemptError, RetryClassifier, RetryDecision, RetryPolicy};
