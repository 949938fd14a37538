//! Broker Facade
//!
//! The public entry points. A `Broker` owns one request queue (and through
//! it one drain loop), one rate limiter and one model cache, all constructed
//! from a [`BrokerConfig`]. Callers hand it a prompt and get back final text
//! or a final error; everything in between -- pacing, discovery, retries,
//! escalation -- is internal.
//!
//! Two brokers that must share one provider quota can be built over the same
//! [`RateLimiter`] and [`ModelResolver`] via [`Broker::with_shared`], which
//! keeps the "one shared quota" invariant explicit instead of smuggled
//! through process-wide state.

use std::sync::Arc;

use base64::{prelude::BASE64_STANDARD, Engine};
use tokio_util::sync::CancellationToken;

use crate::backend::{GeminiBackend, GenerateRequest, GenerativeBackend};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::queue::{PendingRequest, RequestQueue};
use crate::ratelimit::RateLimiter;
use crate::resolver::ModelResolver;
use crate::retry::RetryClassifier;

/// Per-request options
///
/// Unset fields fall back to the broker's configured defaults.
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    /// Sampling temperature override
    pub temperature: Option<f32>,
    /// Output-token budget at submission time
    pub max_tokens: Option<u32>,
    /// Total attempt cap override
    pub max_retries: Option<u32>,
    /// Cancellation signal; firing it fails this request with `Cancelled`
    pub cancel: Option<CancellationToken>,
}

impl GenerateOptions {
    /// Create options that use the broker defaults throughout
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output-token budget
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the total attempt cap
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// The broker: rate-safe, retrying access to a generative backend
pub struct Broker {
    config: BrokerConfig,
    backend: Arc<dyn GenerativeBackend>,
    resolver: Arc<ModelResolver>,
    queue: RequestQueue,
}

impl Broker {
    /// Create a broker over the production HTTP backend
    ///
    /// Must be called from within a tokio runtime (the drain task is spawned
    /// here). A missing credential does not fail construction; it fails each
    /// call, before anything is enqueued.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let backend = GeminiBackend::with_timeout(
            config.api_key.clone().unwrap_or_default(),
            config.request_timeout,
        )
        .with_base_url(config.base_url.clone());
        Self::with_backend(Arc::new(backend), config)
    }

    /// Create a broker over any backend (the test seam)
    #[must_use]
    pub fn with_backend(backend: Arc<dyn GenerativeBackend>, config: BrokerConfig) -> Self {
        let resolver = Arc::new(ModelResolver::new(
            Arc::clone(&backend),
            config.preferred_models.clone(),
            config.fallback_model.clone(),
        ));
        let limiter = RateLimiter::new(config.rate_limit);
        Self::with_shared(backend, limiter, resolver, config)
    }

    /// Create a broker sharing a rate limiter and model cache with others
    ///
    /// All brokers built over the same limiter draw on one admission history,
    /// so their combined provider load stays inside one quota.
    #[must_use]
    pub fn with_shared(
        backend: Arc<dyn GenerativeBackend>,
        limiter: RateLimiter,
        resolver: Arc<ModelResolver>,
        config: BrokerConfig,
    ) -> Self {
        let classifier = RetryClassifier::new(config.retry);
        let queue = RequestQueue::new(
            Arc::clone(&backend),
            Arc::clone(&resolver),
            limiter,
            classifier,
            config.queue_capacity,
        );
        Self {
            config,
            backend,
            resolver,
            queue,
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Get the model resolver (shared with the drain loop)
    #[must_use]
    pub fn resolver(&self) -> &Arc<ModelResolver> {
        &self.resolver
    }

    /// Check that the backend is reachable
    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    /// Generate text from a prompt
    ///
    /// Resolves with the trimmed response text, or rejects with a terminal
    /// [`BrokerError`]; all retrying already happened inside.
    pub async fn generate_text(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<String, BrokerError> {
        self.require_credential()?;
        let request = self.build_request(GenerateRequest::new(prompt), &options);
        self.dispatch(request, options).await
    }

    /// Analyze an image: inline binary plus an instruction prompt
    pub async fn analyze_image(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<String, BrokerError> {
        self.require_credential()?;
        let request = self
            .build_request(GenerateRequest::new(prompt), &options)
            .with_inline_data(mime_type, BASE64_STANDARD.encode(image));
        self.dispatch(request, options).await
    }

    /// Fail fast when no credential is configured
    fn require_credential(&self) -> Result<(), BrokerError> {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(BrokerError::Configuration(
                "GEMINI_API_KEY is not set".to_string(),
            )),
        }
    }

    /// Apply option overrides on top of configured defaults
    fn build_request(&self, request: GenerateRequest, options: &GenerateOptions) -> GenerateRequest {
        request
            .with_temperature(
                options
                    .temperature
                    .unwrap_or(self.config.default_temperature),
            )
            .with_max_output_tokens(
                options.max_tokens.unwrap_or(self.config.default_max_tokens),
            )
    }

    /// Submit and await the final result
    async fn dispatch(
        &self,
        request: GenerateRequest,
        options: GenerateOptions,
    ) -> Result<String, BrokerError> {
        let max_attempts = options.max_retries.unwrap_or(self.config.max_attempts).max(1);
        let (pending, rx) = PendingRequest::new(request, max_attempts, options.cancel);
        self.queue.submit(pending).await;

        match rx.await {
            Ok(result) => result,
            // The drain task dropped the handle without resolving it; only
            // reachable on runtime teardown.
            Err(_) => Err(BrokerError::Unavailable {
                attempts: 0,
                message: "completion handle dropped".to_string(),
            }),
        }
    }
}
