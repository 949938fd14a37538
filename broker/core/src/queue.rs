//! Request Queue and Drain Loop
//!
//! Serializes any number of concurrent callers into one in-order stream of
//! provider executions. The queue is a bounded channel with a single consumer
//! task; FIFO start order and at-most-one-in-flight fall out of that shape,
//! with no lock around the backlog itself. Queueing latency is proportional
//! to backlog depth times per-request duration -- that is the point: provider
//! load is bounded to exactly one concurrent call.
//!
//! The consumer also runs each request's attempt loop: rate-limiter
//! admission, model resolution, execution, classification, budget
//! escalation, backoff. By the time a completion handle resolves, the result
//! is final.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{GenerateRequest, GenerativeBackend};
use crate::error::BrokerError;
use crate::ratelimit::RateLimiter;
use crate::resolver::ModelResolver;
use crate::retry::{AttemptError, RetryClassifier, RetryDecision};

/// Request identifier, used for log correlation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new unique request ID
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self(format!("req_{timestamp}_{count}"))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An admitted, not-yet-executed unit of work
///
/// Owned exclusively by the queue from admission until its completion handle
/// resolves.
pub struct PendingRequest {
    /// Identifier for log correlation
    pub id: RequestId,
    /// Prompt parts plus generation parameters for the first attempt
    pub request: GenerateRequest,
    /// Total attempt cap for this request
    pub max_attempts: u32,
    /// Optional cancellation signal; firing it fails this request with
    /// `Cancelled` without affecting other queued items
    pub cancel: Option<CancellationToken>,
    /// Completion handle
    done: oneshot::Sender<Result<String, BrokerError>>,
}

impl PendingRequest {
    /// Create a pending request and its completion receiver
    pub fn new(
        request: GenerateRequest,
        max_attempts: u32,
        cancel: Option<CancellationToken>,
    ) -> (Self, oneshot::Receiver<Result<String, BrokerError>>) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                id: RequestId::generate(),
                request,
                max_attempts,
                cancel,
                done,
            },
            rx,
        )
    }

    /// Resolve the completion handle
    fn finish(self, result: Result<String, BrokerError>) {
        // The caller may have dropped its receiver; nothing to do then.
        let _ = self.done.send(result);
    }
}

/// FIFO queue with a single drain task
///
/// Cloning the queue clones the sender side only; all clones feed the same
/// drain task.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<PendingRequest>,
}

impl RequestQueue {
    /// Create the queue and spawn its drain task
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        resolver: Arc<ModelResolver>,
        limiter: RateLimiter,
        classifier: RetryClassifier,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let drain = DrainLoop {
            backend,
            resolver,
            limiter,
            classifier,
        };
        tokio::spawn(drain.run(rx));
        Self { tx }
    }

    /// Enqueue a request
    ///
    /// Requests are started in strict submission order. When the backlog is
    /// full this waits for space, which is backpressure working as intended.
    pub async fn submit(&self, request: PendingRequest) {
        let id = request.id.clone();
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request).await {
            // Only reachable if the drain task died; never silently swallow.
            tracing::error!(request_id = %id, "request queue is gone");
            request.finish(Err(BrokerError::Unavailable {
                attempts: 0,
                message: "request queue stopped".to_string(),
            }));
        }
    }
}

/// The single consumer: owns the rate limiter history and the attempt loop
struct DrainLoop {
    backend: Arc<dyn GenerativeBackend>,
    resolver: Arc<ModelResolver>,
    limiter: RateLimiter,
    classifier: RetryClassifier,
}

impl DrainLoop {
    /// Consume until every sender is gone
    async fn run(self, mut rx: mpsc::Receiver<PendingRequest>) {
        while let Some(pending) = rx.recv().await {
            self.process(pending).await;
        }
        tracing::debug!("request queue drained and closed");
    }

    /// Take one request from admission to completion
    async fn process(&self, pending: PendingRequest) {
        let id = pending.id.clone();
        let cancel = pending.cancel.clone();

        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            tracing::debug!(request_id = %id, "cancelled while queued");
            pending.finish(Err(BrokerError::Cancelled));
            return;
        }

        // Admission first: the request is not allowed to touch the provider
        // until both pacing checks pass. A cancellation during the wait
        // abandons the admission without recording it.
        if let Some(token) = &cancel {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!(request_id = %id, "cancelled during admission wait");
                    pending.finish(Err(BrokerError::Cancelled));
                    return;
                }
                () = self.limiter.acquire() => {}
            }
        } else {
            self.limiter.acquire().await;
        }

        let model = self.resolver.resolve().await;

        let PendingRequest {
            request,
            max_attempts,
            done,
            ..
        } = pending;

        let result = if let Some(token) = &cancel {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!(request_id = %id, "cancelled mid-execution");
                    Err(BrokerError::Cancelled)
                }
                result = self.execute(&id, &model, request, max_attempts) => result,
            }
        } else {
            self.execute(&id, &model, request, max_attempts).await
        };

        let _ = done.send(result);
    }

    /// The attempt loop: execute, classify, escalate or delay, repeat
    async fn execute(
        &self,
        id: &RequestId,
        model: &str,
        mut request: GenerateRequest,
        max_attempts: u32,
    ) -> Result<String, BrokerError> {
        let mut attempt = 1u32;

        loop {
            tracing::debug!(
                request_id = %id,
                attempt,
                budget = request.max_output_tokens,
                model = %model,
                "executing attempt"
            );

            let failure = match self.attempt(model, &request).await {
                Ok(text) => return Ok(text),
                Err(failure) => failure,
            };

            let decision =
                self.classifier
                    .classify(&failure, attempt, max_attempts, request.max_output_tokens);

            match decision {
                RetryDecision::Fail(error) => {
                    tracing::warn!(
                        request_id = %id,
                        attempt,
                        error = %error,
                        "request failed terminally"
                    );
                    return Err(error);
                }
                RetryDecision::RetryNow { new_budget } => {
                    tracing::debug!(
                        request_id = %id,
                        attempt,
                        old_budget = request.max_output_tokens,
                        new_budget,
                        "output truncated; escalating budget and retrying"
                    );
                    request.max_output_tokens = new_budget;
                }
                RetryDecision::Backoff { delay } => {
                    tracing::warn!(
                        request_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited by provider; backing off"
                    );
                    // The backoff itself pays the pacing debt down; stale
                    // window history would double-charge it.
                    self.limiter.reset().await;
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::RetryIn { delay } => {
                    tracing::debug!(
                        request_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            attempt += 1;
        }
    }

    /// One attempt: call the backend and validate what came back
    async fn attempt(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<String, AttemptError> {
        let response = self
            .backend
            .generate(model, request)
            .await
            .map_err(AttemptError::Backend)?;

        let Some(candidate) = response.primary() else {
            return Err(AttemptError::Empty);
        };

        let text = candidate.text.as_deref().map(str::trim).unwrap_or("");
        if text.is_empty() {
            if candidate.is_truncated() {
                return Err(AttemptError::Truncated {
                    reasoning_tokens: response.usage.and_then(|usage| usage.reasoning_tokens),
                });
            }
            return Err(AttemptError::Empty);
        }

        Ok(text.to_string())
    }
}
