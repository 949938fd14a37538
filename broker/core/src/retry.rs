//! Failure Classification and Budget Escalation
//!
//! Turns the raw failure of one attempt into a typed decision: retry now
//! with a bigger output budget, back off for a provider-directed delay,
//! retry after a short linear delay, or stop with a terminal error.
//!
//! # Design Philosophy
//!
//! The provider's error contract is partly free text: "quota exhausted" and
//! "rate limited for a minute" both arrive as HTTP 429, distinguished only by
//! message wording, and suggested retry delays show up as a structured
//! `RetryInfo` detail, a `Retry-After` header, or a phrase in the message.
//! All of that string matching is deliberately concentrated here, behind a
//! typed [`RetryDecision`], so a provider wording change means editing one
//! module.

use std::time::Duration;

use crate::backend::{BackendError, ProviderFailure};
use crate::error::BrokerError;

/// Raw failure of a single generation attempt
#[derive(Clone, Debug)]
pub enum AttemptError {
    /// The backend call itself failed
    Backend(BackendError),
    /// The provider answered but supplied zero candidates
    Empty,
    /// Generation hit the output-token ceiling before any visible text
    Truncated {
        /// Reasoning-token count from usage metadata, when reported
        reasoning_tokens: Option<u32>,
    },
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "{e}"),
            Self::Empty => write!(f, "response contained no usable content"),
            Self::Truncated { .. } => {
                write!(f, "output truncated before any visible text")
            }
        }
    }
}

/// What to do after a failed attempt
#[derive(Clone, Debug)]
pub enum RetryDecision {
    /// Stop now and surface this error
    Fail(BrokerError),
    /// Retry immediately with a larger output budget (the failure was caused
    /// by the budget, not by provider load, so no delay is warranted)
    RetryNow {
        /// Replacement output-token budget
        new_budget: u32,
    },
    /// Sleep the given delay, clear the rate limiter's history, then retry
    Backoff {
        /// Provider-derived (or default) delay, already floored
        delay: Duration,
    },
    /// Sleep a short linear delay, then retry
    RetryIn {
        /// Delay before the next attempt
        delay: Duration,
    },
}

/// Tunables for classification and escalation
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Minimum backoff honored for rate-limit responses; provider limiters
    /// tend to reset on minute boundaries, so shorter waits just burn attempts
    pub backoff_floor: Duration,
    /// Backoff used when the provider suggests nothing
    pub default_backoff: Duration,
    /// Pad added on top of a provider-suggested delay
    pub hint_pad: Duration,
    /// Headroom added above observed reasoning tokens when escalating
    pub escalation_headroom: u32,
    /// Hard ceiling for escalated output budgets
    pub budget_cap: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_secs(30),
            default_backoff: Duration::from_secs(60),
            hint_pad: Duration::from_secs(2),
            escalation_headroom: 500,
            budget_cap: 8192,
        }
    }
}

/// Classifier from raw attempt failures to retry decisions
#[derive(Clone, Debug, Default)]
pub struct RetryClassifier {
    policy: RetryPolicy,
}

impl RetryClassifier {
    /// Create a classifier with the given policy
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Get the policy
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify one failure
    ///
    /// `attempt` is 1-based and counts the attempt that just failed;
    /// `max_attempts` is the total cap; `current_budget` is the output-token
    /// ceiling the failed attempt ran with.
    #[must_use]
    pub fn classify(
        &self,
        error: &AttemptError,
        attempt: u32,
        max_attempts: u32,
        current_budget: u32,
    ) -> RetryDecision {
        let attempts_left = attempt < max_attempts;

        match error {
            AttemptError::Backend(BackendError::Provider(failure)) => {
                self.classify_provider(failure, attempt, attempts_left)
            }
            AttemptError::Truncated { reasoning_tokens } => {
                if attempts_left {
                    RetryDecision::RetryNow {
                        new_budget: self.escalated_budget(current_budget, *reasoning_tokens),
                    }
                } else {
                    RetryDecision::Fail(BrokerError::EmptyResult(error.to_string()))
                }
            }
            AttemptError::Empty => self.transient(attempt, attempts_left, || {
                BrokerError::EmptyResult(error.to_string())
            }),
            AttemptError::Backend(BackendError::Decode(message)) => {
                self.transient(attempt, attempts_left, || {
                    BrokerError::MalformedResponse(message.clone())
                })
            }
            AttemptError::Backend(BackendError::Network(message)) => {
                self.transient(attempt, attempts_left, || BrokerError::Unavailable {
                    attempts: attempt,
                    message: message.clone(),
                })
            }
        }
    }

    /// Classify a provider-reported failure
    fn classify_provider(
        &self,
        failure: &ProviderFailure,
        attempt: u32,
        attempts_left: bool,
    ) -> RetryDecision {
        let status = http_status(failure);

        if status == Some(429) {
            // Quota exhaustion terminates immediately: retrying cannot help
            // until a provider-side reset.
            if mentions_quota(&failure.message) {
                return RetryDecision::Fail(BrokerError::QuotaExhausted(failure.message.clone()));
            }
            if !attempts_left {
                return RetryDecision::Fail(BrokerError::RateLimited {
                    attempts: attempt,
                    message: failure.message.clone(),
                });
            }
            return RetryDecision::Backoff {
                delay: self.backoff_delay(failure),
            };
        }

        if let Some(status) = status {
            if (400..500).contains(&status) {
                return RetryDecision::Fail(BrokerError::UpstreamRejected {
                    status,
                    message: failure.message.clone(),
                });
            }
        }

        // 5xx and shapeless provider errors are transient.
        let message = failure.message.clone();
        self.transient(attempt, attempts_left, || BrokerError::Unavailable {
            attempts: attempt,
            message,
        })
    }

    /// Plain transient handling: linear delay while attempts remain,
    /// otherwise the caller-supplied terminal kind
    fn transient(
        &self,
        attempt: u32,
        attempts_left: bool,
        terminal: impl FnOnce() -> BrokerError,
    ) -> RetryDecision {
        if attempts_left {
            RetryDecision::RetryIn {
                delay: linear_delay(attempt),
            }
        } else {
            RetryDecision::Fail(terminal())
        }
    }

    /// Backoff delay for a rate-limit response
    ///
    /// A suggested delay (detail, header or message phrase) gets the pad on
    /// top; no suggestion falls back to the default. Either way the result is
    /// raised to the floor.
    fn backoff_delay(&self, failure: &ProviderFailure) -> Duration {
        let computed = suggested_delay(failure)
            .map_or(self.policy.default_backoff, |hint| hint + self.policy.hint_pad);
        computed.max(self.policy.backoff_floor)
    }

    /// Escalated output budget after a truncated attempt
    ///
    /// Targets observed reasoning consumption plus headroom when the provider
    /// reported it and that target actually grows the budget; otherwise
    /// doubles. Never shrinks, never exceeds the hard cap.
    #[must_use]
    pub fn escalated_budget(&self, current_budget: u32, reasoning_tokens: Option<u32>) -> u32 {
        let doubled = current_budget.saturating_mul(2);
        let target = match reasoning_tokens {
            Some(reasoning) => {
                let needed = reasoning.saturating_add(self.policy.escalation_headroom);
                if needed > current_budget {
                    needed
                } else {
                    doubled
                }
            }
            None => doubled,
        };
        target.min(self.policy.budget_cap)
    }
}

/// Effective HTTP status of a provider failure
///
/// Prefers the transport status; falls back to the body's error code, which
/// mirrors the HTTP status when the failure arrived inside a 200 body.
fn http_status(failure: &ProviderFailure) -> Option<u16> {
    failure.status.or_else(|| {
        failure
            .code
            .and_then(|code| u16::try_from(code).ok())
            .filter(|code| (100..600).contains(code))
    })
}

/// The quota-exhaustion signature
///
/// The provider distinguishes "out for the day" from "slow down" only by
/// message wording; the word "quota" is the signature the original contract
/// exposes. Deliberately nothing smarter than a case-insensitive substring
/// check -- inferring stronger semantics would be guessing.
fn mentions_quota(message: &str) -> bool {
    message.to_lowercase().contains("quota")
}

/// Provider-suggested retry delay, from the most structured source available
fn suggested_delay(failure: &ProviderFailure) -> Option<Duration> {
    if let Some(delay) = retry_info_delay(&failure.details) {
        return Some(delay);
    }
    if let Some(delay) = failure.retry_after {
        return Some(delay);
    }
    delay_phrase(&failure.message)
}

/// Extract the delay from a `RetryInfo` error detail
///
/// Handles both wire forms: `"retryDelay": "6.3s"` and
/// `"retryDelay": {"seconds": 6, "nanos": 300000000}`.
fn retry_info_delay(details: &[serde_json::Value]) -> Option<Duration> {
    let detail = details.iter().find(|d| {
        d.get("@type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t.ends_with("RetryInfo"))
    })?;
    let delay = detail.get("retryDelay")?;

    if let Some(text) = delay.as_str() {
        return parse_duration_text(text);
    }

    let seconds = delay.get("seconds").and_then(serde_json::Value::as_u64)?;
    let nanos = delay
        .get("nanos")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    Some(Duration::new(seconds, nanos as u32))
}

/// Parse a duration literal like `6.3s` or `45s`
fn parse_duration_text(text: &str) -> Option<Duration> {
    let trimmed = text.trim().trim_end_matches('s');
    let seconds: f64 = trimmed.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Find a "retry in Ns" phrase inside free message text
fn delay_phrase(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let rest = &lower[lower.find("retry in ")? + "retry in ".len()..];
    let numeric: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    parse_duration_text(&numeric)
}

/// Linearly increasing delay for plain transient retries, capped short
fn linear_delay(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt.min(5)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limit_failure(message: &str) -> AttemptError {
        AttemptError::Backend(BackendError::Provider(ProviderFailure {
            status: Some(429),
            message: message.to_string(),
            ..Default::default()
        }))
    }

    #[test]
    fn test_quota_terminates_on_first_attempt() {
        let classifier = RetryClassifier::default();
        let error = rate_limit_failure("Quota exceeded for quota metric 'requests per day'");

        let decision = classifier.classify(&error, 1, 3, 1024);
        assert!(matches!(
            decision,
            RetryDecision::Fail(BrokerError::QuotaExhausted(_))
        ));
    }

    #[test]
    fn test_quota_match_is_case_insensitive() {
        assert!(mentions_quota("QUOTA exhausted"));
        assert!(mentions_quota("daily quota reached"));
        assert!(!mentions_quota("too many requests"));
    }

    #[test]
    fn test_plain_rate_limit_backs_off_with_floor() {
        let classifier = RetryClassifier::default();
        let error = rate_limit_failure("Too many requests");

        match classifier.classify(&error, 1, 3, 1024) {
            RetryDecision::Backoff { delay } => {
                assert_eq!(delay, Duration::from_secs(60), "no hint -> default backoff");
            }
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[test]
    fn test_structured_hint_padded_then_floored() {
        // 6.3s hint + 2s pad = 8300ms computed, raised to the 30s floor.
        let classifier = RetryClassifier::default();
        let error = AttemptError::Backend(BackendError::Provider(ProviderFailure {
            status: Some(429),
            message: "Resource has been exhausted".to_string(),
            details: vec![serde_json::json!({
                "@type": "type.googleapis.com/google.rpc.RetryInfo",
                "retryDelay": "6.3s",
            })],
            ..Default::default()
        }));

        match classifier.classify(&error, 1, 3, 1024) {
            RetryDecision::Backoff { delay } => assert_eq!(delay, Duration::from_secs(30)),
            other => panic!("expected backoff, got {other:?}"),
        }

        // With the floor out of the way the computed value shows through.
        let low_floor = RetryClassifier::new(RetryPolicy {
            backoff_floor: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        match low_floor.classify(&error, 1, 3, 1024) {
            RetryDecision::Backoff { delay } => assert_eq!(delay, Duration::from_millis(8300)),
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_header_used_when_no_detail() {
        let classifier = RetryClassifier::new(RetryPolicy {
            backoff_floor: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        let error = AttemptError::Backend(BackendError::Provider(ProviderFailure {
            status: Some(429),
            message: "Too many requests".to_string(),
            retry_after: Some(Duration::from_secs(10)),
            ..Default::default()
        }));

        match classifier.classify(&error, 1, 3, 1024) {
            RetryDecision::Backoff { delay } => assert_eq!(delay, Duration::from_secs(12)),
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_phrase_in_message() {
        assert_eq!(
            delay_phrase("Please retry in 24s."),
            Some(Duration::from_secs(24))
        );
        assert_eq!(
            delay_phrase("Retry in 6.3 seconds"),
            Some(Duration::from_secs_f64(6.3))
        );
        assert_eq!(delay_phrase("no suggestion here"), None);
    }

    #[test]
    fn test_retry_info_proto_form() {
        let details = vec![serde_json::json!({
            "@type": "type.googleapis.com/google.rpc.RetryInfo",
            "retryDelay": { "seconds": 6, "nanos": 300_000_000u64 },
        })];
        assert_eq!(
            retry_info_delay(&details),
            Some(Duration::from_millis(6300))
        );
    }

    #[test]
    fn test_rate_limit_exhausted_attempts() {
        let classifier = RetryClassifier::default();
        let error = rate_limit_failure("Too many requests");

        let decision = classifier.classify(&error, 3, 3, 1024);
        assert!(matches!(
            decision,
            RetryDecision::Fail(BrokerError::RateLimited { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_client_error_fails_immediately() {
        let classifier = RetryClassifier::default();
        let error = AttemptError::Backend(BackendError::Provider(ProviderFailure {
            status: Some(400),
            message: "Invalid argument".to_string(),
            ..Default::default()
        }));

        let decision = classifier.classify(&error, 1, 3, 1024);
        assert!(matches!(
            decision,
            RetryDecision::Fail(BrokerError::UpstreamRejected { status: 400, .. })
        ));
    }

    #[test]
    fn test_status_falls_back_to_body_code() {
        // Error object inside a 200 body: no transport status, code mirrors it.
        let failure = ProviderFailure {
            status: None,
            code: Some(429),
            ..Default::default()
        };
        assert_eq!(http_status(&failure), Some(429));
    }

    #[test]
    fn test_escalation_formula() {
        let classifier = RetryClassifier::new(RetryPolicy {
            escalation_headroom: 500,
            budget_cap: 8000,
            ..RetryPolicy::default()
        });

        // Reported reasoning of 1200 plus 500 headroom grows past the current
        // budget of 1000, so the reasoning-derived target wins.
        assert_eq!(classifier.escalated_budget(1000, Some(1200)), 1700);

        // Reasoning too small to grow the budget falls back to doubling.
        assert_eq!(classifier.escalated_budget(1000, Some(100)), 2000);

        // Unreported reasoning doubles.
        assert_eq!(classifier.escalated_budget(1000, None), 2000);

        // Cap is a hard ceiling.
        assert_eq!(classifier.escalated_budget(6000, Some(9000)), 8000);
        assert_eq!(
            classifier.escalated_budget(8000, Some(20000)),
            8000,
            "repeated escalations never exceed the cap"
        );
    }

    #[test]
    fn test_truncation_escalates_without_delay() {
        let classifier = RetryClassifier::default();
        let error = AttemptError::Truncated {
            reasoning_tokens: Some(1200),
        };

        match classifier.classify(&error, 1, 3, 1024) {
            RetryDecision::RetryNow { new_budget } => assert!(new_budget > 1024),
            other => panic!("expected immediate escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_truncation_exhausted_is_empty_result() {
        let classifier = RetryClassifier::default();
        let error = AttemptError::Truncated {
            reasoning_tokens: None,
        };

        let decision = classifier.classify(&error, 3, 3, 4096);
        assert!(matches!(
            decision,
            RetryDecision::Fail(BrokerError::EmptyResult(_))
        ));
    }

    #[test]
    fn test_empty_response_final_attempt() {
        let classifier = RetryClassifier::default();
        let decision = classifier.classify(&AttemptError::Empty, 3, 3, 1024);
        assert!(matches!(
            decision,
            RetryDecision::Fail(BrokerError::EmptyResult(_))
        ));
    }

    #[test]
    fn test_transient_delays_grow_linearly_and_cap() {
        assert_eq!(linear_delay(1), Duration::from_secs(1));
        assert_eq!(linear_delay(4), Duration::from_secs(4));
        assert_eq!(linear_delay(9), Duration::from_secs(5));
    }

    #[test]
    fn test_server_error_retries_then_unavailable() {
        let classifier = RetryClassifier::default();
        let error = AttemptError::Backend(BackendError::Provider(ProviderFailure {
            status: Some(503),
            message: "overloaded".to_string(),
            ..Default::default()
        }));

        assert!(matches!(
            classifier.classify(&error, 1, 3, 1024),
            RetryDecision::RetryIn { .. }
        ));
        assert!(matches!(
            classifier.classify(&error, 3, 3, 1024),
            RetryDecision::Fail(BrokerError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_network_error_exhausted_is_unavailable() {
        let classifier = RetryClassifier::default();
        let error = AttemptError::Backend(BackendError::Network("connect timeout".to_string()));

        assert!(matches!(
            classifier.classify(&error, 2, 2, 1024),
            RetryDecision::Fail(BrokerError::Unavailable { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_decode_error_exhausted_is_malformed() {
        let classifier = RetryClassifier::default();
        let error = AttemptError::Backend(BackendError::Decode("bad json".to_string()));

        assert!(matches!(
            classifier.classify(&error, 3, 3, 1024),
            RetryDecision::Fail(BrokerError::MalformedResponse(_))
        ));
    }
}
