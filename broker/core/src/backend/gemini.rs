//! Gemini Backend Implementation
//!
//! Backend for the generative-language REST API.
//!
//! # API surface
//!
//! - `GET /v1beta/models` - list available models
//! - `POST /v1beta/models/{model}:generateContent` - one-shot generation
//!
//! Authentication is a per-request `x-goog-api-key` header. Responses carry
//! zero or more candidates plus optional `usageMetadata`; failures arrive as
//! an HTTP error status with a JSON `error` body, or occasionally as an
//! `error` object inside a 200 body. Either way the raw status, code,
//! message, `details` and any `Retry-After` header are captured unchanged for
//! the retry classifier.

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{
    BackendError, Candidate, GenerateRequest, GenerateResponse, GenerationPart, GenerativeBackend,
    ModelInfo, ProviderFailure, UsageMetadata,
};

/// Default endpoint for the generative-language API
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini backend client
#[derive(Clone)]
pub struct GeminiBackend {
    /// Base URL (overridable for tests and proxies)
    base_url: String,
    /// API credential
    api_key: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl GeminiBackend {
    /// Create a new backend with the default endpoint and a 30 s timeout
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_timeout(api_key, Duration::from_secs(30))
    }

    /// Create a new backend with an explicit per-request timeout
    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// Override the base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create from the `GEMINI_API_KEY` environment variable
    ///
    /// Returns `None` when the variable is unset or empty; credential
    /// validation proper happens in the broker facade.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .map(Self::new)
    }

    /// Get the models listing URL
    fn models_url(&self) -> String {
        format!("{}/v1beta/models", self.base_url.trim_end_matches('/'))
    }

    /// Get the generation URL for a model
    fn generate_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            model.trim_start_matches("models/")
        )
    }

    /// Build the JSON payload for a generation request
    fn build_payload(request: &GenerateRequest) -> serde_json::Value {
        let parts: Vec<serde_json::Value> = request
            .parts
            .iter()
            .map(|part| match part {
                GenerationPart::Text(text) => serde_json::json!({ "text": text }),
                GenerationPart::InlineData { mime_type, data } => serde_json::json!({
                    "inlineData": { "mimeType": mime_type, "data": data }
                }),
            })
            .collect();

        serde_json::json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_output_tokens,
            },
        })
    }

    /// Turn an HTTP error response into a `ProviderFailure`
    async fn failure_from_response(response: reqwest::Response) -> ProviderFailure {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();

        let mut failure = ProviderFailure {
            status: Some(status),
            retry_after,
            message: body.clone(),
            ..Default::default()
        };

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            if let Some(error) = value.get("error") {
                failure = provider_failure_from_error(error, Some(status), retry_after);
            }
        }

        failure
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.models_url())
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        let response = self
            .http_client
            .get(self.models_url())
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Provider(
                Self::failure_from_response(response).await,
            ));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let models = data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        let name = m.get("name")?.as_str()?.to_string();
                        let display_name = m
                            .get("displayName")
                            .and_then(|d| d.as_str())
                            .map(String::from);
                        Some(ModelInfo { name, display_name })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, BackendError> {
        let url = self.generate_url(model);
        let payload = Self::build_payload(request);

        tracing::debug!(model = %model, "POST generateContent");

        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Provider(
                Self::failure_from_response(response).await,
            ));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        // Some provider failures arrive inside a 200 body
        if let Some(error) = data.get("error") {
            return Err(BackendError::Provider(provider_failure_from_error(
                error, None, None,
            )));
        }

        Ok(parse_generate_response(&data))
    }
}

/// Decode a provider `error` object, keeping its details verbatim
fn provider_failure_from_error(
    error: &serde_json::Value,
    status: Option<u16>,
    retry_after: Option<Duration>,
) -> ProviderFailure {
    ProviderFailure {
        status,
        code: error.get("code").and_then(serde_json::Value::as_i64),
        message: error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        details: error
            .get("details")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default(),
        retry_after,
    }
}

/// Decode candidates and usage out of a generation response body
fn parse_generate_response(data: &serde_json::Value) -> GenerateResponse {
    let candidates = data
        .get("candidates")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .map(|candidate| Candidate {
                    text: extract_candidate_text(candidate),
                    finish_reason: candidate
                        .get("finishReason")
                        .and_then(|r| r.as_str())
                        .map(String::from),
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = data.get("usageMetadata").map(|usage| UsageMetadata {
        prompt_tokens: read_count(usage, "promptTokenCount"),
        output_tokens: read_count(usage, "candidatesTokenCount"),
        reasoning_tokens: read_count(usage, "thoughtsTokenCount"),
    });

    GenerateResponse { candidates, usage }
}

/// Concatenate the text parts of one candidate
fn extract_candidate_text(candidate: &serde_json::Value) -> Option<String> {
    let parts = candidate.get("content")?.get("parts")?.as_array()?;

    let mut acc = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            acc.push_str(text);
        }
    }

    if acc.is_empty() {
        None
    } else {
        Some(acc)
    }
}

fn read_count(usage: &serde_json::Value, field: &str) -> Option<u32> {
    usage
        .get(field)
        .and_then(serde_json::Value::as_u64)
        .map(|c| c as u32)
}

/// Parse a `Retry-After` header value
///
/// Accepts a bare seconds count or an RFC 2822 HTTP-date.
fn parse_retry_after(header: &str) -> Option<Duration> {
    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(header) {
        let diff = date.signed_duration_since(chrono::Utc::now());
        if diff.num_seconds() > 0 {
            return Some(Duration::from_secs(diff.num_seconds() as u64));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let backend = GeminiBackend::new("k").with_base_url("http://localhost:9999/");
        assert_eq!(backend.models_url(), "http://localhost:9999/v1beta/models");
        assert_eq!(
            backend.generate_url("models/gemini-2.0-flash"),
            "http://localhost:9999/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn test_build_payload() {
        let request = GenerateRequest::new("Describe this")
            .with_temperature(0.4)
            .with_max_output_tokens(256)
            .with_inline_data("image/jpeg", "QUJD");

        let payload = GeminiBackend::build_payload(&request);
        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[0]["inlineData"]["data"], "QUJD");
        assert_eq!(parts[1]["text"], "Describe this");
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn test_parse_response_with_text() {
        let data = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] },
                "finishReason": "STOP",
            }],
            "usageMetadata": {
                "promptTokenCount": 12,
                "candidatesTokenCount": 4,
                "thoughtsTokenCount": 150,
            },
        });

        let response = parse_generate_response(&data);
        let candidate = response.primary().unwrap();
        assert_eq!(candidate.text.as_deref(), Some("Hello world"));
        assert!(!candidate.is_truncated());
        assert_eq!(response.usage.unwrap().reasoning_tokens, Some(150));
    }

    #[test]
    fn test_parse_response_truncated_without_text() {
        let data = serde_json::json!({
            "candidates": [{ "finishReason": "MAX_TOKENS" }],
        });

        let response = parse_generate_response(&data);
        let candidate = response.primary().unwrap();
        assert_eq!(candidate.text, None);
        assert!(candidate.is_truncated());
    }

    #[test]
    fn test_parse_response_empty() {
        let response = parse_generate_response(&serde_json::json!({}));
        assert!(response.candidates.is_empty());
        assert!(response.usage.is_none());
    }

    #[test]
    fn test_provider_failure_from_error_body() {
        let error = serde_json::json!({
            "code": 429,
            "message": "Resource has been exhausted",
            "details": [{
                "@type": "type.googleapis.com/google.rpc.RetryInfo",
                "retryDelay": "6.3s",
            }],
        });

        let failure = provider_failure_from_error(&error, Some(429), None);
        assert_eq!(failure.status, Some(429));
        assert_eq!(failure.code, Some(429));
        assert_eq!(failure.message, "Resource has been exhausted");
        assert_eq!(failure.details.len(), 1);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("60"), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let header = future.to_rfc2822();
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed >= Duration::from_secs(85) && parsed <= Duration::from_secs(95));
    }
}
