//! Model Resolution
//!
//! Discovers which model identifier to address and caches the answer for the
//! process lifetime. The preference list is ordered most-capable-first; the
//! first listed model matching a preferred name wins, name matching tolerates
//! punctuation differences, and every failure path lands on a usable
//! identifier -- worst case the hard-coded fallback.
//!
//! A failed listing is cached too: the fallback is good enough, and
//! re-listing on every generation would spend quota on discovery.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{GenerativeBackend, ModelInfo};

/// Resolves and caches the target model identifier
pub struct ModelResolver {
    /// Backend used for the listing call
    backend: Arc<dyn GenerativeBackend>,
    /// Ordered preference list, most capable first
    preferred: Vec<String>,
    /// Identifier used when listing fails or matches nothing
    fallback: String,
    /// The resolved identifier, set once per process lifetime
    cached: RwLock<Option<String>>,
}

impl ModelResolver {
    /// Create a resolver over the given backend
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        preferred: Vec<String>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            preferred,
            fallback: fallback.into(),
            cached: RwLock::new(None),
        }
    }

    /// Resolve the model identifier, consulting the cache first
    pub async fn resolve(&self) -> String {
        if let Some(model) = self.cached.read().clone() {
            return model;
        }

        let chosen = match self.backend.list_models().await {
            Ok(models) if !models.is_empty() => self.pick(&models),
            Ok(_) => {
                tracing::warn!(
                    fallback = %self.fallback,
                    "model listing returned nothing; using fallback"
                );
                self.fallback.clone()
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = %self.fallback,
                    "model listing failed; using fallback"
                );
                self.fallback.clone()
            }
        };

        tracing::debug!(model = %chosen, "model resolved");
        *self.cached.write() = Some(chosen.clone());
        chosen
    }

    /// Walk the preference list; no preferred match means the first listed
    /// model overall
    fn pick(&self, models: &[ModelInfo]) -> String {
        for preferred in &self.preferred {
            if let Some(found) = models.iter().find(|m| name_matches(&m.name, preferred)) {
                return found.name.clone();
            }
        }
        models[0].name.clone()
    }

    /// The cached identifier, if resolution already happened
    #[must_use]
    pub fn cached(&self) -> Option<String> {
        self.cached.read().clone()
    }

    /// Drop the cached identifier so the next call re-queries the listing
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

/// Compare a listed model name against a preferred name
///
/// Tolerates the `models/` prefix and punctuation differences:
/// `models/gemini-2.0-flash` matches `gemini 2.0 flash`.
fn name_matches(listed: &str, preferred: &str) -> bool {
    normalize(listed) == normalize(preferred)
}

/// Lowercase, strip the `models/` prefix, keep only alphanumerics
fn normalize(name: &str) -> String {
    name.trim_start_matches("models/")
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backend::{BackendError, GenerateRequest, GenerateResponse, ProviderFailure};

    /// Listing-only backend: scripted `list_models`, counts calls
    struct ListingBackend {
        result: Result<Vec<ModelInfo>, BackendError>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ListingBackend {
        fn listing(names: &[&str]) -> Self {
            Self {
                result: Ok(names
                    .iter()
                    .map(|n| ModelInfo {
                        name: (*n).to_string(),
                        display_name: None,
                    })
                    .collect()),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                result: Err(BackendError::Provider(ProviderFailure {
                    status: Some(500),
                    message: "listing broken".to_string(),
                    ..Default::default()
                })),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerativeBackend for ListingBackend {
        fn name(&self) -> &str {
            "listing-test"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.result.clone()
        }

        async fn generate(
            &self,
            _model: &str,
            _request: &GenerateRequest,
        ) -> Result<GenerateResponse, BackendError> {
            unreachable!("resolver never generates")
        }
    }

    fn resolver(backend: Arc<ListingBackend>) -> ModelResolver {
        ModelResolver::new(
            backend,
            vec![
                "gemini-2.5-flash".to_string(),
                "gemini-2.0-flash".to_string(),
            ],
            "gemini-2.0-flash",
        )
    }

    #[test]
    fn test_name_normalization() {
        assert!(name_matches("models/gemini-2.0-flash", "gemini 2.0 flash"));
        assert!(name_matches("gemini-2.5-flash", "Gemini_2.5_Flash"));
        assert!(!name_matches("models/gemini-2.0-pro", "gemini-2.0-flash"));
    }

    #[tokio::test]
    async fn test_preferred_model_wins() {
        let backend = Arc::new(ListingBackend::listing(&[
            "models/gemini-1.0-pro",
            "models/gemini-2.5-flash",
        ]));
        let resolver = resolver(backend);

        assert_eq!(resolver.resolve().await, "models/gemini-2.5-flash");
    }

    #[tokio::test]
    async fn test_preference_order_respected() {
        let backend = Arc::new(ListingBackend::listing(&[
            "models/gemini-2.0-flash",
            "models/gemini-2.5-flash",
        ]));
        let resolver = resolver(backend);

        // 2.5 is earlier in the preference list even though 2.0 is listed first.
        assert_eq!(resolver.resolve().await, "models/gemini-2.5-flash");
    }

    #[tokio::test]
    async fn test_no_preferred_match_takes_first_listed_and_caches() {
        let backend = Arc::new(ListingBackend::listing(&[
            "models/gemini-experimental",
            "models/gemini-other",
        ]));
        let resolver = resolver(Arc::clone(&backend));

        assert_eq!(resolver.resolve().await, "models/gemini-experimental");
        assert_eq!(resolver.resolve().await, "models/gemini-experimental");
        assert_eq!(backend.call_count(), 1, "second resolve must hit the cache");
    }

    #[tokio::test]
    async fn test_listing_failure_falls_back_once() {
        let backend = Arc::new(ListingBackend::failing());
        let resolver = resolver(Arc::clone(&backend));

        assert_eq!(resolver.resolve().await, "gemini-2.0-flash");
        assert_eq!(resolver.resolve().await, "gemini-2.0-flash");
        assert_eq!(
            backend.call_count(),
            1,
            "a failed listing is cached as the fallback, not retried per call"
        );
    }

    #[tokio::test]
    async fn test_empty_listing_falls_back() {
        let backend = Arc::new(ListingBackend::listing(&[]));
        let resolver = resolver(backend);

        assert_eq!(resolver.resolve().await, "gemini-2.0-flash");
    }

    #[tokio::test]
    async fn test_invalidate_requeries() {
        let backend = Arc::new(ListingBackend::listing(&["models/gemini-2.5-flash"]));
        let resolver = resolver(Arc::clone(&backend));

        resolver.resolve().await;
        resolver.invalidate();
        assert_eq!(resolver.cached(), None);
        resolver.resolve().await;
        assert_eq!(backend.call_count(), 2);
    }
}
