//! Embedding providers
//!
//! ```text
//! EmbeddingProvider (trait)
//! ├── HashEmbedder      (built in, deterministic, no network)
//! ├── HttpEmbedder      (OpenAI-compatible /embeddings endpoint)
//! └── RetryingEmbedder  (wraps any provider with bounded retries)
//! ```
//!
//! The rest of the crate only sees the trait. Providers are picked at
//! startup by the capability registry.

mod hash;
mod http;

pub use hash::HashEmbedder;
pub(crate) use hash::tokenize;
pub use http::HttpEmbedder;

use crate::error::{Error, Result};
use crate::sync::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Maps text to a fixed-length vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector this provider returns
    fn dimension(&self) -> usize;

    /// Short name for logs and stats
    fn name(&self) -> &str;
}

/// Provider wrapper that retries transient failures and checks dimensions.
///
/// Once retries are exhausted the caller gets `Error::EmbeddingUnavailable`,
/// whatever the underlying failure was.
pub struct RetryingEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl EmbeddingProvider for RetryingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cancel = CancellationToken::new();
        let vector = self
            .policy
            .run("embed", &cancel, || self.inner.embed(text))
            .await
            .map_err(|e| match e {
                Error::EmbeddingUnavailable(_) | Error::Validation(_) => e,
                other if other.is_transient() => Error::EmbeddingUnavailable(format!(
                    "{} failed after {} attempts: {}",
                    self.inner.name(),
                    self.policy.max_attempts,
                    other
                )),
                other => other,
            })?;
        if vector.len() != self.inner.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.inner.dimension(),
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Hash embedder that can be switched off or made to fail N times
    pub struct FlakyEmbedder {
        inner: HashEmbedder,
        down: AtomicBool,
        fail_next: AtomicU32,
        pub calls: AtomicU32,
    }

    impl FlakyEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self {
                inner: HashEmbedder::new(dimension),
                down: AtomicBool::new(false),
                fail_next: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            }
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        pub fn fail_next(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::EmbeddingUnavailable("provider down".into()));
            }
            let pending = self.fail_next.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_next.store(pending - 1, Ordering::SeqCst);
                return Err(Error::EmbeddingUnavailable("injected".into()));
            }
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FlakyEmbedder;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_retrying_embedder_recovers() {
        let flaky = Arc::new(FlakyEmbedder::new(16));
        flaky.fail_next(2);
        let embedder = RetryingEmbedder::new(flaky.clone(), RetryPolicy::immediate(3));
        let v = embedder.embed("hello").await.unwrap();
        assert_eq!(v.len(), 16);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrying_embedder_surfaces_unavailable() {
        let flaky = Arc::new(FlakyEmbedder::new(16));
        flaky.set_down(true);
        let embedder = RetryingEmbedder::new(flaky.clone(), RetryPolicy::immediate(3));
        assert!(matches!(
            embedder.embed("hello").await,
            Err(Error::EmbeddingUnavailable(_))
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    struct WrongLength;

    #[async_trait]
    impl EmbeddingProvider for WrongLength {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0; 3])
        }
        fn dimension(&self) -> usize {
            4
        }
        fn name(&self) -> &str {
            "wrong"
        }
    }

    #[tokio::test]
    async fn test_retrying_embedder_checks_dimension() {
        let embedder = RetryingEmbedder::new(Arc::new(WrongLength), RetryPolicy::immediate(1));
        assert!(matches!(
            embedder.embed("x").await,
            Err(Error::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }
}
