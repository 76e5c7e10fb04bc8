//! Backoff and retry at the store boundary.

use crate::error::{PipelineError, StoreError};
use crate::store::{ChunkStore, StoreResult};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least one.
    pub max_attempts: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_ms: 200,
            max_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_ms),
            Duration::from_millis(self.max_ms),
            self.multiplier,
        )
    }
}

/// Delay before each retry: `initial * multiplier^n`, capped at `max`,
/// scaled by a random factor in `[0.75, 1.25]`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Jittered delay before retry `n`, counting from zero.
    pub fn delay(&self, n: u32) -> Duration {
        let exp = i32::try_from(n).unwrap_or(i32::MAX);
        let grown = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        let capped = grown.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped * rand::thread_rng().gen_range(0.75..=1.25))
    }
}

/// Wraps a store and retries transient failures with jittered backoff.
///
/// Permanent failures pass through untouched; exhaustion is reported as
/// [`StoreError`] from the last attempt, with the attempt count logged.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
    retries: Option<prometheus::IntCounter>,
}

impl<S: ChunkStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retries: None,
        }
    }

    /// Count every retry on `counter`.
    pub fn with_counter(mut self, counter: prometheus::IntCounter) -> Self {
        self.retries = Some(counter);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<'a, T, F, Fut>(&'a self, op: &'static str, key: &'a str, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>> + 'a,
    {
        let attempts = self.policy.max_attempts.max(1);
        let backoff = self.policy.backoff();
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = backoff.delay(attempt - 1);
                    tracing::warn!(
                        op,
                        key,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Transient store failure, retrying"
                    );
                    if let Some(c) = &self.retries {
                        c.inc();
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(op, key, attempts, error = %e, "Store retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<S: ChunkStore> ChunkStore for RetryingStore<S> {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.run("exists", key, || self.inner.exists(key)).await
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.run("get", key, || self.inner.get(key)).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.run("put", key, || self.inner.put(key, bytes)).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.run("list", prefix, || self.inner.list_by_prefix(prefix)).await
    }
}

/// Lift a store failure into a pipeline failure, marking transient ones as exhausted.
pub fn escalate(err: StoreError, policy: &RetryPolicy) -> PipelineError {
    if err.is_transient() {
        PipelineError::RetriesExhausted {
            attempts: policy.max_attempts.max(1),
            source: err,
        }
    } else {
        PipelineError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_geometrically() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0);
        let ms = |n| backoff.delay(n).as_millis();

        assert!((75..=125).contains(&ms(0)));
        assert!((150..=250).contains(&ms(1)));
        assert!((600..=1000).contains(&ms(3)));
    }

    #[test]
    fn delays_are_capped() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(2000), 10.0);
        assert!(backoff.delay(1).as_millis() <= 2500);
        assert!(backoff.delay(u32::MAX).as_millis() <= 2500);
        assert!(backoff.delay(u32::MAX).as_millis() >= 1500);
    }

    /// Fails the first `failures` puts with a transient error.
    #[derive(Debug)]
    struct Flaky {
        inner: MemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChunkStore for Flaky {
        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }
        async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::transient(key, "unavailable"));
            }
            self.inner.put(key, bytes).await
        }
        async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.list_by_prefix(prefix).await
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_ms: 1,
            max_ms: 2,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let flaky = Flaky {
            inner: MemoryStore::new(),
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let store = RetryingStore::new(flaky, fast(3));
        store.put("ds/raw-0", b"abc").await.unwrap();
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get("ds/raw-0").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_error() {
        let flaky = Flaky {
            inner: MemoryStore::new(),
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let policy = fast(3);
        let store = RetryingStore::new(flaky, policy);
        let err = store.put("ds/raw-0", b"abc").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
        assert!(!store.exists("ds/raw-0").await.unwrap());
        assert!(matches!(
            escalate(err, &policy),
            PipelineError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let store = RetryingStore::new(MemoryStore::new(), fast(5));
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
