//! Rate-limited batch enrichment from external providers.
//!
//! Candidates are split into chunks no larger than the tightest provider
//! quota and processed one chunk per (widest) window, so every provider sees
//! at most its own `max_calls` within any window. Calls of one chunk run
//! concurrently. A provider failure only skips that provider for that
//! candidate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ViewError;
use crate::scheduler::Job;
use crate::store::WriteOutcome;

/// At most `max_calls` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub max_calls: u32,
}

impl RateLimit {
    pub fn new(window: Duration, max_calls: u32) -> Self {
        Self { window, max_calls }
    }

    /// The limit satisfying every input: fewest calls, longest window.
    /// `None` when there are no limits to combine.
    pub fn combine(limits: impl IntoIterator<Item = RateLimit>) -> Option<RateLimit> {
        limits.into_iter().reduce(|acc, next| RateLimit {
            window: acc.window.max(next.window),
            max_calls: acc.max_calls.min(next.max_calls),
        })
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// An external data source (e.g. a social-reputation API).
#[async_trait]
pub trait EnrichmentProvider<C, O>: Send + Sync
where
    C: Send + Sync,
    O: Send,
{
    fn name(&self) -> &str;

    fn rate_limit(&self) -> RateLimit;

    async fn fetch(&self, candidate: &C) -> Result<O, ViewError>;
}

/// Where candidates come from and results go to.
#[async_trait]
pub trait EnrichmentSink<C, O>: Send + Sync
where
    C: Send + Sync,
    O: Send,
{
    async fn candidates(&self) -> Result<Vec<C>, ViewError>;

    /// Persist one provider's result, gated by `refreshed_at`.
    async fn store(
        &self,
        candidate: &C,
        provider: &str,
        output: O,
        refreshed_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, ViewError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentSummary {
    pub candidates: usize,
    pub chunks: usize,
    /// Provider results written (or found stale) by the sink.
    pub succeeded: usize,
    /// Provider or sink failures, logged and skipped.
    pub failed: usize,
}

pub struct EnrichmentBatcher<C, O> {
    name: String,
    providers: Vec<Arc<dyn EnrichmentProvider<C, O>>>,
    sink: Arc<dyn EnrichmentSink<C, O>>,
}

impl<C, O> EnrichmentBatcher<C, O>
where
    C: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(name: impl Into<String>, sink: Arc<dyn EnrichmentSink<C, O>>) -> Self {
        Self {
            name: name.into(),
            providers: vec![],
            sink,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn EnrichmentProvider<C, O>>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn combined_limit(&self) -> Option<RateLimit> {
        RateLimit::combine(self.providers.iter().map(|p| p.rate_limit()))
    }

    /// One full enrichment pass. Only candidate loading and an invalid
    /// combined limit are errors.
    pub async fn run(&self) -> Result<EnrichmentSummary, ViewError> {
        let candidates = self.sink.candidates().await?;
        let mut summary = EnrichmentSummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        let Some(limit) = self.combined_limit() else {
            debug!(batcher = %self.name, "no providers configured");
            return Ok(summary);
        };
        if limit.max_calls == 0 {
            return Err(ViewError::Config(format!(
                "enrichment '{}' has a combined limit of 0 calls",
                self.name
            )));
        }

        for (i, chunk) in candidates.chunks(limit.max_calls as usize).enumerate() {
            if i > 0 {
                tokio::time::sleep(limit.window).await;
            }
            summary.chunks += 1;
            let calls = chunk.iter().flat_map(|candidate| {
                self.providers
                    .iter()
                    .map(move |provider| self.enrich_one(provider.as_ref(), candidate))
            });
            for ok in join_all(calls).await {
                if ok {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }
            }
            debug!(batcher = %self.name, chunk = i, size = chunk.len(), "chunk processed");
        }

        info!(
            batcher = %self.name,
            candidates = summary.candidates,
            chunks = summary.chunks,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "enrichment pass complete"
        );
        Ok(summary)
    }

    async fn enrich_one(&self, provider: &dyn EnrichmentProvider<C, O>, candidate: &C) -> bool {
        let output = match provider.fetch(candidate).await {
            Ok(output) => output,
            Err(e) => {
                warn!(batcher = %self.name, provider = provider.name(), error = %e, "provider call failed");
                return false;
            }
        };
        match self.sink.store(candidate, provider.name(), output, Utc::now()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(batcher = %self.name, provider = provider.name(), error = %e, "storing result failed");
                false
            }
        }
    }

    /// A scheduler job running [`Self::run`] every `interval`.
    pub fn into_job(self: Arc<Self>, interval: Duration) -> Job {
        let name = self.name.clone();
        Job::from_fn(name, interval, move || {
            let batcher = self.clone();
            async move { batcher.run().await.map(|_| ()) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct Provider {
        name: &'static str,
        limit: RateLimit,
        calls: Mutex<Vec<Instant>>,
        fail_on: Option<u32>,
    }

    impl Provider {
        fn new(name: &'static str, window_ms: u64, max_calls: u32, fail_on: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                name,
                limit: RateLimit::new(Duration::from_millis(window_ms), max_calls),
                calls: Mutex::new(vec![]),
                fail_on,
            })
        }

        fn max_calls_in(&self, window: Duration) -> usize {
            let calls = self.calls.lock().unwrap();
            calls
                .iter()
                .map(|start| calls.iter().filter(|t| **t >= *start && **t < *start + window).count())
                .max()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl EnrichmentProvider<u32, u64> for Provider {
        fn name(&self) -> &str {
            self.name
        }
        fn rate_limit(&self) -> RateLimit {
            self.limit
        }
        async fn fetch(&self, candidate: &u32) -> Result<u64, ViewError> {
            self.calls.lock().unwrap().push(Instant::now());
            if self.fail_on == Some(*candidate) {
                return Err(ViewError::Rpc("429 too many requests".into()));
            }
            Ok(*candidate as u64 * 10)
        }
    }

    struct Sink {
        candidates: Vec<u32>,
        stored: Mutex<Vec<(u32, String, u64)>>,
        reject: u32,
    }

    #[async_trait]
    impl EnrichmentSink<u32, u64> for Sink {
        async fn candidates(&self) -> Result<Vec<u32>, ViewError> {
            Ok(self.candidates.clone())
        }
        async fn store(
            &self,
            candidate: &u32,
            provider: &str,
            output: u64,
            _refreshed_at: DateTime<Utc>,
        ) -> Result<WriteOutcome, ViewError> {
            if *candidate == self.reject {
                return Err(ViewError::Storage("connection closed".into()));
            }
            self.stored.lock().unwrap().push((*candidate, provider.to_string(), output));
            Ok(WriteOutcome::Applied)
        }
    }

    fn sink(n: u32, reject: u32) -> Arc<Sink> {
        Arc::new(Sink {
            candidates: (1..=n).collect(),
            stored: Mutex::new(vec![]),
            reject,
        })
    }

    #[test]
    fn combine_takes_min_calls_and_max_window() {
        let combined = RateLimit::combine([
            RateLimit::new(Duration::from_secs(1), 10),
            RateLimit::new(Duration::from_secs(60), 300),
            RateLimit::new(Duration::from_millis(500), 4),
        ])
        .unwrap();
        assert_eq!(combined, RateLimit::new(Duration::from_secs(60), 4));
        assert_eq!(RateLimit::combine([]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_respect_every_provider_limit() {
        let fast = Provider::new("fast", 1_000, 10, Some(3));
        let loose = Provider::new("loose", 500, 20, None);
        let sink = sink(25, 7);
        let batcher = EnrichmentBatcher::<u32, u64>::new("scores", sink.clone())
            .with_provider(fast.clone())
            .with_provider(loose.clone());

        let started = Instant::now();
        let summary = batcher.run().await.unwrap();

        assert_eq!(summary.candidates, 25);
        assert_eq!(summary.chunks, 3);
        // candidate 3 fails at "fast", candidate 7 fails at the sink for both providers
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.succeeded, 47);

        assert!(fast.max_calls_in(Duration::from_secs(1)) <= 10);
        assert!(loose.max_calls_in(Duration::from_millis(500)) <= 20);
        assert_eq!(fast.calls.lock().unwrap().len(), 25);

        // two sleeps between three chunks, none after the last
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn no_providers_is_a_no_op() {
        let batcher = EnrichmentBatcher::<u32, u64>::new("empty", sink(3, 0));
        let summary = batcher.run().await.unwrap();
        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.chunks, 0);
    }

    #[tokio::test]
    async fn zero_call_limit_is_rejected() {
        let batcher = EnrichmentBatcher::<u32, u64>::new("broken", sink(3, 0)).with_provider(Provider::new("dead", 1_000, 0, None));
        assert!(matches!(batcher.run().await, Err(ViewError::Config(_))));
    }
}
