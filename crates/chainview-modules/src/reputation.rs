//! Reputation scores for linked application accounts.
//!
//! Every application link is a candidate; every configured provider is asked
//! for a score under its rate limit. Scores are gated by the time they were
//! refreshed (milliseconds since the epoch), not by block height.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainview_core::chain::{point_as, ChainQuery, QueryRequest};
use chainview_core::enrichment::{EnrichmentBatcher, EnrichmentProvider, EnrichmentSink, RateLimit};
use chainview_core::error::ViewError;
use chainview_core::module::{ModuleRegistration, PeriodicOperations};
use chainview_core::scheduler::Job;
use chainview_core::store::{Entity, EntityStore, HeightGatedStore, NaturalKey, Scope, WriteOutcome};
use chainview_core::types::Height;

use crate::profiles::AppLink;

pub const MODULE: &str = "reputation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationScore {
    pub user: String,
    pub application: String,
    pub provider: String,
    pub score: f64,
    pub refreshed_at: DateTime<Utc>,
}

pub struct ScoreKey {
    pub user: String,
    pub application: String,
    pub provider: String,
}

impl NaturalKey for ScoreKey {
    fn encode(&self) -> String {
        format!("{}/{}/{}", self.user, self.application, self.provider)
    }

    fn scope(&self) -> Scope {
        Scope::global()
    }
}

impl Entity for ReputationScore {
    const KIND: &'static str = "reputation_score";
    type Key = ScoreKey;

    fn key(&self) -> ScoreKey {
        ScoreKey {
            user: self.user.clone(),
            application: self.application.clone(),
            provider: self.provider.clone(),
        }
    }
}

/// Gate value for a score refreshed at `at`.
pub fn refresh_height(at: DateTime<Utc>) -> Height {
    at.timestamp_millis().max(0) as Height
}

#[async_trait]
pub trait ReputationStore: HeightGatedStore {
    async fn save_score(&self, score: &ReputationScore) -> Result<WriteOutcome, ViewError>;
    async fn scores(&self) -> Result<Vec<ReputationScore>, ViewError>;
    async fn linked_accounts(&self) -> Result<Vec<AppLink>, ViewError>;
}

#[async_trait]
impl<S: HeightGatedStore> ReputationStore for S {
    async fn save_score(&self, score: &ReputationScore) -> Result<WriteOutcome, ViewError> {
        self.save(score, refresh_height(score.refreshed_at)).await
    }

    async fn scores(&self) -> Result<Vec<ReputationScore>, ViewError> {
        self.load_all::<ReputationScore>().await
    }

    async fn linked_accounts(&self) -> Result<Vec<AppLink>, ViewError> {
        self.load_all::<AppLink>().await
    }
}

// ─── Providers ────────────────────────────────────────────────────────────────

/// Scores served through the chain query facade at
/// `/reputation/{provider}/score?application=..&username=..`.
pub struct QueryScoreProvider {
    name: String,
    limit: RateLimit,
    chain: Arc<dyn ChainQuery>,
}

impl QueryScoreProvider {
    pub fn new(name: impl Into<String>, limit: RateLimit, chain: Arc<dyn ChainQuery>) -> Self {
        Self {
            name: name.into(),
            limit,
            chain,
        }
    }

    pub fn query(provider: &str, link: &AppLink) -> QueryRequest {
        QueryRequest::new(format!("/reputation/{provider}/score"))
            .param("application", link.application.as_str())
            .param("username", link.username.as_str())
    }
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
}

#[async_trait]
impl EnrichmentProvider<AppLink, f64> for QueryScoreProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate_limit(&self) -> RateLimit {
        self.limit
    }

    async fn fetch(&self, link: &AppLink) -> Result<f64, ViewError> {
        let response: ScoreResponse = point_as(self.chain.as_ref(), 0, &Self::query(&self.name, link)).await?;
        Ok(response.score)
    }
}

/// Candidates are the stored application links; results become scores.
pub struct ScoreSink {
    store: Arc<dyn ReputationStore>,
}

impl ScoreSink {
    pub fn new(store: Arc<dyn ReputationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EnrichmentSink<AppLink, f64> for ScoreSink {
    async fn candidates(&self) -> Result<Vec<AppLink>, ViewError> {
        self.store.linked_accounts().await
    }

    async fn store(
        &self,
        link: &AppLink,
        provider: &str,
        score: f64,
        refreshed_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, ViewError> {
        let score = ReputationScore {
            user: link.user.clone(),
            application: link.application.clone(),
            provider: provider.to_string(),
            score,
            refreshed_at,
        };
        self.store.save_score(&score).await
    }
}

// ─── Module ───────────────────────────────────────────────────────────────────

pub struct ReputationModule {
    batcher: Arc<EnrichmentBatcher<AppLink, f64>>,
    interval: Duration,
}

impl ReputationModule {
    pub fn new(batcher: EnrichmentBatcher<AppLink, f64>, interval: Duration) -> Self {
        Self {
            batcher: Arc::new(batcher),
            interval,
        }
    }

    pub fn batcher(&self) -> &EnrichmentBatcher<AppLink, f64> {
        &self.batcher
    }

    pub fn registration(self: Arc<Self>) -> ModuleRegistration {
        ModuleRegistration::new(MODULE).with_periodic_operations(self)
    }
}

impl PeriodicOperations for ReputationModule {
    fn periodic_jobs(&self) -> Vec<Job> {
        vec![self.batcher.clone().into_job(self.interval)]
    }
}
