//! Fee allowances.
//!
//! Grants are created and revoked by messages. Expired grants are swept two
//! ways: on every block (by block time, at the block height) and by a
//! periodic job (by wall clock, at each grant's own height).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use chainview_core::chain::{list_all, ChainQuery, QueryRequest};
use chainview_core::error::ViewError;
use chainview_core::message::RawMsg;
use chainview_core::module::{BlockHandler, MessageHandler, ModuleRegistration, PeriodicOperations};
use chainview_core::reconcile::{refresh_scope, ReconcileReport, Reconciler, RefreshMode};
use chainview_core::scheduler::Job;
use chainview_core::store::{Entity, EntityStore, HeightGatedStore, NaturalKey, Scope, WriteOutcome};
use chainview_core::types::{Block, BlockResults, Height, Tx, Validator};

pub const MODULE: &str = "feegrant";

pub const MSG_GRANT_ALLOWANCE: &str = "/cosmos.feegrant.v1beta1.MsgGrantAllowance";
pub const MSG_REVOKE_ALLOWANCE: &str = "/cosmos.feegrant.v1beta1.MsgRevokeAllowance";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeGrant {
    pub granter: String,
    pub grantee: String,
    #[serde(default)]
    pub spend_limit: serde_json::Value,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl FeeGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }
}

pub struct FeeGrantKey {
    pub granter: String,
    pub grantee: String,
}

impl NaturalKey for FeeGrantKey {
    fn encode(&self) -> String {
        format!("{}/{}", self.granter, self.grantee)
    }

    fn scope(&self) -> Scope {
        Scope::global()
    }
}

impl Entity for FeeGrant {
    const KIND: &'static str = "fee_grant";
    type Key = FeeGrantKey;

    fn key(&self) -> FeeGrantKey {
        FeeGrantKey {
            granter: self.granter.clone(),
            grantee: self.grantee.clone(),
        }
    }
}

#[async_trait]
pub trait FeeGrantsStore: HeightGatedStore {
    async fn save_grant(&self, grant: &FeeGrant, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_grant(&self, granter: &str, grantee: &str, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn grants(&self) -> Result<Vec<FeeGrant>, ViewError>;

    /// Delete every grant expired at `now`. With `at`, deletes are gated at
    /// that height; without, at the height each grant was stored with.
    async fn delete_expired_grants(&self, now: DateTime<Utc>, at: Option<Height>) -> Result<u64, ViewError>;
}

#[async_trait]
impl<S: HeightGatedStore> FeeGrantsStore for S {
    async fn save_grant(&self, grant: &FeeGrant, height: Height) -> Result<WriteOutcome, ViewError> {
        self.save(grant, height).await
    }

    async fn delete_grant(&self, granter: &str, grantee: &str, height: Height) -> Result<WriteOutcome, ViewError> {
        let key = FeeGrantKey {
            granter: granter.to_string(),
            grantee: grantee.to_string(),
        };
        self.remove::<FeeGrant>(&key, height).await
    }

    async fn grants(&self) -> Result<Vec<FeeGrant>, ViewError> {
        self.load_all::<FeeGrant>().await
    }

    async fn delete_expired_grants(&self, now: DateTime<Utc>, at: Option<Height>) -> Result<u64, ViewError> {
        let mut removed = 0;
        for row in self.list_kind(FeeGrant::KIND).await? {
            let grant: FeeGrant = serde_json::from_value(row.payload)?;
            if !grant.is_expired(now) {
                continue;
            }
            let height = at.unwrap_or(row.height);
            if self.delete(&row.kind, &row.key, &row.scope, height).await?.is_applied() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn allowances_query() -> QueryRequest {
    QueryRequest::new("/cosmos/feegrant/v1beta1/allowances")
}

#[derive(Deserialize)]
struct Allowance {
    #[serde(default)]
    spend_limit: serde_json::Value,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct MsgGrantAllowance {
    granter: String,
    grantee: String,
    allowance: Allowance,
}

#[derive(Deserialize)]
struct MsgRevokeAllowance {
    granter: String,
    grantee: String,
}

pub struct FeeGrantsModule {
    store: Arc<dyn FeeGrantsStore>,
    chain: Arc<dyn ChainQuery>,
    sweep_interval: Duration,
}

impl FeeGrantsModule {
    pub fn new(store: Arc<dyn FeeGrantsStore>, chain: Arc<dyn ChainQuery>, sweep_interval: Duration) -> Self {
        Self {
            store,
            chain,
            sweep_interval,
        }
    }

    pub fn registration(self: Arc<Self>) -> ModuleRegistration {
        ModuleRegistration::new(MODULE)
            .with_message_handler(self.clone())
            .with_block_handler(self.clone())
            .with_periodic_operations(self.clone())
            .with_reconciler(self)
    }
}

#[async_trait]
impl MessageHandler for FeeGrantsModule {
    async fn handle_msg(&self, _index: usize, msg: &RawMsg, tx: &Tx) -> Result<(), ViewError> {
        match msg.type_url.as_str() {
            MSG_GRANT_ALLOWANCE => {
                let body: MsgGrantAllowance = msg.decode()?;
                let grant = FeeGrant {
                    granter: body.granter,
                    grantee: body.grantee,
                    spend_limit: body.allowance.spend_limit,
                    expiration: body.allowance.expiration,
                };
                self.store.save_grant(&grant, tx.height).await?;
            }
            MSG_REVOKE_ALLOWANCE => {
                let body: MsgRevokeAllowance = msg.decode()?;
                self.store.delete_grant(&body.granter, &body.grantee, tx.height).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl BlockHandler for FeeGrantsModule {
    async fn handle_block(
        &self,
        block: &Block,
        _results: &BlockResults,
        _txs: &[Tx],
        _validators: &[Validator],
    ) -> Result<(), ViewError> {
        let removed = self
            .store
            .delete_expired_grants(block.timestamp, Some(block.height))
            .await?;
        if removed > 0 {
            debug!(height = block.height, removed, "expired fee grants removed");
        }
        Ok(())
    }
}

impl PeriodicOperations for FeeGrantsModule {
    fn periodic_jobs(&self) -> Vec<Job> {
        let store = self.store.clone();
        let job = Job::from_fn("expiry_sweep", self.sweep_interval, move || {
            let store = store.clone();
            async move {
                let removed = store.delete_expired_grants(Utc::now(), None).await?;
                info!(removed, "fee grant expiry sweep");
                Ok::<(), ViewError>(())
            }
        });
        vec![job]
    }
}

#[async_trait]
impl Reconciler for FeeGrantsModule {
    fn name(&self) -> &str {
        MODULE
    }

    async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
        let grants: Vec<FeeGrant> = list_all(self.chain.as_ref(), height, &allowances_query()).await?;
        refresh_scope(self.store.as_ref(), scope, height, grants, RefreshMode::Replace).await
    }
}
