//! Profiles and application links.
//!
//! Driven by transaction events rather than messages: whatever message
//! produced a `save_profile` event, the profile is re-read from the chain.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chainview_core::chain::{list_all, point_as, ChainQuery, QueryRequest};
use chainview_core::error::{not_found_as_none, ViewError};
use chainview_core::module::{ModuleRegistration, TransactionHandler};
use chainview_core::reconcile::{refresh_scope, CompositeReconciler, ReconcileReport, Reconciler, RefreshMode};
use chainview_core::store::{Entity, EntityStore, HeightGatedStore, NaturalKey, Scope, WriteOutcome};
use chainview_core::types::{Height, Tx};

pub const MODULE: &str = "profiles";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub address: String,
    pub dtag: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub bio: String,
}

/// A link between a chain account and an external application username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppLink {
    pub user: String,
    pub application: String,
    pub username: String,
}

pub struct ProfileKey(pub String);

pub struct AppLinkKey {
    pub user: String,
    pub application: String,
}

impl NaturalKey for ProfileKey {
    fn encode(&self) -> String {
        self.0.clone()
    }

    fn scope(&self) -> Scope {
        Scope::global()
    }
}

impl NaturalKey for AppLinkKey {
    fn encode(&self) -> String {
        format!("{}/{}", self.user, self.application)
    }

    fn scope(&self) -> Scope {
        Scope::global()
    }
}

impl Entity for Profile {
    const KIND: &'static str = "profile";
    type Key = ProfileKey;

    fn key(&self) -> ProfileKey {
        ProfileKey(self.address.clone())
    }
}

impl Entity for AppLink {
    const KIND: &'static str = "app_link";
    type Key = AppLinkKey;

    fn key(&self) -> AppLinkKey {
        AppLinkKey {
            user: self.user.clone(),
            application: self.application.clone(),
        }
    }
}

#[async_trait]
pub trait ProfilesStore: HeightGatedStore {
    async fn save_profile(&self, profile: &Profile, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_profile(&self, address: &str, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn save_app_link(&self, link: &AppLink, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_app_link(&self, user: &str, application: &str, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn profile(&self, address: &str) -> Result<Option<Profile>, ViewError>;
    async fn app_links(&self) -> Result<Vec<AppLink>, ViewError>;
}

#[async_trait]
impl<S: HeightGatedStore> ProfilesStore for S {
    async fn save_profile(&self, profile: &Profile, height: Height) -> Result<WriteOutcome, ViewError> {
        self.save(profile, height).await
    }

    async fn delete_profile(&self, address: &str, height: Height) -> Result<WriteOutcome, ViewError> {
        self.remove::<Profile>(&ProfileKey(address.to_string()), height).await
    }

    async fn save_app_link(&self, link: &AppLink, height: Height) -> Result<WriteOutcome, ViewError> {
        self.save(link, height).await
    }

    async fn delete_app_link(&self, user: &str, application: &str, height: Height) -> Result<WriteOutcome, ViewError> {
        let key = AppLinkKey {
            user: user.to_string(),
            application: application.to_string(),
        };
        self.remove::<AppLink>(&key, height).await
    }

    async fn profile(&self, address: &str) -> Result<Option<Profile>, ViewError> {
        self.load::<Profile>(&ProfileKey(address.to_string())).await
    }

    async fn app_links(&self) -> Result<Vec<AppLink>, ViewError> {
        self.load_all::<AppLink>().await
    }
}

pub fn profile_query(address: &str) -> QueryRequest {
    QueryRequest::new("/desmos/profiles/v3/profile").param("user", address)
}

pub fn profiles_query() -> QueryRequest {
    QueryRequest::new("/desmos/profiles/v3/profiles")
}

pub fn app_links_query() -> QueryRequest {
    QueryRequest::new("/desmos/profiles/v3/app_links")
}

pub struct ProfilesModule {
    store: Arc<dyn ProfilesStore>,
    chain: Arc<dyn ChainQuery>,
}

impl ProfilesModule {
    pub fn new(store: Arc<dyn ProfilesStore>, chain: Arc<dyn ChainQuery>) -> Self {
        Self { store, chain }
    }

    /// Profiles first, then application links.
    pub fn registration(self: Arc<Self>) -> ModuleRegistration {
        let reconciler = CompositeReconciler::new(MODULE)
            .then(Arc::new(ProfileSet {
                store: self.store.clone(),
                chain: self.chain.clone(),
            }))
            .then(Arc::new(AppLinkSet {
                store: self.store.clone(),
                chain: self.chain.clone(),
            }));
        ModuleRegistration::new(MODULE)
            .with_transaction_handler(self)
            .with_reconciler(Arc::new(reconciler))
    }

    async fn refresh_profile(&self, address: &str, height: Height) -> Result<(), ViewError> {
        let fetched =
            not_found_as_none(point_as::<Profile, _>(self.chain.as_ref(), height, &profile_query(address)).await)?;
        match fetched {
            Some(profile) => {
                self.store.save_profile(&profile, height).await?;
            }
            None => {
                debug!(address, height, "profile missing on chain, removing");
                self.store.delete_profile(address, height).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionHandler for ProfilesModule {
    async fn handle_tx(&self, tx: &Tx) -> Result<(), ViewError> {
        for event in &tx.events {
            match event.kind.as_str() {
                "save_profile" => {
                    self.refresh_profile(event.require("profile_creator")?, tx.height).await?;
                }
                "delete_profile" => {
                    self.store
                        .delete_profile(event.require("profile_creator")?, tx.height)
                        .await?;
                }
                "create_application_link" => {
                    let link = AppLink {
                        user: event.require("user")?.to_string(),
                        application: event.require("application_name")?.to_string(),
                        username: event.require("application_username")?.to_string(),
                    };
                    self.store.save_app_link(&link, tx.height).await?;
                }
                "delete_application_link" => {
                    self.store
                        .delete_app_link(
                            event.require("user")?,
                            event.require("application_name")?,
                            tx.height,
                        )
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

struct ProfileSet {
    store: Arc<dyn ProfilesStore>,
    chain: Arc<dyn ChainQuery>,
}

#[async_trait]
impl Reconciler for ProfileSet {
    fn name(&self) -> &str {
        "profile"
    }

    async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
        let profiles: Vec<Profile> = list_all(self.chain.as_ref(), height, &profiles_query()).await?;
        refresh_scope(self.store.as_ref(), scope, height, profiles, RefreshMode::Replace).await
    }
}

struct AppLinkSet {
    store: Arc<dyn ProfilesStore>,
    chain: Arc<dyn ChainQuery>,
}

#[async_trait]
impl Reconciler for AppLinkSet {
    fn name(&self) -> &str {
        "app_link"
    }

    async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
        let links: Vec<AppLink> = list_all(self.chain.as_ref(), height, &app_links_query()).await?;
        refresh_scope(self.store.as_ref(), scope, height, links, RefreshMode::Replace).await
    }
}
