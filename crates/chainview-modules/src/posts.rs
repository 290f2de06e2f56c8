//! Posts and reactions, partitioned by subspace.
//!
//! Live updates come from post/reaction messages: the handler takes the new
//! id from the message's events and refreshes the full post from the chain
//! at the transaction height. Deleting a post tombstones it and each of its
//! reactions; a reaction older than its post's tombstone is dropped.
//! Reconciliation replaces a whole subspace, then the reactions of every post
//! in it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chainview_core::chain::{list_all, point_as, ChainQuery, QueryRequest};
use chainview_core::error::{not_found_as_none, ViewError};
use chainview_core::message::RawMsg;
use chainview_core::module::{GenesisHandler, MessageHandler, ModuleRegistration};
use chainview_core::reconcile::{refresh_scope, ReconcileReport, Reconciler, RefreshMode};
use chainview_core::store::{Entity, EntityStore, HeightGatedStore, NaturalKey, Scope, WriteOutcome};
use chainview_core::types::{AppState, GenesisDoc, Height, Tx};

pub const MODULE: &str = "posts";

pub const MSG_CREATE_POST: &str = "/desmos.posts.v3.MsgCreatePost";
pub const MSG_EDIT_POST: &str = "/desmos.posts.v3.MsgEditPost";
pub const MSG_DELETE_POST: &str = "/desmos.posts.v3.MsgDeletePost";
pub const MSG_ADD_REACTION: &str = "/desmos.reactions.v1.MsgAddReaction";
pub const MSG_REMOVE_REACTION: &str = "/desmos.reactions.v1.MsgRemoveReaction";

// ─── Entities ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub subspace_id: u64,
    pub id: u64,
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub subspace_id: u64,
    pub post_id: u64,
    pub id: u32,
    pub author: String,
    pub value: serde_json::Value,
}

pub struct PostKey {
    pub subspace_id: u64,
    pub post_id: u64,
}

pub struct ReactionKey {
    pub subspace_id: u64,
    pub post_id: u64,
    pub reaction_id: u32,
}

pub fn subspace_scope(subspace_id: u64) -> Scope {
    Scope::new(format!("subspace/{subspace_id}"))
}

pub fn post_scope(subspace_id: u64, post_id: u64) -> Scope {
    subspace_scope(subspace_id).child("post", post_id)
}

impl NaturalKey for PostKey {
    fn encode(&self) -> String {
        format!("{}/{}", self.subspace_id, self.post_id)
    }

    fn scope(&self) -> Scope {
        subspace_scope(self.subspace_id)
    }
}

impl NaturalKey for ReactionKey {
    fn encode(&self) -> String {
        format!("{}/{}/{}", self.subspace_id, self.post_id, self.reaction_id)
    }

    fn scope(&self) -> Scope {
        post_scope(self.subspace_id, self.post_id)
    }
}

impl Entity for Post {
    const KIND: &'static str = "post";
    type Key = PostKey;

    fn key(&self) -> PostKey {
        PostKey {
            subspace_id: self.subspace_id,
            post_id: self.id,
        }
    }
}

impl Entity for Reaction {
    const KIND: &'static str = "reaction";
    type Key = ReactionKey;

    fn key(&self) -> ReactionKey {
        ReactionKey {
            subspace_id: self.subspace_id,
            post_id: self.post_id,
            reaction_id: self.id,
        }
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Persistence used by the posts module.
#[async_trait]
pub trait PostsStore: HeightGatedStore {
    async fn save_post(&self, post: &Post, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_post(&self, subspace_id: u64, post_id: u64, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_all_posts(&self, subspace_id: u64, height: Height) -> Result<u64, ViewError>;
    async fn save_reaction(&self, reaction: &Reaction, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_reaction(&self, key: &ReactionKey, height: Height) -> Result<WriteOutcome, ViewError>;
    async fn delete_all_reactions(&self, subspace_id: u64, post_id: u64, height: Height) -> Result<u64, ViewError>;
    async fn post(&self, subspace_id: u64, post_id: u64) -> Result<Option<Post>, ViewError>;
    async fn post_deleted_at(&self, subspace_id: u64, post_id: u64) -> Result<Option<Height>, ViewError>;
    async fn posts(&self, subspace_id: u64) -> Result<Vec<Post>, ViewError>;
    async fn reactions(&self, subspace_id: u64, post_id: u64) -> Result<Vec<Reaction>, ViewError>;
    /// Ids of the posts in `subspace_id` that have stored reactions.
    async fn reacted_posts(&self, subspace_id: u64) -> Result<Vec<u64>, ViewError>;
}

#[async_trait]
impl<S: HeightGatedStore> PostsStore for S {
    async fn save_post(&self, post: &Post, height: Height) -> Result<WriteOutcome, ViewError> {
        self.save(post, height).await
    }

    async fn delete_post(&self, subspace_id: u64, post_id: u64, height: Height) -> Result<WriteOutcome, ViewError> {
        self.remove::<Post>(&PostKey { subspace_id, post_id }, height).await
    }

    async fn delete_all_posts(&self, subspace_id: u64, height: Height) -> Result<u64, ViewError> {
        self.clear_scope::<Post>(&subspace_scope(subspace_id), height).await
    }

    async fn save_reaction(&self, reaction: &Reaction, height: Height) -> Result<WriteOutcome, ViewError> {
        self.save(reaction, height).await
    }

    async fn delete_reaction(&self, key: &ReactionKey, height: Height) -> Result<WriteOutcome, ViewError> {
        self.remove::<Reaction>(key, height).await
    }

    async fn delete_all_reactions(&self, subspace_id: u64, post_id: u64, height: Height) -> Result<u64, ViewError> {
        self.clear_scope::<Reaction>(&post_scope(subspace_id, post_id), height).await
    }

    async fn post(&self, subspace_id: u64, post_id: u64) -> Result<Option<Post>, ViewError> {
        self.load::<Post>(&PostKey { subspace_id, post_id }).await
    }

    async fn post_deleted_at(&self, subspace_id: u64, post_id: u64) -> Result<Option<Height>, ViewError> {
        self.tombstone_height::<Post>(&PostKey { subspace_id, post_id }).await
    }

    async fn posts(&self, subspace_id: u64) -> Result<Vec<Post>, ViewError> {
        self.load_scope::<Post>(&subspace_scope(subspace_id)).await
    }

    async fn reactions(&self, subspace_id: u64, post_id: u64) -> Result<Vec<Reaction>, ViewError> {
        self.load_scope::<Reaction>(&post_scope(subspace_id, post_id)).await
    }

    async fn reacted_posts(&self, subspace_id: u64) -> Result<Vec<u64>, ViewError> {
        let prefix = format!("{}/", subspace_scope(subspace_id));
        let mut ids = BTreeSet::new();
        for row in self.list_kind(Reaction::KIND).await? {
            if row.scope.starts_with(&prefix) {
                ids.insert(Scope::new(row.scope).id_of("post")?);
            }
        }
        Ok(ids.into_iter().collect())
    }
}

// ─── Chain queries ────────────────────────────────────────────────────────────

pub fn subspaces_query() -> QueryRequest {
    QueryRequest::new("/desmos/subspaces/v3/subspaces")
}

pub fn post_query(subspace_id: u64, post_id: u64) -> QueryRequest {
    QueryRequest::new("/desmos/posts/v3/post")
        .param("subspace_id", subspace_id)
        .param("post_id", post_id)
}

pub fn posts_query(subspace_id: u64) -> QueryRequest {
    QueryRequest::new("/desmos/posts/v3/posts").param("subspace_id", subspace_id)
}

pub fn reactions_query(subspace_id: u64, post_id: u64) -> QueryRequest {
    QueryRequest::new("/desmos/reactions/v1/reactions")
        .param("subspace_id", subspace_id)
        .param("post_id", post_id)
}

#[derive(Deserialize)]
struct SubspaceRef {
    id: u64,
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MsgCreatePost {
    subspace_id: u64,
}

#[derive(Deserialize)]
struct MsgPostRef {
    subspace_id: u64,
    post_id: u64,
}

#[derive(Deserialize)]
struct MsgAddReaction {
    subspace_id: u64,
    post_id: u64,
    user: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct MsgRemoveReaction {
    subspace_id: u64,
    post_id: u64,
    reaction_id: u32,
}

#[derive(Default, Deserialize)]
struct PostsGenesis {
    #[serde(default)]
    posts: Vec<Post>,
    #[serde(default)]
    reactions: Vec<Reaction>,
}

// ─── Module ───────────────────────────────────────────────────────────────────

pub struct PostsModule {
    store: Arc<dyn PostsStore>,
    chain: Arc<dyn ChainQuery>,
}

impl PostsModule {
    pub fn new(store: Arc<dyn PostsStore>, chain: Arc<dyn ChainQuery>) -> Self {
        Self { store, chain }
    }

    pub fn registration(self: Arc<Self>) -> ModuleRegistration {
        ModuleRegistration::new(MODULE)
            .with_message_handler(self.clone())
            .with_genesis_handler(self.clone())
            .with_reconciler(self)
    }

    /// Re-read a post from the chain at `height` and store it.
    async fn refresh_post(&self, subspace_id: u64, post_id: u64, height: Height) -> Result<(), ViewError> {
        let fetched =
            not_found_as_none(point_as::<Post, _>(self.chain.as_ref(), height, &post_query(subspace_id, post_id)).await)?;
        match fetched {
            Some(post) => {
                self.store.save_post(&post, height).await?;
            }
            None => debug!(subspace_id, post_id, height, "post no longer exists on chain"),
        }
        Ok(())
    }

    async fn fetch_posts(&self, subspace_id: u64, height: Height) -> Result<Vec<Post>, ViewError> {
        let posts = list_all(self.chain.as_ref(), height, &posts_query(subspace_id)).await;
        Ok(not_found_as_none(posts)?.unwrap_or_default())
    }

    async fn fetch_reactions(&self, subspace_id: u64, post_id: u64, height: Height) -> Result<Vec<Reaction>, ViewError> {
        let reactions = list_all(self.chain.as_ref(), height, &reactions_query(subspace_id, post_id)).await;
        Ok(not_found_as_none(reactions)?.unwrap_or_default())
    }
}

#[async_trait]
impl MessageHandler for PostsModule {
    async fn handle_msg(&self, index: usize, msg: &RawMsg, tx: &Tx) -> Result<(), ViewError> {
        match msg.type_url.as_str() {
            MSG_CREATE_POST => {
                let body: MsgCreatePost = msg.decode()?;
                let post_id = tx.find_event(index, "create_post")?.require_u64("post_id")?;
                self.refresh_post(body.subspace_id, post_id, tx.height).await
            }
            MSG_EDIT_POST => {
                let body: MsgPostRef = msg.decode()?;
                self.refresh_post(body.subspace_id, body.post_id, tx.height).await
            }
            MSG_DELETE_POST => {
                let body: MsgPostRef = msg.decode()?;
                self.store.delete_post(body.subspace_id, body.post_id, tx.height).await?;
                for reaction in self.store.reactions(body.subspace_id, body.post_id).await? {
                    self.store.delete_reaction(&reaction.key(), tx.height).await?;
                }
                Ok(())
            }
            MSG_ADD_REACTION => {
                let body: MsgAddReaction = msg.decode()?;
                let id = tx.find_event(index, "add_reaction")?.require_u64("reaction_id")?;
                if let Some(deleted) = self.store.post_deleted_at(body.subspace_id, body.post_id).await? {
                    if deleted >= tx.height {
                        debug!(
                            subspace_id = body.subspace_id,
                            post_id = body.post_id,
                            deleted,
                            height = tx.height,
                            "reaction predates post deletion, skipping"
                        );
                        return Ok(());
                    }
                }
                let reaction = Reaction {
                    subspace_id: body.subspace_id,
                    post_id: body.post_id,
                    id: u32::try_from(id)
                        .map_err(|_| ViewError::Decode(format!("reaction id {id} out of range")))?,
                    author: body.user,
                    value: body.value,
                };
                self.store.save_reaction(&reaction, tx.height).await?;
                Ok(())
            }
            MSG_REMOVE_REACTION => {
                let body: MsgRemoveReaction = msg.decode()?;
                let key = ReactionKey {
                    subspace_id: body.subspace_id,
                    post_id: body.post_id,
                    reaction_id: body.reaction_id,
                };
                self.store.delete_reaction(&key, tx.height).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl GenesisHandler for PostsModule {
    async fn handle_genesis(&self, doc: &GenesisDoc, app_state: &AppState) -> Result<(), ViewError> {
        let genesis: PostsGenesis = match app_state.get(MODULE) {
            Some(raw) => serde_json::from_value(raw.clone())?,
            None => PostsGenesis::default(),
        };
        for post in &genesis.posts {
            self.store.save_post(post, doc.initial_height).await?;
        }
        for reaction in &genesis.reactions {
            self.store.save_reaction(reaction, doc.initial_height).await?;
        }
        debug!(
            posts = genesis.posts.len(),
            reactions = genesis.reactions.len(),
            "posts genesis imported"
        );
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PostsModule {
    fn name(&self) -> &str {
        MODULE
    }

    /// One scope per subspace.
    async fn scopes(&self, height: Height) -> Result<Vec<Scope>, ViewError> {
        let subspaces: Vec<SubspaceRef> = list_all(self.chain.as_ref(), height, &subspaces_query()).await?;
        Ok(subspaces.into_iter().map(|s| subspace_scope(s.id)).collect())
    }

    async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
        let subspace_id = scope.id_of("subspace")?;
        let mut report = ReconcileReport::new(MODULE, scope, height);

        let reacted = self.store.reacted_posts(subspace_id).await?;
        let posts = self.fetch_posts(subspace_id, height).await?;
        let current: BTreeSet<u64> = posts.iter().map(|p| p.id).collect();

        let posts_report = refresh_scope(self.store.as_ref(), scope, height, posts, RefreshMode::Replace).await?;
        report.absorb(&posts_report);

        for post_id in &current {
            let reactions = self.fetch_reactions(subspace_id, *post_id, height).await?;
            let child = refresh_scope(
                self.store.as_ref(),
                &post_scope(subspace_id, *post_id),
                height,
                reactions,
                RefreshMode::Replace,
            )
            .await?;
            report.absorb(&child);
        }

        // reactions of posts that are not on chain anymore, stored or not
        for vanished in reacted.iter().filter(|id| !current.contains(id)) {
            report.cleared += self.store.delete_all_reactions(subspace_id, *vanished, height).await?;
        }

        Ok(report)
    }
}
