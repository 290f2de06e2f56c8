//! The height-gated store contract.
//!
//! Every projected row is `(kind, natural_key) → (scope, height, payload)`.
//! Backends must implement [`HeightGatedStore::upsert`] and
//! [`HeightGatedStore::delete`] as a *single* conditional statement:
//!
//! ```sql
//! INSERT INTO entities (...) VALUES (...)
//! ON CONFLICT (kind, natural_key) DO UPDATE SET ...
//! WHERE entities.height <= excluded.height
//! ```
//!
//! A write older than the stored row is a silent no-op reported as
//! [`WriteOutcome::Stale`], never an error. Deletes leave a tombstone that
//! keeps its height, so an older replayed create cannot resurrect the row.
//! Reads never return tombstones.
//!
//! Domain modules do not talk to this trait directly; they use
//! [`EntityStore`] (typed save/delete/load) behind their own narrow
//! per-domain traits.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ViewError;
use crate::types::Height;

// ─── Scope ────────────────────────────────────────────────────────────────────

/// The unit reconciled together, e.g. `subspace/7` or `subspace/7/post/42`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope(String);

impl Scope {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Scope of entities that are not partitioned (profiles, grants, …).
    pub fn global() -> Self {
        Self("global".into())
    }

    /// Nested scope: `subspace/7` + (`post`, 42) → `subspace/7/post/42`.
    pub fn child(&self, segment: &str, id: impl fmt::Display) -> Self {
        Self(format!("{}/{segment}/{id}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the id following `segment` (`subspace/7/post/42`, `"post"` → 42).
    pub fn id_of(&self, segment: &str) -> Result<u64, ViewError> {
        let mut parts = self.0.split('/');
        while let Some(part) = parts.next() {
            if part == segment {
                if let Some(id) = parts.next().and_then(|raw| raw.parse().ok()) {
                    return Ok(id);
                }
            }
        }
        Err(ViewError::Decode(format!(
            "scope '{}' has no numeric '{segment}' segment",
            self.0
        )))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

/// A persisted row, as seen by backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Entity table name (e.g. `"post"`).
    pub kind: String,
    /// Canonical encoding of the natural key.
    pub key: String,
    pub scope: String,
    pub height: Height,
    /// Tombstone marker; tombstones are never returned by reads.
    pub deleted: bool,
    pub payload: serde_json::Value,
}

/// Result of a gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row was inserted or moved forward.
    Applied,
    /// The stored row is newer; nothing changed.
    Stale,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

// ─── Backend contract ────────────────────────────────────────────────────────

/// The persistence boundary shared by every module.
///
/// Implementations: `InMemoryStore`, `SqliteStore` and `PostgresStore` in
/// chainview-storage. Errors propagate unchanged; backends never retry.
#[async_trait]
pub trait HeightGatedStore: Send + Sync {
    /// Insert `row`, or overwrite the stored row iff `stored.height <= row.height`.
    /// Overwriting a tombstone revives the row.
    async fn upsert(&self, row: &StoredRow) -> Result<WriteOutcome, ViewError>;

    /// Tombstone `(kind, key)` iff `stored.height <= height` (or no row exists).
    async fn delete(
        &self,
        kind: &str,
        key: &str,
        scope: &str,
        height: Height,
    ) -> Result<WriteOutcome, ViewError>;

    /// Remove every row of `kind` in `scope`, tombstones included, regardless
    /// of height. Only reconcilers call this, right before reinserting the
    /// authoritative set. Returns the number of rows removed.
    async fn delete_scope(&self, kind: &str, scope: &str, height: Height) -> Result<u64, ViewError>;

    /// The live row for `(kind, key)`.
    async fn get(&self, kind: &str, key: &str) -> Result<Option<StoredRow>, ViewError>;

    /// Height of the tombstone for `(kind, key)`; `None` if the key is live
    /// or unknown.
    async fn deleted_at(&self, kind: &str, key: &str) -> Result<Option<Height>, ViewError>;

    /// Live rows of `kind` in `scope`, ordered by key.
    async fn list_scope(&self, kind: &str, scope: &str) -> Result<Vec<StoredRow>, ViewError>;

    /// Live rows of `kind` across all scopes, ordered by key.
    async fn list_kind(&self, kind: &str) -> Result<Vec<StoredRow>, ViewError>;
}

// ─── Typed layer ──────────────────────────────────────────────────────────────

/// The natural key of an entity; also determines the entity's scope.
pub trait NaturalKey: Send + Sync {
    fn encode(&self) -> String;
    fn scope(&self) -> Scope;
}

/// A projected domain entity.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table name.
    const KIND: &'static str;
    type Key: NaturalKey;

    fn key(&self) -> Self::Key;
}

/// Typed save/delete/load over any [`HeightGatedStore`].
#[async_trait]
pub trait EntityStore {
    async fn save<E: Entity>(&self, entity: &E, height: Height) -> Result<WriteOutcome, ViewError>;

    async fn remove<E: Entity>(&self, key: &E::Key, height: Height) -> Result<WriteOutcome, ViewError>;

    async fn clear_scope<E: Entity>(&self, scope: &Scope, height: Height) -> Result<u64, ViewError>;

    async fn load<E: Entity>(&self, key: &E::Key) -> Result<Option<E>, ViewError>;

    async fn tombstone_height<E: Entity>(&self, key: &E::Key) -> Result<Option<Height>, ViewError>;

    async fn load_scope<E: Entity>(&self, scope: &Scope) -> Result<Vec<E>, ViewError>;

    async fn count_scope<E: Entity>(&self, scope: &Scope) -> Result<usize, ViewError>;

    async fn load_all<E: Entity>(&self) -> Result<Vec<E>, ViewError>;
}

#[async_trait]
impl<S: HeightGatedStore + ?Sized> EntityStore for S {
    async fn save<E: Entity>(&self, entity: &E, height: Height) -> Result<WriteOutcome, ViewError> {
        let key = entity.key();
        let row = StoredRow {
            kind: E::KIND.to_string(),
            key: key.encode(),
            scope: key.scope().to_string(),
            height,
            deleted: false,
            payload: serde_json::to_value(entity)?,
        };
        self.upsert(&row).await
    }

    async fn remove<E: Entity>(&self, key: &E::Key, height: Height) -> Result<WriteOutcome, ViewError> {
        let scope = key.scope();
        self.delete(E::KIND, &key.encode(), scope.as_str(), height).await
    }

    async fn clear_scope<E: Entity>(&self, scope: &Scope, height: Height) -> Result<u64, ViewError> {
        self.delete_scope(E::KIND, scope.as_str(), height).await
    }

    async fn load<E: Entity>(&self, key: &E::Key) -> Result<Option<E>, ViewError> {
        match self.get(E::KIND, &key.encode()).await? {
            Some(row) => Ok(Some(decode_row(row)?)),
            None => Ok(None),
        }
    }

    async fn tombstone_height<E: Entity>(&self, key: &E::Key) -> Result<Option<Height>, ViewError> {
        self.deleted_at(E::KIND, &key.encode()).await
    }

    async fn load_scope<E: Entity>(&self, scope: &Scope) -> Result<Vec<E>, ViewError> {
        self.list_scope(E::KIND, scope.as_str())
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    async fn count_scope<E: Entity>(&self, scope: &Scope) -> Result<usize, ViewError> {
        Ok(self.list_scope(E::KIND, scope.as_str()).await?.len())
    }

    async fn load_all<E: Entity>(&self) -> Result<Vec<E>, ViewError> {
        self.list_kind(E::KIND)
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }
}

fn decode_row<E: Entity>(row: StoredRow) -> Result<E, ViewError> {
    serde_json::from_value(row.payload)
        .map_err(|e| ViewError::Decode(format!("{} row '{}': {e}", row.kind, row.key)))
}
