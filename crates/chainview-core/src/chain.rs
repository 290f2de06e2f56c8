//! Chain query facade — the remote, height-addressable view of chain state.
//!
//! The wire protocol behind it is not modelled here; implementations adapt
//! whatever RPC layer the deployment uses. [`MemoryChain`] is a snapshot-backed
//! implementation used by tests and by offline `resync` runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ViewError;
use crate::pagination::{collect_pages, Page, PageCursor};
use crate::types::{Height, Tx};

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A point or list query: a path plus optional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub path: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl QueryRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stable string form (`/posts?post_id=42&subspace_id=1`), used as a lookup key.
    pub fn canonical(&self) -> String {
        if self.params.is_empty() {
            return self.path.clone();
        }
        let mut pairs: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect();
        pairs.sort();
        format!("{}?{}", self.path, pairs.join("&"))
    }
}

/// Conjunction of `key='value'` tag conditions for transaction search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPredicate {
    pub conditions: Vec<(String, String)>,
}

impl TagPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    /// Parse `message.action=/posts.MsgCreatePost` style arguments.
    pub fn parse(expr: &str) -> Result<Self, ViewError> {
        let mut predicate = Self::new();
        for part in expr.split(" AND ") {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ViewError::Config(format!("tag condition '{part}' is not key=value"))
            })?;
            predicate = predicate.and(key.trim(), value.trim().trim_matches('\''));
        }
        Ok(predicate)
    }

    /// `message.action='x' AND message.sender='y'`
    pub fn to_query_string(&self) -> String {
        self.conditions
            .iter()
            .map(|(k, v)| format!("{k}='{v}'"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Returns `true` if every condition appears in `tags`.
    pub fn matches(&self, tags: &[(String, String)]) -> bool {
        self.conditions.iter().all(|cond| tags.contains(cond))
    }
}

/// A search hit: enough to fetch and order the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub hash: String,
    pub height: Height,
}

// ─── Facade trait ─────────────────────────────────────────────────────────────

/// Height-addressable access to chain state. Height `0` means "latest".
#[async_trait]
pub trait ChainQuery: Send + Sync {
    async fn point(&self, height: Height, request: &QueryRequest) -> Result<Value, ViewError>;

    async fn list(
        &self,
        height: Height,
        request: &QueryRequest,
        cursor: &PageCursor,
    ) -> Result<Page<Value>, ViewError>;

    async fn search_txs(&self, predicate: &TagPredicate) -> Result<Vec<TxRef>, ViewError>;

    async fn fetch_tx(&self, hash: &str) -> Result<Tx, ViewError>;

    /// Current height of the chain.
    async fn latest_height(&self) -> Result<Height, ViewError>;
}

/// Point query decoded into `T`.
pub async fn point_as<T, Q>(
    chain: &Q,
    height: Height,
    request: &QueryRequest,
) -> Result<T, ViewError>
where
    T: DeserializeOwned,
    Q: ChainQuery + ?Sized,
{
    let value = chain.point(height, request).await?;
    serde_json::from_value(value)
        .map_err(|e| ViewError::Decode(format!("{}: {e}", request.canonical())))
}

/// Every page of a list query, decoded into `T`.
pub async fn list_all<T, Q>(
    chain: &Q,
    height: Height,
    request: &QueryRequest,
) -> Result<Vec<T>, ViewError>
where
    T: DeserializeOwned,
    Q: ChainQuery + ?Sized,
{
    let values = collect_pages(|cursor| async move { chain.list(height, request, &cursor).await })
        .await?;
    values
        .into_iter()
        .map(|v| {
            serde_json::from_value(v)
                .map_err(|e| ViewError::Decode(format!("{}: {e}", request.canonical())))
        })
        .collect()
}

// ─── Per-call deadline ────────────────────────────────────────────────────────

/// Applies a deadline to every individual facade call.
pub struct TimeoutQuery<Q> {
    inner: Q,
    timeout: Duration,
}

impl<Q: ChainQuery> TimeoutQuery<Q> {
    pub fn new(inner: Q, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ViewError>>,
    ) -> Result<T, ViewError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ViewError::Timeout {
                ms: self.timeout.as_millis() as u64,
            })?
    }
}

#[async_trait]
impl<Q: ChainQuery> ChainQuery for TimeoutQuery<Q> {
    async fn point(&self, height: Height, request: &QueryRequest) -> Result<Value, ViewError> {
        self.bounded(self.inner.point(height, request)).await
    }

    async fn list(
        &self,
        height: Height,
        request: &QueryRequest,
        cursor: &PageCursor,
    ) -> Result<Page<Value>, ViewError> {
        self.bounded(self.inner.list(height, request, cursor)).await
    }

    async fn search_txs(&self, predicate: &TagPredicate) -> Result<Vec<TxRef>, ViewError> {
        self.bounded(self.inner.search_txs(predicate)).await
    }

    async fn fetch_tx(&self, hash: &str) -> Result<Tx, ViewError> {
        self.bounded(self.inner.fetch_tx(hash)).await
    }

    async fn latest_height(&self) -> Result<Height, ViewError> {
        self.bounded(self.inner.latest_height()).await
    }
}

// ─── Snapshot-backed facade ───────────────────────────────────────────────────

/// A transaction plus the tags it is searchable by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedTx {
    pub tx: Tx,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

/// Serialized form of a [`MemoryChain`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSnapshot {
    /// Canonical request → single value.
    #[serde(default)]
    pub points: HashMap<String, Value>,
    /// Canonical request → full record list.
    #[serde(default)]
    pub lists: HashMap<String, Vec<Value>>,
    #[serde(default)]
    pub txs: Vec<IndexedTx>,
    /// Height the snapshot was taken at; 0 falls back to the highest tx.
    #[serde(default)]
    pub height: Height,
}

/// In-memory chain facade. Heights are ignored: the snapshot is "latest".
pub struct MemoryChain {
    snapshot: Mutex<ChainSnapshot>,
    page_size: usize,
    calls: Mutex<Vec<String>>,
}

impl MemoryChain {
    pub fn new(page_size: usize) -> Self {
        Self::from_snapshot(ChainSnapshot::default(), page_size)
    }

    pub fn from_snapshot(snapshot: ChainSnapshot, page_size: usize) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            page_size: page_size.max(1),
            calls: Mutex::new(vec![]),
        }
    }

    /// Load a JSON snapshot file.
    pub fn from_file(path: impl AsRef<Path>, page_size: usize) -> Result<Self, ViewError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ViewError::Config(format!("read {}: {e}", path.display())))?;
        let snapshot: ChainSnapshot = serde_json::from_str(&raw)?;
        Ok(Self::from_snapshot(snapshot, page_size))
    }

    pub fn set_point(&self, request: &QueryRequest, value: Value) {
        self.snapshot
            .lock()
            .unwrap()
            .points
            .insert(request.canonical(), value);
    }

    pub fn remove_point(&self, request: &QueryRequest) {
        self.snapshot.lock().unwrap().points.remove(&request.canonical());
    }

    pub fn set_list(&self, request: &QueryRequest, records: Vec<Value>) {
        self.snapshot
            .lock()
            .unwrap()
            .lists
            .insert(request.canonical(), records);
    }

    pub fn set_height(&self, height: Height) {
        self.snapshot.lock().unwrap().height = height;
    }

    pub fn add_tx(&self, tx: Tx, tags: Vec<(String, String)>) {
        self.snapshot.lock().unwrap().txs.push(IndexedTx { tx, tags });
    }

    /// Canonical requests served so far, in order (list pages included).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChainQuery for MemoryChain {
    async fn point(&self, _height: Height, request: &QueryRequest) -> Result<Value, ViewError> {
        let key = request.canonical();
        self.record(key.clone());
        self.snapshot
            .lock()
            .unwrap()
            .points
            .get(&key)
            .cloned()
            .ok_or(ViewError::NotFound(key))
    }

    async fn list(
        &self,
        _height: Height,
        request: &QueryRequest,
        cursor: &PageCursor,
    ) -> Result<Page<Value>, ViewError> {
        let key = request.canonical();
        self.record(key.clone());
        let start = cursor.offset()?;
        let snapshot = self.snapshot.lock().unwrap();
        let all = snapshot.lists.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let start = start.min(all.len());
        let end = (start + self.page_size).min(all.len());
        let next = if end < all.len() {
            PageCursor::from_offset(end)
        } else {
            PageCursor::start()
        };
        Ok(Page {
            records: all[start..end].to_vec(),
            next,
        })
    }

    async fn search_txs(&self, predicate: &TagPredicate) -> Result<Vec<TxRef>, ViewError> {
        self.record(format!("search:{}", predicate.to_query_string()));
        Ok(self
            .snapshot
            .lock()
            .unwrap()
            .txs
            .iter()
            .filter(|indexed| predicate.matches(&indexed.tags))
            .map(|indexed| TxRef {
                hash: indexed.tx.hash.clone(),
                height: indexed.tx.height,
            })
            .collect())
    }

    async fn fetch_tx(&self, hash: &str) -> Result<Tx, ViewError> {
        self.record(format!("tx:{hash}"));
        self.snapshot
            .lock()
            .unwrap()
            .txs
            .iter()
            .find(|indexed| indexed.tx.hash == hash)
            .map(|indexed| indexed.tx.clone())
            .ok_or_else(|| ViewError::NotFound(format!("tx {hash}")))
    }

    async fn latest_height(&self) -> Result<Height, ViewError> {
        let snapshot = self.snapshot.lock().unwrap();
        if snapshot.height > 0 {
            return Ok(snapshot.height);
        }
        Ok(snapshot.txs.iter().map(|indexed| indexed.tx.height).max().unwrap_or(0))
    }
}
