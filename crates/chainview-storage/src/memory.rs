//! In-memory height-gated store.
//!
//! Rows live in a `BTreeMap` behind a mutex; the height check and the write
//! happen under the same lock, which gives the same atomicity as the SQL
//! conditional upsert. All data is lost when the process exits.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::trace;

use chainview_core::error::ViewError;
use chainview_core::store::{HeightGatedStore, StoredRow, WriteOutcome};
use chainview_core::types::Height;

#[derive(Default)]
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<(String, String), StoredRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, tombstones included.
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// The stored row for `(kind, key)`, tombstone or not.
    pub fn raw(&self, kind: &str, key: &str) -> Option<StoredRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&(kind.to_string(), key.to_string()))
            .cloned()
    }

    fn write(&self, row: StoredRow) -> WriteOutcome {
        let mut rows = self.rows.lock().unwrap();
        let id = (row.kind.clone(), row.key.clone());
        if let Some(stored) = rows.get(&id) {
            if stored.height > row.height {
                trace!(kind = %row.kind, key = %row.key, stored = stored.height, incoming = row.height, "stale write");
                return WriteOutcome::Stale;
            }
        }
        rows.insert(id, row);
        WriteOutcome::Applied
    }

    fn live(&self, filter: impl Fn(&StoredRow) -> bool) -> Vec<StoredRow> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| !row.deleted && filter(row))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HeightGatedStore for InMemoryStore {
    async fn upsert(&self, row: &StoredRow) -> Result<WriteOutcome, ViewError> {
        Ok(self.write(row.clone()))
    }

    async fn delete(
        &self,
        kind: &str,
        key: &str,
        scope: &str,
        height: Height,
    ) -> Result<WriteOutcome, ViewError> {
        Ok(self.write(StoredRow {
            kind: kind.to_string(),
            key: key.to_string(),
            scope: scope.to_string(),
            height,
            deleted: true,
            payload: serde_json::Value::Null,
        }))
    }

    async fn delete_scope(&self, kind: &str, scope: &str, height: Height) -> Result<u64, ViewError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(k, _), row| !(k == kind && row.scope == scope));
        let removed = (before - rows.len()) as u64;
        trace!(kind, scope, height, removed, "scope cleared");
        Ok(removed)
    }

    async fn get(&self, kind: &str, key: &str) -> Result<Option<StoredRow>, ViewError> {
        Ok(self.raw(kind, key).filter(|row| !row.deleted))
    }

    async fn deleted_at(&self, kind: &str, key: &str) -> Result<Option<Height>, ViewError> {
        Ok(self.raw(kind, key).filter(|row| row.deleted).map(|row| row.height))
    }

    async fn list_scope(&self, kind: &str, scope: &str) -> Result<Vec<StoredRow>, ViewError> {
        Ok(self.live(|row| row.kind == kind && row.scope == scope))
    }

    async fn list_kind(&self, kind: &str) -> Result<Vec<StoredRow>, ViewError> {
        Ok(self.live(|row| row.kind == kind))
    }
}
