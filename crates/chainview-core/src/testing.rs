//! Map-backed store used by this crate's unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ViewError;
use crate::store::{HeightGatedStore, StoredRow, WriteOutcome};
use crate::types::Height;

#[derive(Default)]
pub(crate) struct MapStore {
    rows: Mutex<BTreeMap<(String, String), StoredRow>>,
}

impl MapStore {
    pub(crate) fn raw(&self, kind: &str, key: &str) -> Option<StoredRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&(kind.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl HeightGatedStore for MapStore {
    async fn upsert(&self, row: &StoredRow) -> Result<WriteOutcome, ViewError> {
        let mut rows = self.rows.lock().unwrap();
        let id = (row.kind.clone(), row.key.clone());
        match rows.get(&id) {
            Some(stored) if stored.height > row.height => Ok(WriteOutcome::Stale),
            _ => {
                rows.insert(id, row.clone());
                Ok(WriteOutcome::Applied)
            }
        }
    }

    async fn delete(
        &self,
        kind: &str,
        key: &str,
        scope: &str,
        height: Height,
    ) -> Result<WriteOutcome, ViewError> {
        self.upsert(&StoredRow {
            kind: kind.into(),
            key: key.into(),
            scope: scope.into(),
            height,
            deleted: true,
            payload: serde_json::Value::Null,
        })
        .await
    }

    async fn delete_scope(&self, kind: &str, scope: &str, _height: Height) -> Result<u64, ViewError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(k, _), row| !(k == kind && row.scope == scope));
        Ok((before - rows.len()) as u64)
    }

    async fn get(&self, kind: &str, key: &str) -> Result<Option<StoredRow>, ViewError> {
        Ok(self.raw(kind, key).filter(|row| !row.deleted))
    }

    async fn deleted_at(&self, kind: &str, key: &str) -> Result<Option<Height>, ViewError> {
        Ok(self.raw(kind, key).filter(|row| row.deleted).map(|row| row.height))
    }

    async fn list_scope(&self, kind: &str, scope: &str) -> Result<Vec<StoredRow>, ViewError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.kind == kind && row.scope == scope && !row.deleted)
            .cloned()
            .collect())
    }

    async fn list_kind(&self, kind: &str) -> Result<Vec<StoredRow>, ViewError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.kind == kind && !row.deleted)
            .cloned()
            .collect())
    }
}
