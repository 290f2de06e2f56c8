//! Pagination cursor — tracks the position inside a paged list query.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ViewError;

/// Opaque continuation token returned by the chain facade.
///
/// An empty cursor means "from the start" when sent and "no more pages"
/// when received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(Vec<u8>);

impl PageCursor {
    /// The cursor that requests the first page.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Cursor encoding a plain record offset (used by offset-paged facades).
    pub fn from_offset(offset: usize) -> Self {
        Self(offset.to_string().into_bytes())
    }

    /// Decode a cursor produced by [`PageCursor::from_offset`].
    pub fn offset(&self) -> Result<usize, ViewError> {
        if self.0.is_empty() {
            return Ok(0);
        }
        std::str::from_utf8(&self.0)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ViewError::Decode("malformed offset cursor".into()))
    }

    /// Returns `true` if the facade signalled the last page.
    pub fn is_end(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next: PageCursor,
}

impl<T> Page<T> {
    /// A page with no continuation.
    pub fn last(records: Vec<T>) -> Self {
        Self {
            records,
            next: PageCursor::start(),
        }
    }
}

/// Drive `fetch` page by page until it returns an empty cursor and collect
/// every record in order.
///
/// No page ceiling is applied: a facade that never returns an empty cursor
/// keeps this loop running.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, ViewError>
where
    F: FnMut(PageCursor) -> Fut,
    Fut: Future<Output = Result<Page<T>, ViewError>>,
{
    let mut records = Vec::new();
    let mut cursor = PageCursor::start();
    let mut pages = 0u64;

    loop {
        let page = fetch(cursor).await?;
        pages += 1;
        records.extend(page.records);
        if page.next.is_end() {
            break;
        }
        cursor = page.next;
    }

    trace!(pages, records = records.len(), "pagination complete");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_cursor_roundtrip() {
        let cursor = PageCursor::from_offset(250);
        assert!(!cursor.is_end());
        assert_eq!(cursor.offset().unwrap(), 250);
        assert_eq!(PageCursor::start().offset().unwrap(), 0);
        assert!(PageCursor::new(b"\xff\xfe".to_vec()).offset().is_err());
    }

    #[tokio::test]
    async fn collects_until_empty_cursor() {
        let data: Vec<u32> = (0..7).collect();
        let mut calls = 0;
        let all = collect_pages(|cursor| {
            calls += 1;
            let data = data.clone();
            async move {
                let start = cursor.offset()?;
                let end = (start + 3).min(data.len());
                let next = if end < data.len() {
                    PageCursor::from_offset(end)
                } else {
                    PageCursor::start()
                };
                Ok(Page {
                    records: data[start..end].to_vec(),
                    next,
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(all, data);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn page_error_aborts_collection() {
        let result: Result<Vec<u32>, _> = collect_pages(|cursor| async move {
            if cursor.is_end() {
                Ok(Page {
                    records: vec![1],
                    next: PageCursor::from_offset(1),
                })
            } else {
                Err(ViewError::Rpc("node unavailable".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ViewError::Rpc(_))));
    }
}
