//! Re-dispatch of historic transactions.
//!
//! Some domains cannot be rebuilt from a point-in-time query; for those the
//! resync path searches the chain for every transaction carrying a tag and
//! feeds each one through the registry again. Replayed writes go through the
//! height gate like live ones, so replay is idempotent.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::chain::{ChainQuery, TagPredicate};
use crate::error::ViewError;
use crate::registry::ModuleRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Distinct transactions returned by the search.
    pub found: usize,
    pub dispatched: usize,
    /// Transactions the chain reported as failed.
    pub skipped: usize,
}

impl ModuleRegistry {
    /// Fetch every transaction matching `predicate`, oldest first, and run
    /// it through the transaction and message handlers.
    ///
    /// The first handler error aborts the replay.
    pub async fn replay_txs<Q>(&self, chain: &Q, predicate: &TagPredicate) -> Result<ReplaySummary, ViewError>
    where
        Q: ChainQuery + ?Sized,
    {
        let mut refs = chain.search_txs(predicate).await?;
        refs.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.hash.cmp(&b.hash)));

        let mut seen = HashSet::new();
        refs.retain(|r| seen.insert(r.hash.clone()));

        let mut summary = ReplaySummary {
            found: refs.len(),
            ..Default::default()
        };
        info!(query = %predicate.to_query_string(), found = summary.found, "replaying transactions");

        for tx_ref in &refs {
            let tx = chain.fetch_tx(&tx_ref.hash).await?;
            if !tx.successful() {
                warn!(tx = %tx.hash, height = tx.height, "search returned a failed transaction");
                summary.skipped += 1;
                continue;
            }
            self.dispatch_tx(&tx).await?;
            self.dispatch_tx_msgs(&tx).await?;
            summary.dispatched += 1;
        }
        Ok(summary)
    }
}
