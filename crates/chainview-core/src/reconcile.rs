//! Full-state reconciliation.
//!
//! A reconciler pages through the chain's authoritative state for a scope at
//! a pinned height, optionally clears the scope, and writes every record back
//! through the height gate. Anything the live handlers wrote after that
//! height survives; anything that disappeared on chain is cleared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::ViewError;
use crate::store::{Entity, EntityStore, HeightGatedStore, NaturalKey, Scope, WriteOutcome};
use crate::types::Height;

/// Whether a refresh deletes the scope before reinserting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Upsert the fetched records, leave other rows alone.
    #[default]
    Merge,
    /// Clear the scope (even if nothing was fetched), then upsert.
    Replace,
}

/// Counters produced by one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub reconciler: String,
    pub scope: String,
    pub height: Height,
    /// Records returned by the chain.
    pub fetched: usize,
    pub applied: usize,
    /// Records skipped because the stored row is newer.
    pub stale: usize,
    /// Rows removed by the scope clear.
    pub cleared: u64,
}

impl ReconcileReport {
    pub fn new(reconciler: impl Into<String>, scope: &Scope, height: Height) -> Self {
        Self {
            reconciler: reconciler.into(),
            scope: scope.to_string(),
            height,
            ..Default::default()
        }
    }

    /// Add the counters of a child run.
    pub fn absorb(&mut self, child: &ReconcileReport) {
        self.fetched += child.fetched;
        self.applied += child.applied;
        self.stale += child.stale;
        self.cleared += child.cleared;
    }

    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Applied => self.applied += 1,
            WriteOutcome::Stale => self.stale += 1,
        }
    }
}

/// Re-synchronizes one domain against the chain.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    /// Scopes to refresh during a full resync at `height`.
    async fn scopes(&self, _height: Height) -> Result<Vec<Scope>, ViewError> {
        Ok(vec![Scope::global()])
    }

    async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError>;
}

/// Write an already-fetched authoritative set for `scope` at `height`.
///
/// In [`RefreshMode::Replace`] every record must belong to `scope`, and the
/// scope is cleared first even when `records` is empty.
pub async fn refresh_scope<S, E>(
    store: &S,
    scope: &Scope,
    height: Height,
    records: Vec<E>,
    mode: RefreshMode,
) -> Result<ReconcileReport, ViewError>
where
    S: HeightGatedStore + ?Sized,
    E: Entity,
{
    let mut report = ReconcileReport::new(E::KIND, scope, height);
    report.fetched = records.len();

    if mode == RefreshMode::Replace {
        if let Some(stray) = records.iter().find(|r| r.key().scope() != *scope) {
            return Err(ViewError::Decode(format!(
                "{} '{}' does not belong to scope '{scope}'",
                E::KIND,
                stray.key().encode()
            )));
        }
        report.cleared = store.clear_scope::<E>(scope, height).await?;
    }

    for record in &records {
        let outcome = store.save(record, height).await?;
        report.record(outcome);
    }

    debug!(
        kind = E::KIND,
        scope = %scope,
        height,
        fetched = report.fetched,
        applied = report.applied,
        stale = report.stale,
        cleared = report.cleared,
        "scope refreshed"
    );
    Ok(report)
}

// ─── Composite ────────────────────────────────────────────────────────────────

/// Runs several reconcilers over the same scope, parent first.
///
/// Scopes for a full resync come from the first step.
pub struct CompositeReconciler {
    name: String,
    steps: Vec<Arc<dyn Reconciler>>,
}

impl CompositeReconciler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: vec![],
        }
    }

    pub fn then(mut self, step: Arc<dyn Reconciler>) -> Self {
        self.steps.push(step);
        self
    }
}

#[async_trait]
impl Reconciler for CompositeReconciler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scopes(&self, height: Height) -> Result<Vec<Scope>, ViewError> {
        match self.steps.first() {
            Some(parent) => parent.scopes(height).await,
            None => Ok(vec![]),
        }
    }

    async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
        let mut report = ReconcileReport::new(&self.name, scope, height);
        for step in &self.steps {
            let child = step.reconcile(scope, height).await?;
            report.absorb(&child);
        }
        info!(
            reconciler = %self.name,
            scope = %scope,
            height,
            applied = report.applied,
            stale = report.stale,
            "composite reconciliation complete"
        );
        Ok(report)
    }
}

// ─── Per-scope serialization ─────────────────────────────────────────────────

/// One async mutex per `(reconciler, scope)`; a scope is never refreshed
/// concurrently with itself. Entries live only while someone holds or waits
/// for them.
#[derive(Default)]
pub(crate) struct ScopeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScopeLocks {
    pub(crate) async fn acquire(&self, reconciler: &str, scope: &Scope) -> ScopeGuard<'_> {
        let key = format!("{reconciler}:{scope}");
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        ScopeGuard {
            locks: self,
            key,
            lock,
            guard: Some(guard),
        }
    }

    /// Scopes currently locked or waited on.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

/// Held for the duration of one scope refresh.
pub(crate) struct ScopeGuard<'a> {
    locks: &'a ScopeLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // the map and this guard are the last owners: nobody is waiting
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MapStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reaction {
        subspace: u64,
        post: u64,
        id: u32,
        value: String,
    }

    struct ReactionKey(u64, u64, u32);

    impl NaturalKey for ReactionKey {
        fn encode(&self) -> String {
            format!("{}/{}/{}", self.0, self.1, self.2)
        }
        fn scope(&self) -> Scope {
            Scope::new(format!("subspace/{}", self.0)).child("post", self.1)
        }
    }

    impl Entity for Reaction {
        const KIND: &'static str = "reaction";
        type Key = ReactionKey;
        fn key(&self) -> ReactionKey {
            ReactionKey(self.subspace, self.post, self.id)
        }
    }

    fn reaction(id: u32, value: &str) -> Reaction {
        Reaction {
            subspace: 1,
            post: 50,
            id,
            value: value.into(),
        }
    }

    fn post_scope() -> Scope {
        Scope::new("subspace/1").child("post", 50)
    }

    #[tokio::test]
    async fn replace_converges_to_chain_state() {
        let store = MapStore::default();
        for id in 1..=5 {
            store.save(&reaction(id, "👍"), 80).await.unwrap();
        }

        let chain = vec![reaction(2, "🔥"), reaction(6, "❤"), reaction(7, "😂")];
        let report = refresh_scope(&store, &post_scope(), 100, chain, RefreshMode::Replace)
            .await
            .unwrap();

        assert_eq!(report.cleared, 5);
        assert_eq!(report.applied, 3);
        let stored: Vec<Reaction> = store.load_scope(&post_scope()).await.unwrap();
        assert_eq!(stored.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 6, 7]);
        assert_eq!(stored[0].value, "🔥");
    }

    #[tokio::test]
    async fn replace_with_no_records_still_clears() {
        let store = MapStore::default();
        store.save(&reaction(1, "👍"), 10).await.unwrap();

        let report = refresh_scope::<_, Reaction>(&store, &post_scope(), 20, vec![], RefreshMode::Replace)
            .await
            .unwrap();

        assert_eq!(report.cleared, 1);
        assert_eq!(store.count_scope::<Reaction>(&post_scope()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn merge_keeps_newer_live_writes() {
        let store = MapStore::default();
        store.save(&reaction(1, "live"), 120).await.unwrap();

        let report = refresh_scope(
            &store,
            &post_scope(),
            100,
            vec![reaction(1, "snapshot"), reaction(2, "snapshot")],
            RefreshMode::Merge,
        )
        .await
        .unwrap();

        assert_eq!((report.applied, report.stale, report.cleared), (1, 1, 0));
        let kept: Option<Reaction> = store.load(&ReactionKey(1, 50, 1)).await.unwrap();
        assert_eq!(kept.unwrap().value, "live");
        assert_eq!(store.raw("reaction", "1/50/1").unwrap().height, 120);
    }

    #[tokio::test]
    async fn replace_rejects_records_from_other_scopes() {
        let store = MapStore::default();
        store.save(&reaction(1, "👍"), 10).await.unwrap();
        let mut stray = reaction(9, "x");
        stray.post = 51;

        let err = refresh_scope(&store, &post_scope(), 20, vec![stray], RefreshMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, ViewError::Decode(_)));
        // nothing was cleared
        assert_eq!(store.count_scope::<Reaction>(&post_scope()).await.unwrap(), 1);
    }

    struct Fixed {
        name: &'static str,
        applied: usize,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Reconciler for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
            self.log.lock().unwrap().push(self.name);
            let mut report = ReconcileReport::new(self.name, scope, height);
            report.applied = self.applied;
            Ok(report)
        }
    }

    #[tokio::test]
    async fn composite_runs_parent_first_and_sums() {
        let log = Arc::new(Mutex::new(vec![]));
        let composite = CompositeReconciler::new("posts")
            .then(Arc::new(Fixed { name: "post", applied: 2, log: log.clone() }))
            .then(Arc::new(Fixed { name: "reaction", applied: 5, log: log.clone() }));

        let report = composite.reconcile(&Scope::new("subspace/1"), 7).await.unwrap();
        assert_eq!(report.applied, 7);
        assert_eq!(report.reconciler, "posts");
        assert_eq!(*log.lock().unwrap(), vec!["post", "reaction"]);
        assert_eq!(composite.scopes(7).await.unwrap(), vec![Scope::global()]);
    }

    #[tokio::test]
    async fn scope_locks_serialize_same_scope() {
        let locks = Arc::new(ScopeLocks::default());
        let scope = Scope::new("subspace/1");
        let guard = locks.acquire("posts", &scope).await;

        let other = locks.clone();
        let s = scope.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("posts", &s).await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // a different scope is not blocked
        let _free = locks.acquire("posts", &Scope::new("subspace/2")).await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn scope_locks_are_released_with_their_last_holder() {
        let locks = Arc::new(ScopeLocks::default());
        for post in 0..50 {
            let _g = locks.acquire("posts", &Scope::new(format!("subspace/1/post/{post}"))).await;
        }
        assert_eq!(locks.len(), 0);

        let scope = Scope::new("subspace/1");
        let guard = locks.acquire("posts", &scope).await;
        let other = locks.clone();
        let s = scope.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("posts", &s).await;
        });
        tokio::task::yield_now().await;

        // the waiter still needs the entry
        drop(guard);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
