//! Module registry and dispatcher.
//!
//! Modules are registered explicitly, in order. Each dispatch walks the
//! handlers of one capability in registration order and stops at the first
//! error, which is returned to the ingestion driver tagged with the failing
//! module's name. The registry never retries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chain::ChainQuery;
use crate::error::ViewError;
use crate::message::{flatten, RawMsg};
use crate::module::{
    BlockHandler, GenesisHandler, MessageHandler, ModuleDescriptor, ModuleRegistration,
    PeriodicOperations, TransactionHandler,
};
use crate::reconcile::{ReconcileReport, Reconciler, ScopeLocks};
use crate::scheduler::Scheduler;
use crate::store::Scope;
use crate::types::{AppState, Block, BlockResults, BlockUnit, GenesisDoc, Height, Tx, Validator};

struct Named<T: ?Sized> {
    module: String,
    handler: Arc<T>,
}

/// Registry of every module plus its typed dispatch lists.
pub struct ModuleRegistry {
    descriptors: Vec<ModuleDescriptor>,
    message_handlers: Vec<Named<dyn MessageHandler>>,
    tx_handlers: Vec<Named<dyn TransactionHandler>>,
    block_handlers: Vec<Named<dyn BlockHandler>>,
    genesis_handlers: Vec<Named<dyn GenesisHandler>>,
    periodic: Vec<Named<dyn PeriodicOperations>>,
    reconcilers: Vec<Named<dyn Reconciler>>,
    genesis_done: AtomicBool,
    /// Height of the first dispatched block plus one; 0 while none was seen.
    first_block: AtomicU64,
    scope_locks: ScopeLocks,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: vec![],
            message_handlers: vec![],
            tx_handlers: vec![],
            block_handlers: vec![],
            genesis_handlers: vec![],
            periodic: vec![],
            reconcilers: vec![],
            genesis_done: AtomicBool::new(false),
            first_block: AtomicU64::new(0),
            scope_locks: ScopeLocks::default(),
        }
    }

    /// Append a module. Duplicate names are allowed but logged.
    pub fn register(&mut self, registration: ModuleRegistration) {
        let descriptor = registration.descriptor();
        if self.descriptors.iter().any(|d| d.name == descriptor.name) {
            warn!(module = %descriptor.name, "module registered more than once");
        }
        debug!(
            module = %descriptor.name,
            capabilities = ?descriptor.capabilities,
            "registering module"
        );

        let ModuleRegistration {
            name,
            message,
            transaction,
            block,
            genesis,
            periodic,
            reconciler,
        } = registration;

        fn push<T: ?Sized>(list: &mut Vec<Named<T>>, module: &str, handler: Option<Arc<T>>) {
            if let Some(handler) = handler {
                list.push(Named {
                    module: module.to_string(),
                    handler,
                });
            }
        }
        push(&mut self.message_handlers, &name, message);
        push(&mut self.tx_handlers, &name, transaction);
        push(&mut self.block_handlers, &name, block);
        push(&mut self.genesis_handlers, &name, genesis);
        push(&mut self.periodic, &name, periodic);
        push(&mut self.reconcilers, &name, reconciler);

        self.descriptors.push(descriptor);
    }

    /// Every registered module, in registration order.
    pub fn descriptors(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    // ─── Dispatch ─────────────────────────────────────────────────────────────

    pub async fn dispatch_block(
        &self,
        block: &Block,
        results: &BlockResults,
        txs: &[Tx],
        validators: &[Validator],
    ) -> Result<(), ViewError> {
        let _ = self
            .first_block
            .compare_exchange(0, block.height.saturating_add(1), Ordering::SeqCst, Ordering::SeqCst);
        for named in &self.block_handlers {
            debug!(height = block.height, module = %named.module, "dispatching block");
            named
                .handler
                .handle_block(block, results, txs, validators)
                .await
                .map_err(|e| ViewError::handler(&named.module, e))?;
        }
        Ok(())
    }

    /// Run transaction handlers. Failed transactions are skipped.
    pub async fn dispatch_tx(&self, tx: &Tx) -> Result<(), ViewError> {
        if !tx.successful() {
            debug!(tx = %tx.hash, height = tx.height, "skipping failed transaction");
            return Ok(());
        }
        for named in &self.tx_handlers {
            debug!(tx = %tx.hash, height = tx.height, module = %named.module, "dispatching tx");
            named
                .handler
                .handle_tx(tx)
                .await
                .map_err(|e| ViewError::handler(&named.module, e))?;
        }
        Ok(())
    }

    /// Run message handlers for a single (already unwrapped) message.
    pub async fn dispatch_msg(&self, index: usize, msg: &RawMsg, tx: &Tx) -> Result<(), ViewError> {
        if !tx.successful() {
            return Ok(());
        }
        for named in &self.message_handlers {
            debug!(
                tx = %tx.hash,
                height = tx.height,
                index,
                type_url = %msg.type_url,
                module = %named.module,
                "dispatching message"
            );
            named
                .handler
                .handle_msg(index, msg, tx)
                .await
                .map_err(|e| ViewError::handler(&named.module, e))?;
        }
        Ok(())
    }

    /// Run message handlers for every message of `tx`, unwrapping
    /// "execute as" envelopes recursively. Failed transactions are skipped.
    pub async fn dispatch_tx_msgs(&self, tx: &Tx) -> Result<(), ViewError> {
        if !tx.successful() {
            debug!(tx = %tx.hash, height = tx.height, "skipping messages of failed transaction");
            return Ok(());
        }
        for (index, msg) in flatten(&tx.messages) {
            self.dispatch_msg(index, msg, tx).await?;
        }
        Ok(())
    }

    /// Block handlers, then every transaction's tx and message handlers.
    pub async fn dispatch_unit(&self, unit: &BlockUnit) -> Result<(), ViewError> {
        self.dispatch_block(&unit.block, &unit.results, &unit.txs, &unit.validators)
            .await?;
        for tx in &unit.txs {
            self.dispatch_tx(tx).await?;
            self.dispatch_tx_msgs(tx).await?;
        }
        Ok(())
    }

    /// Run genesis handlers. Accepted once and only before any block; a
    /// failed run may be retried.
    pub async fn dispatch_genesis(&self, doc: &GenesisDoc, app_state: &AppState) -> Result<(), ViewError> {
        let first_block = self.first_block.load(Ordering::SeqCst);
        if first_block > 0 {
            return Err(ViewError::GenesisAfterBlocks {
                height: first_block - 1,
            });
        }
        if self
            .genesis_done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ViewError::GenesisAlreadyHandled);
        }

        info!(chain_id = %doc.chain_id, initial_height = doc.initial_height, "dispatching genesis");
        for named in &self.genesis_handlers {
            if let Err(e) = named.handler.handle_genesis(doc, app_state).await {
                self.genesis_done.store(false, Ordering::SeqCst);
                return Err(ViewError::handler(&named.module, e));
            }
        }
        Ok(())
    }

    // ─── Reconciliation ───────────────────────────────────────────────────────

    /// Reconcile one scope of one module at `height`.
    pub async fn reconcile(
        &self,
        module: &str,
        scope: &Scope,
        height: Height,
    ) -> Result<ReconcileReport, ViewError> {
        let named = self
            .reconcilers
            .iter()
            .find(|n| n.module == module)
            .ok_or_else(|| ViewError::UnknownModule(module.to_string()))?;
        self.reconcile_with(named, scope, height).await
    }

    /// Every scope of `module` at `height`.
    pub async fn reconcile_module(&self, module: &str, height: Height) -> Result<Vec<ReconcileReport>, ViewError> {
        let named = self
            .reconcilers
            .iter()
            .find(|n| n.module == module)
            .ok_or_else(|| ViewError::UnknownModule(module.to_string()))?;
        self.reconcile_scopes(named, height).await
    }

    /// Full resync: every scope of every reconciler, in registration order.
    pub async fn reconcile_all(&self, height: Height) -> Result<Vec<ReconcileReport>, ViewError> {
        let mut reports = vec![];
        for named in &self.reconcilers {
            reports.extend(self.reconcile_scopes(named, height).await?);
        }
        Ok(reports)
    }

    /// Reconcile `modules` (every reconcilable module when empty) at the
    /// chain's current height, asked from `chain` on every call.
    pub async fn reconcile_latest<Q>(&self, chain: &Q, modules: &[String]) -> Result<Vec<ReconcileReport>, ViewError>
    where
        Q: ChainQuery + ?Sized,
    {
        let height = chain.latest_height().await?;
        if height == 0 {
            return Err(ViewError::NotFound("latest chain height".into()));
        }
        if modules.is_empty() {
            return self.reconcile_all(height).await;
        }
        let mut reports = vec![];
        for module in modules {
            reports.extend(self.reconcile_module(module, height).await?);
        }
        Ok(reports)
    }

    async fn reconcile_scopes(
        &self,
        named: &Named<dyn Reconciler>,
        height: Height,
    ) -> Result<Vec<ReconcileReport>, ViewError> {
        let scopes = named
            .handler
            .scopes(height)
            .await
            .map_err(|e| ViewError::handler(&named.module, e))?;
        let mut reports = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            reports.push(self.reconcile_with(named, scope, height).await?);
        }
        Ok(reports)
    }

    async fn reconcile_with(
        &self,
        named: &Named<dyn Reconciler>,
        scope: &Scope,
        height: Height,
    ) -> Result<ReconcileReport, ViewError> {
        let _guard = self.scope_locks.acquire(&named.module, scope).await;
        let report = named
            .handler
            .reconcile(scope, height)
            .await
            .map_err(|e| ViewError::handler(&named.module, e))?;
        info!(
            module = %named.module,
            scope = %scope,
            height,
            fetched = report.fetched,
            applied = report.applied,
            stale = report.stale,
            cleared = report.cleared,
            "reconciled"
        );
        Ok(report)
    }

    /// Names of modules that can be reconciled.
    pub fn reconcilable(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.reconcilers
            .iter()
            .map(|n| n.module.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    // ─── Periodic ─────────────────────────────────────────────────────────────

    /// Hand every module's periodic jobs to `scheduler`. Returns the job count.
    pub async fn schedule_periodic(&self, scheduler: &mut Scheduler) -> Result<usize, ViewError> {
        let mut count = 0;
        for named in &self.periodic {
            for mut job in named.handler.periodic_jobs() {
                if !job.name.contains(':') {
                    job.name = format!("{}:{}", named.module, job.name);
                }
                scheduler.schedule(job).await?;
                count += 1;
            }
        }
        Ok(count)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::message::Message;
    use crate::module::Capability;
    use crate::scheduler::Job;
    use crate::types::TxLog;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: log.clone(),
                fail,
            })
        }

        fn push(&self, entry: String) -> Result<(), ViewError> {
            self.log.lock().unwrap().push(entry);
            if self.fail {
                Err(ViewError::Storage("constraint violation".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_msg(&self, index: usize, msg: &RawMsg, _tx: &Tx) -> Result<(), ViewError> {
            self.push(format!("{}:msg:{index}:{}", self.name, msg.type_url))
        }
    }

    #[async_trait]
    impl TransactionHandler for Recorder {
        async fn handle_tx(&self, tx: &Tx) -> Result<(), ViewError> {
            self.push(format!("{}:tx:{}", self.name, tx.hash))
        }
    }

    #[async_trait]
    impl BlockHandler for Recorder {
        async fn handle_block(
            &self,
            block: &Block,
            _results: &BlockResults,
            _txs: &[Tx],
            _validators: &[Validator],
        ) -> Result<(), ViewError> {
            self.push(format!("{}:block:{}", self.name, block.height))
        }
    }

    #[async_trait]
    impl GenesisHandler for Recorder {
        async fn handle_genesis(&self, doc: &GenesisDoc, _state: &AppState) -> Result<(), ViewError> {
            self.push(format!("{}:genesis:{}", self.name, doc.chain_id))
        }
    }

    fn module(name: &'static str, log: &Log, fail: bool) -> ModuleRegistration {
        let recorder = Recorder::new(name, log, fail);
        ModuleRegistration::new(name)
            .with_message_handler(recorder.clone())
            .with_transaction_handler(recorder.clone())
            .with_block_handler(recorder.clone())
            .with_genesis_handler(recorder)
    }

    fn block(height: Height) -> Block {
        Block {
            height,
            hash: format!("B{height}"),
            timestamp: Utc::now(),
            proposer: "val1".into(),
            tx_count: 0,
        }
    }

    fn tx(hash: &str, messages: Vec<Message>, ok: bool) -> Tx {
        let logs = if ok {
            (0..messages.len())
                .map(|i| TxLog {
                    msg_index: i,
                    events: vec![],
                })
                .collect()
        } else {
            vec![]
        };
        Tx {
            hash: hash.into(),
            height: 10,
            timestamp: Utc::now(),
            messages,
            logs,
            events: vec![],
        }
    }

    fn plain(type_url: &str) -> Message {
        Message::Plain(RawMsg::new(type_url, serde_json::json!({})))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn dispatch_stops_at_first_error() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("a", &log, false));
        registry.register(module("b", &log, true));
        registry.register(module("c", &log, false));

        let err = registry
            .dispatch_block(&block(5), &BlockResults::default(), &[], &[])
            .await
            .unwrap_err();

        assert!(matches!(&err, ViewError::Handler { module, .. } if module == "b"));
        assert!(err.is_retryable());
        assert_eq!(entries(&log), vec!["a:block:5", "b:block:5"]);
    }

    #[tokio::test]
    async fn failed_transactions_are_not_dispatched() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("posts", &log, false));

        let failed = tx("DEAD", vec![plain("/posts.MsgCreatePost")], false);
        registry.dispatch_tx(&failed).await.unwrap();
        registry.dispatch_tx_msgs(&failed).await.unwrap();
        registry
            .dispatch_msg(0, &RawMsg::new("/posts.MsgCreatePost", serde_json::json!({})), &failed)
            .await
            .unwrap();

        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn envelopes_are_unwrapped_with_outer_index() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("m", &log, false));

        let envelope = Message::Delegated {
            grantee: "desmos1grantee".into(),
            msgs: vec![
                plain("/inner.A"),
                Message::Delegated {
                    grantee: "desmos1other".into(),
                    msgs: vec![plain("/inner.B")],
                },
            ],
        };
        let t = tx("CAFE", vec![plain("/outer.First"), envelope], true);
        registry.dispatch_tx_msgs(&t).await.unwrap();

        assert_eq!(
            entries(&log),
            vec!["m:msg:0:/outer.First", "m:msg:1:/inner.A", "m:msg:1:/inner.B"]
        );
    }

    #[tokio::test]
    async fn unit_runs_blocks_then_txs_in_order() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("a", &log, false));
        registry.register(ModuleRegistration::new("blocks-only").with_block_handler(Recorder::new("z", &log, false)));

        let unit = BlockUnit {
            block: block(7),
            results: BlockResults::default(),
            txs: vec![
                tx("T1", vec![plain("/x.Msg")], true),
                tx("T2", vec![plain("/x.Msg")], false),
            ],
            validators: vec![],
        };
        registry.dispatch_unit(&unit).await.unwrap();

        assert_eq!(
            entries(&log),
            vec!["a:block:7", "z:block:7", "a:tx:T1", "a:msg:0:/x.Msg"]
        );
    }

    #[tokio::test]
    async fn genesis_runs_once() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("a", &log, false));

        let doc = GenesisDoc {
            chain_id: "desmos-mainnet".into(),
            initial_height: 1,
            genesis_time: Utc::now(),
        };
        registry.dispatch_genesis(&doc, &AppState::new()).await.unwrap();
        let second = registry.dispatch_genesis(&doc, &AppState::new()).await;

        assert!(matches!(second, Err(ViewError::GenesisAlreadyHandled)));
        assert_eq!(entries(&log), vec!["a:genesis:desmos-mainnet"]);
    }

    #[tokio::test]
    async fn genesis_is_rejected_after_a_block() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("a", &log, false));

        registry
            .dispatch_block(&block(3), &BlockResults::default(), &[], &[])
            .await
            .unwrap();
        let doc = GenesisDoc {
            chain_id: "desmos-mainnet".into(),
            initial_height: 1,
            genesis_time: Utc::now(),
        };
        let err = registry.dispatch_genesis(&doc, &AppState::new()).await.unwrap_err();

        assert!(matches!(err, ViewError::GenesisAfterBlocks { height: 3 }));
        assert_eq!(entries(&log), vec!["a:block:3"]);
    }

    #[tokio::test]
    async fn failed_genesis_can_be_retried() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("broken", &log, true));

        let doc = GenesisDoc {
            chain_id: "test".into(),
            initial_height: 1,
            genesis_time: Utc::now(),
        };
        assert!(registry.dispatch_genesis(&doc, &AppState::new()).await.is_err());
        assert!(!matches!(
            registry.dispatch_genesis(&doc, &AppState::new()).await,
            Err(ViewError::GenesisAlreadyHandled)
        ));
    }

    #[tokio::test]
    async fn descriptors_reflect_capabilities() {
        let log: Log = Default::default();
        let mut registry = ModuleRegistry::new();
        registry.register(module("a", &log, false));
        registry.register(ModuleRegistration::new("a").with_block_handler(Recorder::new("a", &log, false)));

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[0].has(Capability::GenesisHandler));
        assert_eq!(descriptors[1].capabilities, vec![Capability::BlockHandler]);
    }

    struct Sweeper(Arc<AtomicU32>);

    impl PeriodicOperations for Sweeper {
        fn periodic_jobs(&self) -> Vec<Job> {
            let count = self.0.clone();
            vec![Job::from_fn("sweep", Duration::from_secs(60), move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), ViewError>(())
                }
            })
            .run_immediately()]
        }
    }

    #[tokio::test]
    async fn periodic_jobs_are_scheduled_with_module_prefix() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = ModuleRegistry::new();
        registry.register(ModuleRegistration::new("feegrant").with_periodic_operations(Arc::new(Sweeper(count.clone()))));

        let mut scheduler = Scheduler::new();
        assert_eq!(registry.schedule_periodic(&mut scheduler).await.unwrap(), 1);
        assert_eq!(scheduler.job_names(), vec!["feegrant:sweep"]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    struct CountingReconciler(AtomicU32);

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn name(&self) -> &str {
            "profiles"
        }
        async fn scopes(&self, _height: Height) -> Result<Vec<Scope>, ViewError> {
            Ok(vec![Scope::new("a"), Scope::new("b")])
        }
        async fn reconcile(&self, scope: &Scope, height: Height) -> Result<ReconcileReport, ViewError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if scope.as_str() == "missing" {
                return Err(ViewError::NotFound("scope".into()));
            }
            Ok(ReconcileReport::new("profiles", scope, height))
        }
    }

    #[tokio::test]
    async fn reconcile_routes_by_module_name() {
        let reconciler = Arc::new(CountingReconciler(AtomicU32::new(0)));
        let mut registry = ModuleRegistry::new();
        registry.register(ModuleRegistration::new("profiles").with_reconciler(reconciler.clone()));

        let reports = registry.reconcile_all(100).await.unwrap();
        assert_eq!(reports.iter().map(|r| r.scope.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let err = registry.reconcile("profiles", &Scope::new("missing"), 100).await.unwrap_err();
        assert!(matches!(&err, ViewError::Handler { module, .. } if module == "profiles"));
        assert!(matches!(
            registry.reconcile("posts", &Scope::global(), 100).await,
            Err(ViewError::UnknownModule(_))
        ));
        assert_eq!(reconciler.0.load(Ordering::SeqCst), 3);
        assert_eq!(registry.reconcilable(), vec!["profiles"]);
    }

    #[tokio::test]
    async fn latest_reconciliation_follows_the_chain_height() {
        let chain = MemoryChain::new(10);
        let mut registry = ModuleRegistry::new();
        registry.register(
            ModuleRegistration::new("profiles").with_reconciler(Arc::new(CountingReconciler(AtomicU32::new(0)))),
        );

        assert!(registry.reconcile_latest(&chain, &[]).await.unwrap_err().is_not_found());

        chain.set_height(150);
        let first = registry.reconcile_latest(&chain, &[]).await.unwrap();
        chain.set_height(200);
        let second = registry.reconcile_latest(&chain, &["profiles".to_string()]).await.unwrap();

        assert!(first.iter().all(|r| r.height == 150));
        assert!(second.iter().all(|r| r.height == 200));
        assert_eq!(second.len(), 2);
        assert!(matches!(
            registry.reconcile_latest(&chain, &["posts".to_string()]).await,
            Err(ViewError::UnknownModule(_))
        ));
    }
}
