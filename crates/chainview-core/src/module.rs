//! Module capability traits and tagged registration.
//!
//! A module implements only the capabilities it needs. Capabilities are
//! declared explicitly when the module is registered, which places each
//! handler into the registry's typed dispatch lists.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ViewError;
use crate::message::RawMsg;
use crate::reconcile::Reconciler;
use crate::scheduler::Job;
use crate::types::{AppState, Block, BlockResults, GenesisDoc, Tx, Validator};

/// Handles every (unwrapped) message of every successful transaction.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `index` is the position of the top-level message, used to find its events.
    async fn handle_msg(&self, index: usize, msg: &RawMsg, tx: &Tx) -> Result<(), ViewError>;
}

/// Handles whole transactions (event-driven rather than message-driven updates).
#[async_trait]
pub trait TransactionHandler: Send + Sync {
    async fn handle_tx(&self, tx: &Tx) -> Result<(), ViewError>;
}

/// Called once per block.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle_block(
        &self,
        block: &Block,
        results: &BlockResults,
        txs: &[Tx],
        validators: &[Validator],
    ) -> Result<(), ViewError>;
}

/// Called once, before the first block.
#[async_trait]
pub trait GenesisHandler: Send + Sync {
    async fn handle_genesis(&self, doc: &GenesisDoc, app_state: &AppState) -> Result<(), ViewError>;
}

/// Declares jobs the scheduler should run for this module.
pub trait PeriodicOperations: Send + Sync {
    fn periodic_jobs(&self) -> Vec<Job>;
}

// ─── Descriptor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    MessageHandler,
    TransactionHandler,
    BlockHandler,
    GenesisHandler,
    PeriodicOperations,
    Reconciler,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageHandler => write!(f, "messages"),
            Self::TransactionHandler => write!(f, "transactions"),
            Self::BlockHandler => write!(f, "blocks"),
            Self::GenesisHandler => write!(f, "genesis"),
            Self::PeriodicOperations => write!(f, "periodic"),
            Self::Reconciler => write!(f, "reconcile"),
        }
    }
}

/// Name plus the capability set a module was registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub capabilities: Vec<Capability>,
}

impl ModuleDescriptor {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

// ─── Registration ────────────────────────────────────────────────────────────

/// Builder handed to [`crate::ModuleRegistry::register`].
///
/// ```rust,ignore
/// let posts = Arc::new(PostsModule::new(store, chain));
/// registry.register(
///     ModuleRegistration::new("posts")
///         .with_message_handler(posts.clone())
///         .with_genesis_handler(posts.clone())
///         .with_reconciler(posts),
/// );
/// ```
pub struct ModuleRegistration {
    pub(crate) name: String,
    pub(crate) message: Option<Arc<dyn MessageHandler>>,
    pub(crate) transaction: Option<Arc<dyn TransactionHandler>>,
    pub(crate) block: Option<Arc<dyn BlockHandler>>,
    pub(crate) genesis: Option<Arc<dyn GenesisHandler>>,
    pub(crate) periodic: Option<Arc<dyn PeriodicOperations>>,
    pub(crate) reconciler: Option<Arc<dyn Reconciler>>,
}

impl ModuleRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: None,
            transaction: None,
            block: None,
            genesis: None,
            periodic: None,
            reconciler: None,
        }
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message = Some(handler);
        self
    }

    pub fn with_transaction_handler(mut self, handler: Arc<dyn TransactionHandler>) -> Self {
        self.transaction = Some(handler);
        self
    }

    pub fn with_block_handler(mut self, handler: Arc<dyn BlockHandler>) -> Self {
        self.block = Some(handler);
        self
    }

    pub fn with_genesis_handler(mut self, handler: Arc<dyn GenesisHandler>) -> Self {
        self.genesis = Some(handler);
        self
    }

    pub fn with_periodic_operations(mut self, ops: Arc<dyn PeriodicOperations>) -> Self {
        self.periodic = Some(ops);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn descriptor(&self) -> ModuleDescriptor {
        let mut capabilities = vec![];
        if self.message.is_some() {
            capabilities.push(Capability::MessageHandler);
        }
        if self.transaction.is_some() {
            capabilities.push(Capability::TransactionHandler);
        }
        if self.block.is_some() {
            capabilities.push(Capability::BlockHandler);
        }
        if self.genesis.is_some() {
            capabilities.push(Capability::GenesisHandler);
        }
        if self.periodic.is_some() {
            capabilities.push(Capability::PeriodicOperations);
        }
        if self.reconciler.is_some() {
            capabilities.push(Capability::Reconciler);
        }
        ModuleDescriptor {
            name: self.name.clone(),
            capabilities,
        }
    }
}
