//! chainview-core — the module dispatch and reconciliation engine behind ChainView.
//!
//! # Architecture
//!
//! ```text
//! ingestion driver ──► ModuleRegistry ──► message / tx / block / genesis handlers
//!                          │                        │
//!                          │                        ▼
//!                          │               HeightGatedStore (conditional upsert)
//!                          │                        ▲
//!                          ▼                        │
//!                      Scheduler ──► Reconcilers ───┤ (paged full refresh from ChainQuery)
//!                          │                        │
//!                          └──► EnrichmentBatcher ──┘ (rate-limited external providers)
//! ```
//!
//! Every write goes through the height gate: a row for a natural key only
//! moves forward in height, so live handlers, authz-wrapped messages and
//! reconciliation sweeps can race on the same key without regressing it.

pub mod chain;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod message;
pub mod module;
pub mod pagination;
pub mod reconcile;
pub mod registry;
pub mod replay;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{ChainQuery, MemoryChain, QueryRequest, TagPredicate, TimeoutQuery, TxRef};
pub use config::{ConfigBuilder, LogConfig, StoreBackend, ViewConfig};
pub use enrichment::{EnrichmentBatcher, EnrichmentProvider, EnrichmentSink, EnrichmentSummary, RateLimit};
pub use error::ViewError;
pub use message::{Message, RawMsg};
pub use module::{
    BlockHandler, Capability, GenesisHandler, MessageHandler, ModuleDescriptor, ModuleRegistration,
    PeriodicOperations, TransactionHandler,
};
pub use pagination::{collect_pages, Page, PageCursor};
pub use reconcile::{refresh_scope, CompositeReconciler, ReconcileReport, Reconciler, RefreshMode};
pub use registry::ModuleRegistry;
pub use replay::ReplaySummary;
pub use scheduler::{Job, PeriodicJob, Scheduler};
pub use store::{Entity, EntityStore, HeightGatedStore, NaturalKey, Scope, StoredRow, WriteOutcome};
pub use types::{Block, BlockResults, BlockUnit, Event, GenesisDoc, Height, Tx, Validator};
