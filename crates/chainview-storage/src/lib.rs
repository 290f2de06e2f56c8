//! chainview-storage — height-gated store backends for ChainView.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `sqlite` — SQLite via `sqlx` (feature `sqlite`)
//! - `postgres` — PostgreSQL via `sqlx` (feature `postgres`)
//!
//! All of them persist a single table keyed by `(kind, natural_key)` and
//! implement [`chainview_core::HeightGatedStore`] with one conditional
//! statement per write.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
pub(crate) mod contract;

pub use memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStore};
