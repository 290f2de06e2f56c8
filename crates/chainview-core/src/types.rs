//! Shared types for the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ViewError;
use crate::message::Message;

/// Block number of the source chain; the version of every derived row.
pub type Height = u64;

// ─── Block ────────────────────────────────────────────────────────────────────

/// Header-level data of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: Height,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    /// Consensus address of the proposer.
    pub proposer: String,
    pub tx_count: u32,
}

/// Events emitted outside of transactions while the block was executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResults {
    pub height: Height,
    #[serde(default)]
    pub begin_block_events: Vec<Event>,
    #[serde(default)]
    pub end_block_events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: String,
    pub voting_power: i64,
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

/// A typed ABCI event (`kind` plus key/value attributes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: vec![],
        }
    }

    /// Append an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// First value of `key`, if present.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// Like [`Event::attribute`] but a missing key is a decode error.
    pub fn require(&self, key: &str) -> Result<&str, ViewError> {
        self.attribute(key).ok_or_else(|| {
            ViewError::Decode(format!("event '{}' has no attribute '{key}'", self.kind))
        })
    }

    /// Parse the value of `key` as an unsigned integer.
    pub fn require_u64(&self, key: &str) -> Result<u64, ViewError> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| {
            ViewError::Decode(format!(
                "event '{}' attribute '{key}' is not an integer: {raw}",
                self.kind
            ))
        })
    }
}

/// Execution log of one message; an empty log list marks a failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLog {
    pub msg_index: usize,
    #[serde(default)]
    pub events: Vec<Event>,
}

// ─── Tx ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub hash: String,
    pub height: Height,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub logs: Vec<TxLog>,
    /// Flattened events of the whole transaction.
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Tx {
    /// The chain executed this transaction successfully.
    pub fn successful(&self) -> bool {
        !self.logs.is_empty()
    }

    /// Events logged for the message at `index`.
    pub fn events_for_msg(&self, index: usize) -> &[Event] {
        self.logs
            .iter()
            .find(|log| log.msg_index == index)
            .map(|log| log.events.as_slice())
            .unwrap_or(&[])
    }

    /// First event of `kind` logged for the message at `index`.
    pub fn find_event(&self, index: usize, kind: &str) -> Result<&Event, ViewError> {
        self.events_for_msg(index)
            .iter()
            .find(|e| e.kind == kind)
            .ok_or_else(|| {
                ViewError::Decode(format!(
                    "tx {} has no '{kind}' event for message {index}",
                    self.hash
                ))
            })
    }

    /// All transaction-level events of `kind`.
    pub fn events_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.kind == kind)
    }
}

/// One height's worth of work handed over by the ingestion driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockUnit {
    pub block: Block,
    #[serde(default)]
    pub results: BlockResults,
    #[serde(default)]
    pub txs: Vec<Tx>,
    #[serde(default)]
    pub validators: Vec<Validator>,
}

// ─── Genesis ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    pub initial_height: Height,
    pub genesis_time: DateTime<Utc>,
}

/// Per-module genesis state, keyed by module name.
pub type AppState = serde_json::Map<String, serde_json::Value>;
