//! Transaction messages and authorization-envelope unwrapping.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ViewError;

/// A message body as carried by the chain: a type URL plus its JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMsg {
    pub type_url: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl RawMsg {
    pub fn new(type_url: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// Decode the body into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ViewError> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| ViewError::Decode(format!("{}: {e}", self.type_url)))
    }
}

/// A top-level transaction message.
///
/// `Delegated` is an authorization "execute as" envelope; its inner
/// messages may themselves be envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Plain(RawMsg),
    Delegated { grantee: String, msgs: Vec<Message> },
}

/// Unwrap every envelope, pairing each inner message with the index of the
/// top-level message that carried it (the index events are logged under).
pub fn flatten(messages: &[Message]) -> Vec<(usize, &RawMsg)> {
    let mut out = Vec::with_capacity(messages.len());
    for (index, msg) in messages.iter().enumerate() {
        collect(index, msg, &mut out);
    }
    out
}

fn collect<'a>(index: usize, msg: &'a Message, out: &mut Vec<(usize, &'a RawMsg)>) {
    match msg {
        Message::Plain(raw) => out.push((index, raw)),
        Message::Delegated { msgs, .. } => {
            for inner in msgs {
                collect(index, inner, out);
            }
        }
    }
}
