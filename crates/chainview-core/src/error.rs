//! Error types for the chainview engine.

use thiserror::Error;

/// Errors that can occur while projecting chain data.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Handler error in '{module}': {source}")]
    Handler {
        module: String,
        #[source]
        source: Box<ViewError>,
    },

    #[error("Genesis has already been dispatched")]
    GenesisAlreadyHandled,

    #[error("Genesis dispatched after block {height}")]
    GenesisAfterBlocks { height: u64 },

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ViewError {
    /// Wrap an error raised by a module handler with the module's name.
    pub fn handler(module: impl Into<String>, source: ViewError) -> Self {
        Self::Handler {
            module: module.into(),
            source: Box::new(source),
        }
    }

    /// Returns `true` if the facade reported that the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Handler { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns `true` if the error is transient (the driver may retry the whole unit).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc(_) | Self::Timeout { .. } | Self::Storage(_) => true,
            Self::Handler { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ViewError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Turn a "not found" facade error into `Ok(None)`.
///
/// Used where the domain allows an entity to not exist yet (e.g. a profile
/// that was deleted on chain before reconciliation ran).
pub fn not_found_as_none<T>(result: Result<T, ViewError>) -> Result<Option<T>, ViewError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
