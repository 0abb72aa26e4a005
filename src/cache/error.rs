use thiserror::Error;

use super::metadata::MetadataError;
use super::network::NetworkError;

/// Errors surfaced by the cache: canonicalization, metadata lookups and the
/// collaborator failures stored on entries.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("`{operation}` mixes result types `{left}` and `{right}`")]
    IncompatibleSetTypes {
        operation: &'static str,
        left: String,
        right: String,
    },
    #[error("`{operation}` requires at least one object set")]
    EmptySetOperation { operation: &'static str },
    #[error("object set `{kind}` is not supported here")]
    UnsupportedObjectSet { kind: &'static str },
    #[error("the store has been shut down")]
    StoreClosed,
}

impl CacheError {
    pub fn incompatible(
        operation: &'static str,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> Self {
        Self::IncompatibleSetTypes {
            operation,
            left: left.into(),
            right: right.into(),
        }
    }

    /// Network failure carried by this error, if any.
    pub fn as_network(&self) -> Option<&NetworkError> {
        match self {
            Self::Network(err) => Some(err),
            _ => None,
        }
    }
}
