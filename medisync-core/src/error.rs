//! Error types for the remote gateway and the entity stores.

use thiserror::Error;

/// Errors reported by a [`RemoteStore`](crate::remote::RemoteStore) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors produced by the [`CollectionGateway`](crate::gateway::CollectionGateway).
///
/// None of these escape an entity store as a failure of a mutation: writes are
/// recovered locally and surfaced through sync flags and notices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("No signed-in identity")]
    Unauthenticated,

    #[error("Filtered query on '{collection}' rejected: {source}")]
    FilteredQueryRejected {
        collection: String,
        source: RemoteError,
    },

    #[error("Write to '{collection}' failed: {source}")]
    RemoteWrite {
        collection: String,
        source: RemoteError,
    },

    #[error("Read from '{collection}' failed: {source}")]
    RemoteRead {
        collection: String,
        source: RemoteError,
    },

    #[error(
        "Stale completion for '{record_id}' in '{collection}': \
         version {expected} was superseded by {current}"
    )]
    StaleWriteConflict {
        collection: String,
        record_id: String,
        expected: u64,
        current: u64,
    },
}

/// Errors an entity store reports to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid patch for '{collection}': {reason}")]
    InvalidPatch { collection: String, reason: String },

    #[error("Subscription failed: {0}")]
    Subscribe(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display_includes_source() {
        let err = GatewayError::RemoteWrite {
            collection: "patients".to_string(),
            source: RemoteError::Unavailable("offline".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("patients"));
        assert!(msg.contains("offline"));
    }

    #[test]
    fn test_store_error_from_gateway_error() {
        let err: StoreError = GatewayError::Unauthenticated.into();
        assert_eq!(err, StoreError::Subscribe(GatewayError::Unauthenticated));
        assert!(err.to_string().contains("No signed-in identity"));
    }
}
