//! Cluster error types.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the fleet layer.
///
/// Per the degrade-gracefully policy, only configuration mistakes reach
/// callers of `start()`/`stop()`; transport failures, missing workers,
/// and instance errors are handled internally through logging, state
/// transitions, and events.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
