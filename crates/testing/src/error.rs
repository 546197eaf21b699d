use std::time::Duration;

use relay_realtime::AdapterError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An adapter failed to close.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Binding the ephemeral port failed.
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    /// A broker client failed to connect or quit.
    #[error("broker error: {0}")]
    Broker(Box<dyn std::error::Error + Send + Sync>),

    /// A cluster of zero nodes was requested.
    #[error("a cluster needs at least one node")]
    EmptyCluster,

    /// A node task panicked or was cancelled.
    #[error("node task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A node's server stopped before accepting its client.
    #[error("node {0} stopped before its connection was accepted")]
    NodeStopped(usize),

    /// A call gate was invoked more often than it was armed for.
    #[error("too many calls: {actual} instead of {expected}")]
    Overinvocation {
        /// Number of calls made so far.
        actual: usize,
        /// Number of calls the gate was armed for.
        expected: usize,
    },

    /// A server or client operation failed.
    #[error(transparent)]
    Realtime(#[from] relay_realtime::Error),

    /// Not every node completed its handshake in time.
    #[error("{accepted} of {expected} nodes ready after {elapsed:?}")]
    Timeout {
        /// Nodes that had completed their handshake.
        accepted: usize,
        /// Nodes requested.
        expected: usize,
        /// How long the bootstrap waited.
        elapsed: Duration,
    },
}
