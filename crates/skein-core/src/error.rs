//! Error taxonomy for the node runtime.

use std::time::Duration;

/// Errors surfaced by the runtime and its callers.
///
/// Transport failures are fatal; a node that cannot write to its output
/// cannot make progress. Everything else is recoverable by retry or
/// timeout at the call site.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// No reply with a matching `in_reply_to` arrived in time. The
    /// pending slot has been removed; a late reply will be dropped.
    #[error("rpc {msg_id} timed out after {timeout:?}")]
    RpcTimeout { msg_id: u64, timeout: Duration },

    /// A second handler was registered for the same message type.
    #[error("duplicate handler for message type `{0}`")]
    DuplicateHandler(String),

    /// `init` is handled by the runtime and cannot be overridden.
    #[error("message type `{0}` is reserved by the runtime")]
    ReservedHandler(String),

    /// The writer task is gone; the node is shutting down or its output
    /// failed.
    #[error("outbound channel closed")]
    Disconnected,

    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Protocol-level failure raised by a handler.
    #[error("{0}")]
    Protocol(String),
}
