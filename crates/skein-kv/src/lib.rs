//! Typed client for the external key-value services.
//!
//! The harness provides two stores reachable over the node's own RPC
//! channel: `lin-kv` (linearizable) and `seq-kv` (sequentially
//! consistent). Nodes never implement these, only call them. The client
//! translates the stores' error codes into variants callers can match
//! on instead of catching: absent keys and CAS conflicts are routine
//! outcomes, not exceptions.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_core::envelope::codes;
use skein_core::{Body, Envelope, ErrorPayload, Node, NodeError, DEFAULT_RPC_TIMEOUT};

/// Failure modes of a store operation.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The key does not exist. Expected on first access everywhere;
    /// keys are lazily created on first write.
    #[error("key not found")]
    NotFound,

    /// The compare-and-swap precondition failed; retry with a fresh read.
    #[error("cas precondition failed")]
    CasConflict,

    /// Any other error the store reported.
    #[error("store error {code}: {text:?}")]
    Store { code: i64, text: Option<String> },

    /// The store did not answer in time, or the transport failed.
    #[error(transparent)]
    Rpc(#[from] NodeError),

    #[error("unexpected store reply `{0}`")]
    UnexpectedReply(String),

    #[error("value codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<KvError> for NodeError {
    /// Lets handlers bubble store failures with `?`. Timeouts keep
    /// their identity; everything else becomes a protocol failure.
    fn from(err: KvError) -> Self {
        match err {
            KvError::Rpc(inner) => inner,
            other => NodeError::Protocol(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ReadRequest<'a> {
    key: &'a str,
}

#[derive(Deserialize)]
struct ReadOk {
    value: Value,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    key: &'a str,
    value: Value,
}

#[derive(Serialize)]
struct CasRequest<'a> {
    key: &'a str,
    from: Value,
    to: Value,
    create_if_not_exists: bool,
}

/// Client for one external store.
#[derive(Clone)]
pub struct KvClient {
    node: Node,
    service: &'static str,
    timeout: Duration,
}

impl KvClient {
    /// Client for the linearizable store.
    pub fn lin(node: Node) -> Self {
        KvClient {
            node,
            service: "lin-kv",
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Client for the sequentially consistent store.
    pub fn seq(node: Node) -> Self {
        KvClient {
            node,
            service: "seq-kv",
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read `key`, deserializing the stored value.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T, KvError> {
        let body = Body::from_payload("read", &ReadRequest { key }).map_err(KvError::Codec)?;
        let reply = self.call(body, "read_ok").await?;
        let payload: ReadOk = reply.body.payload().map_err(KvError::Codec)?;
        Ok(serde_json::from_value(payload.value)?)
    }

    /// Read `key`, substituting `default` when the key does not exist.
    pub async fn read_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, KvError> {
        match self.read(key).await {
            Err(KvError::NotFound) => Ok(default),
            other => other,
        }
    }

    /// Write `value` to `key`, creating it if absent.
    pub async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KvError> {
        let body = Body::from_payload(
            "write",
            &WriteRequest {
                key,
                value: serde_json::to_value(value)?,
            },
        )
        .map_err(KvError::Codec)?;
        self.call(body, "write_ok").await?;
        Ok(())
    }

    /// Compare-and-swap: replace `from` with `to` iff the stored value
    /// equals `from`. With `create_if_missing`, an absent key is treated
    /// as a successful create instead of `NotFound`.
    pub async fn cas<T: Serialize>(
        &self,
        key: &str,
        from: &T,
        to: &T,
        create_if_missing: bool,
    ) -> Result<(), KvError> {
        let body = Body::from_payload(
            "cas",
            &CasRequest {
                key,
                from: serde_json::to_value(from)?,
                to: serde_json::to_value(to)?,
                create_if_not_exists: create_if_missing,
            },
        )
        .map_err(KvError::Codec)?;
        self.call(body, "cas_ok").await?;
        Ok(())
    }

    async fn call(&self, body: Body, ok_kind: &str) -> Result<Envelope, KvError> {
        let reply = self.node.rpc(self.service, body, self.timeout).await?;
        if reply.body.is_error() {
            let err: ErrorPayload = reply.body.payload().map_err(KvError::Codec)?;
            tracing::debug!(service = self.service, code = err.code, "store error");
            return Err(match err.code {
                codes::KEY_NOT_FOUND => KvError::NotFound,
                codes::PRECONDITION_FAILED => KvError::CasConflict,
                code => KvError::Store {
                    code,
                    text: err.text,
                },
            });
        }
        if reply.body.kind != ok_kind {
            return Err(KvError::UnexpectedReply(reply.body.kind));
        }
        Ok(reply)
    }
}
