//! Delta-state counter node.
//!
//! One logical grow-counter = a durable base in the external seq-kv
//! store + a locally accumulated, not-yet-flushed delta. `add` never
//! leaves the process: it accrues into the delta under a mutex and acks
//! immediately. A periodic job merges the delta into the store with
//! read-then-CAS; a lost CAS race simply retries next tick with a fresh
//! base. `read` serves the last durable base this node observed, so
//! staleness is bounded by the flush interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skein_core::{Body, Envelope, Node, NodeBuilder, NodeError};
use skein_kv::{KvClient, KvError};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct Config {
    /// How often the local delta is merged into the durable base.
    pub flush_interval: Duration,
    /// seq-kv key holding the durable base.
    pub store_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flush_interval: Duration::from_millis(200),
            store_key: "gcounter".into(),
        }
    }
}

#[derive(Deserialize)]
struct AddPayload {
    delta: i64,
}

#[derive(Serialize)]
struct ReadOk {
    value: i64,
}

struct State {
    /// Accrued but not yet durable. Adds increment it; a successful
    /// flush subtracts exactly the flushed snapshot, so adds that raced
    /// with the round trip are kept for the next cycle.
    delta: Mutex<i64>,
    /// Last durable base observed by the flush job.
    base: Mutex<i64>,
    config: Config,
}

/// Build a fully configured counter node.
pub fn builder(config: Config) -> Result<NodeBuilder, NodeError> {
    let state = Arc::new(State {
        delta: Mutex::new(0),
        base: Mutex::new(0),
        config: config.clone(),
    });

    let on_add = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let payload: AddPayload = env.body.payload()?;
                *state.delta.lock() += payload.delta;
                node.reply(&env, Body::new("add_ok"))
            }
        }
    };

    let on_read = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let value = *state.base.lock();
                node.reply(&env, Body::from_payload("read_ok", &ReadOk { value })?)
            }
        }
    };

    let flush = {
        let state = state.clone();
        move |node: Node| {
            let state = state.clone();
            async move {
                flush_delta(&node, &state).await;
                Ok(())
            }
        }
    };

    Ok(NodeBuilder::new()
        .handle("add", on_add)?
        .handle("read", on_read)?
        .every(config.flush_interval, flush))
}

/// One flush cycle: snapshot the delta, refresh the cached base, and
/// try to CAS the snapshot in. Failure modes are all "try again next
/// tick"; nothing here is surfaced to clients.
async fn flush_delta(node: &Node, state: &State) {
    let snapshot = *state.delta.lock();
    let kv = KvClient::seq(node.clone());

    let base = match kv.read_or_default(&state.config.store_key, 0i64).await {
        Ok(base) => base,
        Err(err) => {
            warn!(%err, "counter base read failed, retrying next tick");
            return;
        }
    };
    *state.base.lock() = base;

    if snapshot == 0 {
        return;
    }

    match kv
        .cas(&state.config.store_key, &base, &(base + snapshot), true)
        .await
    {
        Ok(()) => {
            // Subtract only what was flushed; concurrent adds that
            // arrived during the round trip stay in the delta.
            *state.delta.lock() -= snapshot;
            *state.base.lock() = base + snapshot;
            debug!(flushed = snapshot, base = base + snapshot, "delta flushed");
        }
        Err(KvError::CasConflict) => {
            debug!("counter cas lost the race, retrying next tick");
        }
        Err(err) => warn!(%err, "counter flush failed, retrying next tick"),
    }
}
