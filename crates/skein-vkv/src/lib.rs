//! Eventually consistent key-value node.
//!
//! Every node holds a full copy of the store and answers transactions
//! locally under one async mutex. Each write stamps the value with a
//! vector clock (the writer bumps its own slot), and the staged writes
//! are replicated to every peer through a background queue that retries
//! until the peer acknowledges. Incoming replication merges per key:
//! the dominant clock wins, concurrent clocks fall back to a fixed
//! tie-break (the numerically larger node id's value), and the stored clock
//! always becomes the componentwise maximum so replicas converge no
//! matter the delivery order.

pub mod version;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skein_core::envelope::codes;
use skein_core::{Body, Envelope, Node, NodeBuilder, NodeError, DEFAULT_RPC_TIMEOUT};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use version::{compare, merge, VersionOrder, VersionedValue};

#[derive(Clone, Debug)]
pub struct Config {
    /// Window for one replication attempt before the batch is requeued.
    pub rpc_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// One `[op, key, value]` triplet; reads carry `null` until answered.
type TxnOp = (String, i64, Option<i64>);

#[derive(Deserialize, Serialize)]
struct TxnPayload {
    txn: Vec<TxnOp>,
}

#[derive(Deserialize, Serialize)]
struct SyncPayload {
    /// Staged writes keyed by store key.
    tx: HashMap<i64, VersionedValue>,
}

/// A batch of writes bound for one peer. Requeued whole on failure.
struct ReplicationTask {
    dest: String,
    writes: HashMap<i64, VersionedValue>,
}

struct State {
    store: tokio::sync::Mutex<HashMap<i64, VersionedValue>>,
    repl_tx: mpsc::UnboundedSender<ReplicationTask>,
}

/// Build a fully configured key-value node.
pub fn builder(config: Config) -> Result<NodeBuilder, NodeError> {
    let (repl_tx, repl_rx) = mpsc::unbounded_channel();
    let state = Arc::new(State {
        store: tokio::sync::Mutex::new(HashMap::new()),
        repl_tx: repl_tx.clone(),
    });

    let on_txn = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move { handle_txn(node, env, state).await }
        }
    };

    let on_sync = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move { handle_sync(node, env, state).await }
        }
    };

    let timeout = config.rpc_timeout;
    Ok(NodeBuilder::new()
        .handle("txn", on_txn)?
        .handle("sync", on_sync)?
        .task(move |node| replication_worker(node, repl_rx, repl_tx, timeout)))
}

/// Position of `id` in the sorted membership, the node's clock slot.
fn cluster_slot(peers: &[String], id: &str) -> Option<usize> {
    peers.iter().position(|p| p == id)
}

async fn handle_txn(node: Node, env: Envelope, state: Arc<State>) -> Result<(), NodeError> {
    let mut payload: TxnPayload = match env.body.payload() {
        Ok(payload) => payload,
        Err(err) => {
            return node.reply(&env, Body::error(codes::MALFORMED_REQUEST, err.to_string()));
        }
    };
    for (op, _, value) in &payload.txn {
        let valid = match op.as_str() {
            "r" => true,
            "w" => value.is_some(),
            _ => false,
        };
        if !valid {
            return node.reply(
                &env,
                Body::error(codes::MALFORMED_REQUEST, format!("unsupported op `{op}`")),
            );
        }
    }

    let peers = node.peers();
    let self_slot = cluster_slot(&peers, &node.id()).unwrap_or(0);
    let mut staged: HashMap<i64, VersionedValue> = HashMap::new();
    {
        let mut store = state.store.lock().await;
        for (op, key, value) in &mut payload.txn {
            match op.as_str() {
                "r" => *value = store.get(key).map(|v| v.value),
                _ => {
                    // Validated above: a write with a value.
                    let mut version = store
                        .get(key)
                        .map(|v| v.version.clone())
                        .unwrap_or_else(|| vec![0; peers.len()]);
                    if version.len() < peers.len() {
                        version.resize(peers.len(), 0);
                    }
                    version[self_slot] += 1;
                    let versioned = VersionedValue {
                        value: value.unwrap_or_default(),
                        version,
                    };
                    store.insert(*key, versioned.clone());
                    staged.insert(*key, versioned);
                }
            }
        }
    }

    if !staged.is_empty() {
        for dest in node.other_nodes() {
            // The worker owns delivery; a closed queue only happens at
            // shutdown, where losing the batch is fine.
            let _ = state.repl_tx.send(ReplicationTask {
                dest,
                writes: staged.clone(),
            });
        }
    }

    node.reply(&env, Body::from_payload("txn_ok", &payload)?)
}

async fn handle_sync(node: Node, env: Envelope, state: Arc<State>) -> Result<(), NodeError> {
    let payload: SyncPayload = env.body.payload()?;
    let self_id = Node::node_index(&node.id());
    let sender_id = Node::node_index(&env.src);

    {
        let mut store = state.store.lock().await;
        for (key, incoming) in payload.tx {
            match store.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(incoming);
                }
                Entry::Occupied(mut slot) => {
                    let local = slot.get_mut();
                    let keep_remote = match compare(&local.version, &incoming.version) {
                        VersionOrder::Less => true,
                        VersionOrder::Greater => false,
                        // Concurrent writes resolve the same way on both
                        // sides: the numerically larger node id wins.
                        VersionOrder::Concurrent => sender_id > self_id,
                    };
                    local.version = merge(&local.version, &incoming.version);
                    if keep_remote {
                        local.value = incoming.value;
                    }
                }
            }
        }
    }

    node.reply(&env, Body::new("sync_ok"))
}

/// Drains the replication queue, one in-flight batch at a time. An
/// unacknowledged batch goes back on the queue, so delivery retries
/// forever while the merge rules keep redelivery harmless.
async fn replication_worker(
    node: Node,
    mut rx: mpsc::UnboundedReceiver<ReplicationTask>,
    tx: mpsc::UnboundedSender<ReplicationTask>,
    timeout: Duration,
) {
    while let Some(task) = rx.recv().await {
        let body = match Body::from_payload(
            "sync",
            &SyncPayload {
                tx: task.writes.clone(),
            },
        ) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "dropping unencodable replication batch");
                continue;
            }
        };
        match node.rpc(&task.dest, body, timeout).await {
            Ok(reply) if reply.body.kind == "sync_ok" => {}
            Ok(reply) => {
                warn!(dest = %task.dest, kind = %reply.body.kind, "unexpected sync reply, requeueing");
                let _ = tx.send(task);
            }
            Err(err) => {
                debug!(dest = %task.dest, %err, "sync attempt failed, requeueing");
                let _ = tx.send(task);
            }
        }
    }
}
