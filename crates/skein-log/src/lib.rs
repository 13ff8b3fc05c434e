//! Multi-log append node over the linearizable store.
//!
//! Each log key is owned by exactly one node, chosen by hashing the key
//! over the sorted cluster membership. The owner serializes appends per
//! key behind an async mutex and keeps all durable state in lin-kv:
//! a `latest_{key}` high-water offset, an `entry_{key}` string encoding
//! the whole log, and advisory `client_offset_{key}` commit cursors.
//! Non-owners forward `send` to the owner and relay the assigned offset;
//! reads go straight to the store from any node.
//!
//! Offset assignment and the entry append are two separate writes, so a
//! crash between them can leak an offset that never gets an entry.
//! Consumers tolerate the gap; offsets stay monotonic per key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skein_core::envelope::codes;
use skein_core::{Body, Envelope, ErrorPayload, Node, NodeBuilder, NodeError, DEFAULT_RPC_TIMEOUT};
use skein_kv::{KvClient, KvError};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Config {
    /// Window for store calls and for forwarding a `send` to the owner.
    pub rpc_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

#[derive(Deserialize, Serialize)]
struct SendPayload {
    key: String,
    msg: i64,
}

#[derive(Deserialize, Serialize)]
struct SendOk {
    offset: i64,
}

#[derive(Deserialize)]
struct PollPayload {
    offsets: HashMap<String, i64>,
}

#[derive(Serialize)]
struct PollOk {
    msgs: HashMap<String, Vec<[i64; 2]>>,
}

#[derive(Deserialize)]
struct CommitOffsetsPayload {
    offsets: HashMap<String, i64>,
}

#[derive(Deserialize)]
struct ListCommittedPayload {
    keys: Vec<String>,
}

#[derive(Serialize)]
struct ListCommittedOk {
    offsets: HashMap<String, i64>,
}

/// Which cluster slot owns `key`, for a cluster of `n` sorted node ids.
/// Stable across nodes because everyone hashes the same membership list.
pub fn owner_index(key: &str, n: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % n as u64) as usize
}

fn latest_key(key: &str) -> String {
    format!("latest_{key}")
}

fn entry_key(key: &str) -> String {
    format!("entry_{key}")
}

fn client_offset_key(key: &str) -> String {
    format!("client_offset_{key}")
}

/// Append one entry to the encoded log string.
fn encode_entry(log: &mut String, offset: i64, msg: i64) {
    log.push_str(&format!("{offset}={msg};"));
}

/// Decode an `entry_{key}` string into `(offset, msg)` pairs. Offsets are
/// appended in increasing order by the single owner, so the result is
/// sorted.
fn parse_entries(raw: &str) -> Vec<[i64; 2]> {
    raw.split(';')
        .filter(|seg| !seg.is_empty())
        .filter_map(|seg| {
            let (off, val) = seg.split_once('=')?;
            Some([off.parse().ok()?, val.parse().ok()?])
        })
        .collect()
}

/// Entries at or after `from`, relying on the sorted encoding.
fn entries_from(entries: &[[i64; 2]], from: i64) -> &[[i64; 2]] {
    let start = entries.partition_point(|e| e[0] < from);
    &entries[start..]
}

struct State {
    /// One async mutex per locally owned key, created on first append.
    /// The outer lock is never held across an await.
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    config: Config,
}

/// lin-kv client bound to the configured store-call window.
fn store_client(node: &Node, state: &State) -> KvClient {
    KvClient::lin(node.clone()).with_timeout(state.config.rpc_timeout)
}

impl State {
    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Build a fully configured log node.
pub fn builder(config: Config) -> Result<NodeBuilder, NodeError> {
    let state = Arc::new(State {
        locks: parking_lot::Mutex::new(HashMap::new()),
        config,
    });

    let on_send = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move { handle_send(node, env, state).await }
        }
    };

    let on_poll = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let payload: PollPayload = env.body.payload()?;
                let kv = store_client(&node, &state);
                let mut msgs = HashMap::new();
                for (key, from) in payload.offsets {
                    let raw = kv
                        .read_or_default::<String>(&entry_key(&key), String::new())
                        .await?;
                    let entries = parse_entries(&raw);
                    msgs.insert(key, entries_from(&entries, from).to_vec());
                }
                node.reply(&env, Body::from_payload("poll_ok", &PollOk { msgs })?)
            }
        }
    };

    let on_commit = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let payload: CommitOffsetsPayload = env.body.payload()?;
                let kv = store_client(&node, &state);
                for (key, offset) in payload.offsets {
                    kv.write(&client_offset_key(&key), &offset).await?;
                }
                node.reply(&env, Body::new("commit_offsets_ok"))
            }
        }
    };

    let on_list = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let payload: ListCommittedPayload = env.body.payload()?;
                let kv = store_client(&node, &state);
                let mut offsets = HashMap::new();
                for key in payload.keys {
                    match kv.read::<i64>(&client_offset_key(&key)).await {
                        Ok(offset) => {
                            offsets.insert(key, offset);
                        }
                        // Nothing committed yet; the key is simply absent
                        // from the reply.
                        Err(KvError::NotFound) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                node.reply(
                    &env,
                    Body::from_payload("list_committed_offsets_ok", &ListCommittedOk { offsets })?,
                )
            }
        }
    };

    Ok(NodeBuilder::new()
        .handle("send", on_send)?
        .handle("poll", on_poll)?
        .handle("commit_offsets", on_commit)?
        .handle("list_committed_offsets", on_list)?)
}

async fn handle_send(node: Node, env: Envelope, state: Arc<State>) -> Result<(), NodeError> {
    let payload: SendPayload = match env.body.payload() {
        Ok(payload) => payload,
        Err(err) => {
            return node.reply(&env, Body::error(codes::MALFORMED_REQUEST, err.to_string()));
        }
    };

    let peers = node.peers();
    // Empty until the init handshake; ownership cannot be decided yet.
    if peers.is_empty() {
        return node.reply(
            &env,
            Body::error(codes::TEMPORARILY_UNAVAILABLE, "node not initialized"),
        );
    }
    let owner = peers[owner_index(&payload.key, peers.len())].clone();
    if owner != node.id() {
        return forward_send(node, env, payload, &owner, state.config.rpc_timeout).await;
    }

    match append(&node, &state, &payload).await {
        Ok(offset) => node.reply(&env, Body::from_payload("send_ok", &SendOk { offset })?),
        Err(err) => {
            warn!(%err, key = %payload.key, "append failed");
            node.reply(
                &env,
                Body::error(codes::TEMPORARILY_UNAVAILABLE, "append failed, retry"),
            )
        }
    }
}

/// Relay a `send` to the key's owner and pass its verdict back to the
/// client. A silent owner becomes a retryable error rather than a
/// dropped request.
async fn forward_send(
    node: Node,
    env: Envelope,
    payload: SendPayload,
    owner: &str,
    timeout: Duration,
) -> Result<(), NodeError> {
    let fwd = Body::from_payload("send", &payload)?;
    match node.rpc(owner, fwd, timeout).await {
        Ok(reply) if reply.body.kind == "send_ok" => {
            let ok: SendOk = reply.body.payload()?;
            node.reply(&env, Body::from_payload("send_ok", &ok)?)
        }
        Ok(reply) if reply.body.is_error() => {
            let fault: ErrorPayload = reply.body.payload()?;
            node.reply(
                &env,
                Body::error(fault.code, fault.text.unwrap_or_default()),
            )
        }
        Ok(reply) => Err(NodeError::Protocol(format!(
            "owner {owner} answered `{}` to a send",
            reply.body.kind
        ))),
        Err(NodeError::RpcTimeout { .. }) => {
            warn!(owner, key = %payload.key, "owner did not answer forwarded send");
            node.reply(
                &env,
                Body::error(codes::TEMPORARILY_UNAVAILABLE, "log owner unavailable"),
            )
        }
        Err(err) => Err(err),
    }
}

/// Owner-side append: claim the next offset, then extend the entry
/// string, both under the per-key lock so concurrent sends to the same
/// key cannot interleave their store round trips.
async fn append(node: &Node, state: &State, payload: &SendPayload) -> Result<i64, KvError> {
    let lock = state.key_lock(&payload.key);
    let _guard = lock.lock().await;
    let kv = store_client(node, state);

    let offset = kv
        .read_or_default::<i64>(&latest_key(&payload.key), -1)
        .await?
        + 1;
    kv.write(&latest_key(&payload.key), &offset).await?;

    let mut log = kv
        .read_or_default::<String>(&entry_key(&payload.key), String::new())
        .await?;
    encode_entry(&mut log, offset, payload.msg);
    kv.write(&entry_key(&payload.key), &log).await?;
    Ok(offset)
}
