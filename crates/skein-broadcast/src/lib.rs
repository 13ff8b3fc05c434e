//! Gossip broadcast node: a replicated, append-only set of integers.
//!
//! Values learned from clients are batched and gossiped to every peer on
//! a fixed tick; message loss is repaired by re-sending the identical
//! envelope until the peer acknowledges it, so delivery converges even
//! under heavy loss. Values learned from peers are recorded but not
//! re-gossiped; only the origin node re-broadcasts, which stops
//! unbounded amplification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skein_core::envelope::codes;
use skein_core::{Body, Envelope, Node, NodeBuilder, NodeError};
use tracing::{debug, warn};

/// Tuning knobs for the broadcast node.
#[derive(Clone, Debug)]
pub struct Config {
    /// How often to retransmit unacked gossip and flush newly learned
    /// values.
    pub gossip_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gossip_interval: Duration::from_millis(750),
        }
    }
}

/// A `broadcast` body: either one value (client traffic) or a batch
/// (peer gossip).
#[derive(Debug, Default, Serialize, Deserialize)]
struct BroadcastPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<i64>,
    #[serde(rename = "messageBatch", skip_serializing_if = "Option::is_none")]
    message_batch: Option<Vec<i64>>,
}

#[derive(Serialize)]
struct ReadOk {
    messages: Vec<i64>,
}

#[derive(Deserialize)]
struct TopologyPayload {
    topology: HashMap<String, Vec<String>>,
}

/// Seen and pending-for-gossip value sets; one named critical section.
#[derive(Default)]
struct ValueSet {
    /// Every value this node knows. Append-only.
    seen: HashSet<i64>,
    /// Known but not yet gossiped since the last flush tick.
    pending: HashSet<i64>,
}

struct State {
    values: Mutex<ValueSet>,
    /// Unacknowledged gossip envelopes keyed by the `msg_id` they were
    /// sent with. Removed on `broadcast_ok`, never on timeout.
    in_flight: Mutex<HashMap<u64, Envelope>>,
    /// Neighbor list from `topology`. Stored but deliberately not
    /// consulted: gossip goes to the full peer list, a simplification
    /// over minimal-topology fan-out that this design preserves.
    neighbors: Mutex<Vec<String>>,
}

/// Build a fully configured broadcast node.
pub fn builder(config: Config) -> Result<NodeBuilder, NodeError> {
    let state = Arc::new(State {
        values: Mutex::new(ValueSet::default()),
        in_flight: Mutex::new(HashMap::new()),
        neighbors: Mutex::new(Vec::new()),
    });

    let on_broadcast = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let payload: BroadcastPayload = env.body.payload()?;
                if let Some(value) = payload.message {
                    let mut values = state.values.lock();
                    // Only values first heard from a client are queued
                    // for gossip; the origin alone re-broadcasts.
                    if values.seen.insert(value) && env.src.starts_with('c') {
                        values.pending.insert(value);
                    }
                }
                if let Some(batch) = payload.message_batch {
                    state.values.lock().seen.extend(batch);
                }
                node.reply(&env, Body::new("broadcast_ok"))
            }
        }
    };

    let on_broadcast_ok = {
        let state = state.clone();
        move |_node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                if let Some(acked) = env.body.in_reply_to {
                    if state.in_flight.lock().remove(&acked).is_some() {
                        debug!(acked, peer = %env.src, "gossip acknowledged");
                    }
                }
                Ok(())
            }
        }
    };

    let on_read = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let mut messages: Vec<i64> = state.values.lock().seen.iter().copied().collect();
                messages.sort_unstable();
                node.reply(&env, Body::from_payload("read_ok", &ReadOk { messages })?)
            }
        }
    };

    let on_topology = {
        let state = state.clone();
        move |node: Node, env: Envelope| {
            let state = state.clone();
            async move {
                let payload: TopologyPayload = env.body.payload()?;
                match payload.topology.get(&node.id()) {
                    Some(neighbors) => {
                        *state.neighbors.lock() = neighbors.clone();
                        node.reply(&env, Body::new("topology_ok"))
                    }
                    None => {
                        warn!("topology message missing our entry");
                        node.reply(
                            &env,
                            Body::error(codes::MALFORMED_REQUEST, "no topology entry for node"),
                        )
                    }
                }
            }
        }
    };

    let gossip = {
        let state = state.clone();
        move |node: Node| {
            let state = state.clone();
            async move { gossip_tick(&node, &state) }
        }
    };

    Ok(NodeBuilder::new()
        .handle("broadcast", on_broadcast)?
        .handle("broadcast_ok", on_broadcast_ok)?
        .handle("read", on_read)?
        .handle("topology", on_topology)?
        .every(config.gossip_interval, gossip))
}

/// One flush tick: retransmit everything unacked verbatim, then drain
/// the pending set into one fresh batch per peer.
fn gossip_tick(node: &Node, state: &State) -> Result<(), NodeError> {
    let resends: Vec<Envelope> = state.in_flight.lock().values().cloned().collect();
    for env in resends {
        node.send_envelope(env)?;
    }

    let mut batch: Vec<i64> = {
        let mut values = state.values.lock();
        if values.pending.is_empty() {
            return Ok(());
        }
        values.pending.drain().collect()
    };
    batch.sort_unstable();

    for peer in node.other_nodes() {
        let msg_id = node.next_msg_id();
        let mut body = Body::from_payload(
            "broadcast",
            &BroadcastPayload {
                message: None,
                message_batch: Some(batch.clone()),
            },
        )?;
        body.msg_id = Some(msg_id);
        let env = Envelope {
            src: node.id(),
            dest: peer,
            body,
        };
        state.in_flight.lock().insert(msg_id, env.clone());
        node.send_envelope(env)?;
    }
    Ok(())
}
