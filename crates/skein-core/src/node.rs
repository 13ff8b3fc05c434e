//! Async node runtime: handler registry, msg-id allocation, RPC
//! correlation, periodic jobs, and the serve loop.
//!
//! A node owns one read loop. Every inbound message either resolves a
//! pending RPC slot or is dispatched to its registered handler on a
//! freshly spawned task, so handlers race freely and serialize only
//! through the locks each protocol takes explicitly. Dispatch is
//! unbounded: there is no backpressure or pool limit.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::envelope::{Body, Envelope};
use crate::error::NodeError;

/// Default window for [`Node::rpc`].
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send>>;
type Handler = Arc<dyn Fn(Node, Envelope) -> HandlerFuture + Send + Sync>;
type JobFuture = Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send>>;
type Job = Arc<dyn Fn(Node) -> JobFuture + Send + Sync>;
type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskFn = Box<dyn FnOnce(Node) -> TaskFuture + Send>;

/// Identity assigned by the `init` handshake.
#[derive(Clone, Debug)]
struct Identity {
    node_id: String,
    node_ids: Vec<String>,
}

#[derive(Deserialize)]
struct InitPayload {
    node_id: String,
    node_ids: Vec<String>,
}

struct Shared {
    identity: OnceLock<Identity>,
    next_msg_id: AtomicU64,
    /// Pending RPC slots keyed by the `msg_id` of the outstanding request.
    /// Never held across an await.
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

/// Handle to a running node. Cheap to clone; handlers and background
/// jobs receive one per invocation.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    /// This node's id, or an empty string before `init` has been
    /// processed. Handlers and background jobs only ever run after init.
    pub fn id(&self) -> String {
        self.shared
            .identity
            .get()
            .map(|i| i.node_id.clone())
            .unwrap_or_default()
    }

    /// All node ids in the cluster (including this one), sorted.
    pub fn peers(&self) -> Vec<String> {
        self.shared
            .identity
            .get()
            .map(|i| i.node_ids.clone())
            .unwrap_or_default()
    }

    /// Every node id except this one.
    pub fn other_nodes(&self) -> Vec<String> {
        let id = self.id();
        self.peers().into_iter().filter(|n| *n != id).collect()
    }

    /// Numeric component of an `nX` / `cX` identifier.
    pub fn node_index(id: &str) -> Option<usize> {
        id.trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok()
    }

    /// Allocate the next process-local message id.
    pub fn next_msg_id(&self) -> u64 {
        self.shared.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fire-and-forget send. Assigns a `msg_id` if the body lacks one;
    /// no delivery guarantee beyond the transport's.
    pub fn send(&self, dest: impl Into<String>, mut body: Body) -> Result<(), NodeError> {
        if body.msg_id.is_none() {
            body.msg_id = Some(self.next_msg_id());
        }
        self.send_envelope(Envelope {
            src: self.id(),
            dest: dest.into(),
            body,
        })
    }

    /// Re-send an already-built envelope verbatim, `msg_id` included.
    /// Used for gossip retransmission, where the retry must be the same
    /// message so the eventual ack still matches.
    pub fn send_envelope(&self, env: Envelope) -> Result<(), NodeError> {
        self.shared
            .outbound
            .send(env)
            .map_err(|_| NodeError::Disconnected)
    }

    /// Reply to a request: fills `in_reply_to` from the request's
    /// `msg_id` and addresses the request's `src`.
    pub fn reply(&self, request: &Envelope, mut body: Body) -> Result<(), NodeError> {
        body.in_reply_to = request.body.msg_id;
        self.send(request.src.clone(), body)
    }

    /// Synchronous RPC over the async channel: assigns a `msg_id`,
    /// registers a single-use pending slot, sends, and suspends the
    /// caller until a reply with a matching `in_reply_to` arrives or
    /// `timeout` elapses. On timeout the slot is removed and a late
    /// reply is silently dropped. Arbitrarily many RPCs may be
    /// outstanding at once, each independent.
    pub async fn rpc(
        &self,
        dest: &str,
        mut body: Body,
        timeout: Duration,
    ) -> Result<Envelope, NodeError> {
        let msg_id = self.next_msg_id();
        body.msg_id = Some(msg_id);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(msg_id, tx);

        if let Err(err) = self.send_envelope(Envelope {
            src: self.id(),
            dest: dest.to_string(),
            body,
        }) {
            self.shared.pending.lock().remove(&msg_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            // The read loop removed the slot when it fulfilled it.
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.shared.pending.lock().remove(&msg_id);
                Err(NodeError::Disconnected)
            }
            Err(_) => {
                self.shared.pending.lock().remove(&msg_id);
                debug!(msg_id, ?timeout, "rpc timed out");
                Err(NodeError::RpcTimeout { msg_id, timeout })
            }
        }
    }
}

/// Configures a node before it starts serving: one handler per message
/// type, periodic jobs, and long-running background workers.
pub struct NodeBuilder {
    handlers: HashMap<String, Handler>,
    periodics: Vec<(Duration, Job)>,
    tasks: Vec<TaskFn>,
}

impl std::fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("periodics", &self.periodics.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        NodeBuilder {
            handlers: HashMap::new(),
            periodics: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Bind a handler to a message type. Registering the same type twice
    /// is a configuration error, as is registering `init`.
    pub fn handle<F, Fut>(mut self, kind: &str, f: F) -> Result<Self, NodeError>
    where
        F: Fn(Node, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        if kind == "init" {
            return Err(NodeError::ReservedHandler(kind.to_string()));
        }
        if self.handlers.contains_key(kind) {
            return Err(NodeError::DuplicateHandler(kind.to_string()));
        }
        self.handlers.insert(
            kind.to_string(),
            Arc::new(move |node, env| Box::pin(f(node, env)) as HandlerFuture),
        );
        Ok(self)
    }

    /// Schedule `job` to run every `interval`, starting after init.
    /// Jobs run concurrently with message handling and with each other;
    /// they must take the same locks as request handlers. Job errors are
    /// logged and the schedule continues.
    pub fn every<F, Fut>(mut self, interval: Duration, job: F) -> Self
    where
        F: Fn(Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        self.periodics.push((
            interval,
            Arc::new(move |node| Box::pin(job(node)) as JobFuture),
        ));
        self
    }

    /// Spawn a long-running background worker after init (e.g. a
    /// replication queue consumer). Aborted when input ends.
    pub fn task<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(Node) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .push(Box::new(move |node| Box::pin(f(node)) as TaskFuture));
        self
    }

    /// Serve over stdin/stdout, the harness transport.
    pub async fn serve_stdio(self) -> Result<(), NodeError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run the node over the given transport until end of input.
    ///
    /// The first message must be `init`; the runtime records the node's
    /// identity, replies `init_ok`, and only then starts periodic jobs
    /// and background tasks. Malformed lines and unknown types are
    /// logged and skipped. End-of-input drains in-flight handlers before
    /// returning. A failed transport write is fatal and surfaces here.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), NodeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let node = Node {
            shared: Arc::new(Shared {
                identity: OnceLock::new(),
                next_msg_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                outbound: out_tx,
            }),
        };

        let mut writer_task: JoinHandle<Result<(), NodeError>> =
            tokio::spawn(write_loop(out_rx, writer));
        let mut lines = BufReader::new(reader).lines();
        let mut in_flight = JoinSet::new();
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        // Started once, when init arrives.
        let mut deferred = Some((self.periodics, self.tasks));
        let handlers = self.handlers;

        let loop_result = loop {
            let line = tokio::select! {
                res = &mut writer_task => {
                    // Writer gone mid-run: the transport failed.
                    abort_all(&mut background).await;
                    return match res {
                        Ok(Err(err)) => Err(err),
                        Ok(Ok(())) => Err(NodeError::Disconnected),
                        Err(err) => Err(NodeError::Protocol(format!("writer task panicked: {err}"))),
                    };
                }
                line = lines.next_line() => line,
            };

            let raw = match line {
                Err(err) => break Err(NodeError::from(err)),
                Ok(None) => break Ok(()),
                Ok(Some(raw)) => raw,
            };

            let env: Envelope = match serde_json::from_str(&raw) {
                Ok(env) => env,
                Err(err) => {
                    warn!(%err, line = %raw, "skipping malformed message");
                    continue;
                }
            };

            // A reply that matches a pending RPC resolves that slot and is
            // not also dispatched. Replies nobody is waiting on (e.g.
            // fire-and-forget acks) fall through to the type handler.
            if let Some(reply_to) = env.body.in_reply_to {
                let slot = node.shared.pending.lock().remove(&reply_to);
                if let Some(tx) = slot {
                    let _ = tx.send(env);
                    continue;
                }
            }

            if env.body.kind == "init" {
                match handle_init(&node, &env) {
                    Ok(()) => {
                        if let Some((periodics, tasks)) = deferred.take() {
                            start_background(&node, periodics, tasks, &mut background);
                        }
                    }
                    Err(err) => warn!(%err, "bad init message"),
                }
                continue;
            }

            match handlers.get(&env.body.kind) {
                Some(handler) => {
                    let handler = handler.clone();
                    let node = node.clone();
                    let kind = env.body.kind.clone();
                    in_flight.spawn(async move {
                        // A failed handler never sends a response; an RPC
                        // caller on the other side times out instead.
                        if let Err(err) = handler(node, env).await {
                            warn!(%err, %kind, "handler failed");
                        }
                    });
                    // Reap whatever already finished.
                    while in_flight.try_join_next().is_some() {}
                }
                None => debug!(kind = %env.body.kind, "no handler registered, dropping"),
            }
        };

        // End of input: let in-flight handlers finish, stop the timers
        // and workers, then release the writer and wait for it to flush.
        while in_flight.join_next().await.is_some() {}
        abort_all(&mut background).await;
        drop(node);

        let write_result = match writer_task.await {
            Ok(res) => res,
            Err(err) => Err(NodeError::Protocol(format!("writer task panicked: {err}"))),
        };
        loop_result.and(write_result)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_init(node: &Node, env: &Envelope) -> Result<(), NodeError> {
    let init: InitPayload = env.body.payload()?;
    let mut node_ids = init.node_ids;
    node_ids.sort();
    if node
        .shared
        .identity
        .set(Identity {
            node_id: init.node_id,
            node_ids,
        })
        .is_err()
    {
        warn!("duplicate init message, keeping original identity");
    }
    node.reply(env, Body::new("init_ok"))
}

fn start_background(
    node: &Node,
    periodics: Vec<(Duration, Job)>,
    tasks: Vec<TaskFn>,
    background: &mut Vec<JoinHandle<()>>,
) {
    for (interval, job) in periodics {
        let node = node.clone();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first
            // run lands `interval` after init.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = job(node.clone()).await {
                    warn!(%err, "periodic job failed");
                }
            }
        }));
    }
    for task in tasks {
        background.push(tokio::spawn(task(node.clone())));
    }
}

async fn abort_all(background: &mut Vec<JoinHandle<()>>) {
    for handle in background.iter() {
        handle.abort();
    }
    for handle in background.drain(..) {
        let _ = handle.await;
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut writer: W,
) -> Result<(), NodeError> {
    while let Some(env) = rx.recv().await {
        let mut line = serde_json::to_vec(&env)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
