//! Counter node tests against a scripted seq-kv store.

use std::time::Duration;

use serde_json::{json, Value};
use skein_core::Envelope;
use skein_counter::Config;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

const TICK: Duration = Duration::from_millis(50);

struct Harness {
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Harness {
    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        let line = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Next message addressed to the store (skips client replies).
    async fn recv_store(&mut self) -> Envelope {
        loop {
            let env = self.recv().await;
            if env.dest == "seq-kv" {
                return env;
            }
        }
    }

    async fn answer(&mut self, req: &Envelope, mut body: Value) {
        body["in_reply_to"] = json!(req.body.msg_id);
        self.send(json!({"src": "seq-kv", "dest": "n0", "body": body}))
            .await;
    }

    /// Ask the node for its counter value. Flush reads that race with
    /// the request are fed `stored`, the store's current base.
    async fn client_read(&mut self, stored: i64) -> i64 {
        self.send(json!({
            "src": "c1", "dest": "n0",
            "body": {"type": "read", "msg_id": 400}
        }))
        .await;
        loop {
            let env = self.recv().await;
            if env.dest == "c1" && env.body.kind == "read_ok" {
                return env.body.extra["value"].as_i64().unwrap();
            }
            if env.dest == "seq-kv" && env.body.kind == "read" {
                self.answer(&env, json!({"type": "read_ok", "value": stored}))
                    .await;
            }
        }
    }
}

async fn start() -> Harness {
    let builder = skein_counter::builder(Config {
        flush_interval: TICK,
        store_key: "gcounter".into(),
    })
    .unwrap();

    let (test_side, node_side) = tokio::io::duplex(64 * 1024);
    let (node_read, node_write) = tokio::io::split(node_side);
    tokio::spawn(builder.serve(node_read, node_write));
    let (test_read, test_write) = tokio::io::split(test_side);
    let mut h = Harness {
        lines: BufReader::new(test_read).lines(),
        writer: test_write,
    };

    h.send(json!({
        "src": "c0", "dest": "n0",
        "body": {"type": "init", "msg_id": 1, "node_id": "n0", "node_ids": ["n0", "n1"]}
    }))
    .await;
    assert_eq!(h.recv().await.body.kind, "init_ok");
    h
}

#[tokio::test]
async fn test_add_acks_immediately_and_flushes_via_cas() {
    let mut h = start().await;

    h.send(json!({
        "src": "c1", "dest": "n0",
        "body": {"type": "add", "msg_id": 2, "delta": 5}
    }))
    .await;
    let ack = h.recv().await;
    assert_eq!(ack.body.kind, "add_ok");
    assert_eq!(ack.body.in_reply_to, Some(2));

    // First flush: the key does not exist yet, so the base defaults to 0
    // and the CAS creates it.
    let read = h.recv_store().await;
    assert_eq!(read.body.kind, "read");
    assert_eq!(read.body.extra["key"], "gcounter");
    h.answer(&read, json!({"type": "error", "code": 20, "text": "key does not exist"}))
        .await;

    let cas = h.recv_store().await;
    assert_eq!(cas.body.kind, "cas");
    assert_eq!(cas.body.extra["from"], 0);
    assert_eq!(cas.body.extra["to"], 5);
    assert_eq!(cas.body.extra["create_if_not_exists"], true);
    h.answer(&cas, json!({"type": "cas_ok"})).await;

    // Once the delta is durable, later ticks read the base but skip the
    // CAS entirely.
    let read = h.recv_store().await;
    assert_eq!(read.body.kind, "read");
    h.answer(&read, json!({"type": "read_ok", "value": 5})).await;
    let next = h.recv_store().await;
    assert_eq!(next.body.kind, "read", "zero delta must not CAS");
    h.answer(&next, json!({"type": "read_ok", "value": 5})).await;
}

#[tokio::test]
async fn test_cas_conflict_retries_with_fresh_base() {
    let mut h = start().await;

    h.send(json!({
        "src": "c1", "dest": "n0",
        "body": {"type": "add", "msg_id": 2, "delta": 5}
    }))
    .await;
    assert_eq!(h.recv().await.body.kind, "add_ok");

    // Another node bumped the base between our read and our CAS.
    let read = h.recv_store().await;
    h.answer(&read, json!({"type": "read_ok", "value": 10})).await;
    let cas = h.recv_store().await;
    assert_eq!(cas.body.extra["from"], 10);
    assert_eq!(cas.body.extra["to"], 15);
    h.answer(&cas, json!({"type": "error", "code": 22, "text": "expected 10, had 12"}))
        .await;

    // The delta is intact; the next tick retries against the new base.
    let read = h.recv_store().await;
    assert_eq!(read.body.kind, "read");
    h.answer(&read, json!({"type": "read_ok", "value": 12})).await;
    let cas = h.recv_store().await;
    assert_eq!(cas.body.extra["from"], 12);
    assert_eq!(cas.body.extra["to"], 17);
    h.answer(&cas, json!({"type": "cas_ok"})).await;
}

#[tokio::test]
async fn test_read_serves_last_observed_base() {
    let mut h = start().await;

    // Before any flush lands, reads serve zero.
    assert_eq!(h.client_read(0).await, 0);

    h.send(json!({
        "src": "c1", "dest": "n0",
        "body": {"type": "add", "msg_id": 3, "delta": 7}
    }))
    .await;
    assert_eq!(h.recv().await.body.kind, "add_ok");

    let read = h.recv_store().await;
    h.answer(&read, json!({"type": "read_ok", "value": 20})).await;
    let cas = h.recv_store().await;
    assert_eq!(cas.body.extra["to"], 27);
    h.answer(&cas, json!({"type": "cas_ok"})).await;

    // The flushed total is now the locally observed durable base.
    assert_eq!(h.client_read(27).await, 27);
}
