//! KV client tests against a scripted store.
//!
//! The node under test exposes trigger handlers that run one store
//! operation and report its outcome; the test side answers the store
//! RPCs the way lin-kv / seq-kv would.

use serde_json::{json, Value};
use skein_core::{Body, Envelope, NodeBuilder};
use skein_kv::{KvClient, KvError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

struct Harness {
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

fn outcome(result: Result<Value, KvError>) -> Body {
    let mut body = Body::new("outcome");
    match result {
        Ok(value) => body.extra.insert("ok".into(), value),
        Err(err) => body
            .extra
            .insert("err".into(), format!("{err:?}").into()),
    };
    body
}

async fn start() -> Harness {
    let builder = NodeBuilder::new()
        .handle("kv_read", |node, env| async move {
            let key = env.body.extra["key"].as_str().unwrap().to_string();
            let res = KvClient::lin(node.clone()).read::<i64>(&key).await;
            node.reply(&env, outcome(res.map(Value::from)))
        })
        .unwrap()
        .handle("kv_read_or_default", |node, env| async move {
            let key = env.body.extra["key"].as_str().unwrap().to_string();
            let res = KvClient::lin(node.clone()).read_or_default(&key, -1i64).await;
            node.reply(&env, outcome(res.map(Value::from)))
        })
        .unwrap()
        .handle("kv_write", |node, env| async move {
            let res = KvClient::seq(node.clone()).write("k", &42i64).await;
            node.reply(&env, outcome(res.map(|()| Value::Null)))
        })
        .unwrap()
        .handle("kv_cas", |node, env| async move {
            let res = KvClient::seq(node.clone()).cas("k", &1i64, &2i64, true).await;
            node.reply(&env, outcome(res.map(|()| Value::Null)))
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
        "body": {"type": "init", "msg_id": 1, "node_id": "n0", "node_ids": ["n0"]}
    }))
    .await;
    assert_eq!(h.recv().await.body.kind, "init_ok");
    h
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

    async fn trigger(&mut self, kind: &str, key: &str) {
        self.send(json!({
            "src": "c1", "dest": "n0",
            "body": {"type": kind, "msg_id": 99, "key": key}
        }))
        .await;
    }

    async fn answer_store(&mut self, service: &str, reply: Value) -> Envelope {
        let req = self.recv().await;
        assert_eq!(req.dest, service);
        let mut reply = reply;
        reply["in_reply_to"] = json!(req.body.msg_id);
        self.send(json!({"src": service, "dest": "n0", "body": reply}))
            .await;
        req
    }
}

#[tokio::test]
async fn test_read_returns_typed_value() {
    let mut h = start().await;
    h.trigger("kv_read", "counter").await;

    let req = h
        .answer_store("lin-kv", json!({"type": "read_ok", "value": 17}))
        .await;
    assert_eq!(req.body.kind, "read");
    assert_eq!(req.body.extra["key"], "counter");

    let out = h.recv().await;
    assert_eq!(out.body.extra["ok"], 17);
}

#[tokio::test]
async fn test_code_20_maps_to_not_found() {
    let mut h = start().await;
    h.trigger("kv_read", "missing").await;
    h.answer_store(
        "lin-kv",
        json!({"type": "error", "code": 20, "text": "key does not exist"}),
    )
    .await;

    let out = h.recv().await;
    assert_eq!(out.body.extra["err"].as_str().unwrap(), "NotFound");
}

#[tokio::test]
async fn test_read_or_default_swallows_not_found() {
    let mut h = start().await;
    h.trigger("kv_read_or_default", "missing").await;
    h.answer_store(
        "lin-kv",
        json!({"type": "error", "code": 20, "text": "key does not exist"}),
    )
    .await;

    let out = h.recv().await;
    assert_eq!(out.body.extra["ok"], -1);
}

#[tokio::test]
async fn test_code_22_maps_to_cas_conflict() {
    let mut h = start().await;
    h.trigger("kv_cas", "k").await;

    let req = h
        .answer_store(
            "seq-kv",
            json!({"type": "error", "code": 22, "text": "expected 1, had 5"}),
        )
        .await;
    assert_eq!(req.body.kind, "cas");
    assert_eq!(req.body.extra["from"], 1);
    assert_eq!(req.body.extra["to"], 2);
    assert_eq!(req.body.extra["create_if_not_exists"], true);

    let out = h.recv().await;
    assert_eq!(out.body.extra["err"].as_str().unwrap(), "CasConflict");
}

#[tokio::test]
async fn test_write_round_trip_and_generic_error() {
    let mut h = start().await;
    h.trigger("kv_write", "k").await;

    let req = h.answer_store("seq-kv", json!({"type": "write_ok"})).await;
    assert_eq!(req.body.kind, "write");
    assert_eq!(req.body.extra["value"], 42);
    let out = h.recv().await;
    assert!(out.body.extra.contains_key("ok"));

    // Generic failure keeps its code.
    h.trigger("kv_write", "k").await;
    h.answer_store("seq-kv", json!({"type": "error", "code": 13, "text": "crash"}))
        .await;
    let out = h.recv().await;
    assert!(out.body.extra["err"].as_str().unwrap().starts_with("Store"));
}
