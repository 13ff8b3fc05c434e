//! Workloads with no cross-message state: echo and unique ids.

use serde_json::Value;
use skein_core::{Body, Envelope, Node, NodeBuilder, NodeError};
use ulid::Ulid;

/// Echo node: every `echo` request gets an `echo_ok` carrying the same
/// payload fields back.
pub fn echo() -> Result<NodeBuilder, NodeError> {
    NodeBuilder::new().handle("echo", |node: Node, env: Envelope| async move {
        let mut body = Body::new("echo_ok");
        body.extra = env.body.extra.clone();
        node.reply(&env, body)
    })
}

/// Unique-id node: each `generate` request is answered with a fresh
/// ULID. Ids embed a timestamp and 80 bits of randomness, so replicas
/// never need to coordinate.
pub fn unique_ids() -> Result<NodeBuilder, NodeError> {
    NodeBuilder::new().handle("generate", |node: Node, env: Envelope| async move {
        let mut body = Body::new("generate_ok");
        body.extra
            .insert("id".into(), Value::from(Ulid::new().to_string()));
        node.reply(&env, body)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_payload_is_mirrored() {
        let mut request = Body::new("echo");
        request
            .extra
            .insert("echo".into(), Value::from("hello there"));

        let mut reply = Body::new("echo_ok");
        reply.extra = request.extra.clone();
        assert_eq!(reply.extra["echo"], "hello there");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = Ulid::new().to_string();
        let b = Ulid::new().to_string();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }
}
