pub mod envelope;
pub mod error;
pub mod node;

pub use envelope::{Body, Envelope, ErrorPayload};
pub use error::NodeError;
pub use node::{Node, NodeBuilder, DEFAULT_RPC_TIMEOUT};
