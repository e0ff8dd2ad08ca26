//! Gossip transport seam.
//!
//! The election protocol only needs four things from the mesh it rides on: a
//! stable identity, an inbound stream of opaque payloads, a fire-and-forget
//! publish, and the number of peers currently visible on the topic. Real
//! deployments plug a pub/sub network in here; [`memory`] provides a
//! process-local mesh for tests and the `simulate` command.

mod error;
pub mod memory;

pub use self::error::TransportError;
pub use self::memory::{MemoryMesh, MemoryTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound side of a topic subscription. The stream ends when the transport
/// is closed.
pub type Inbound = mpsc::Receiver<Vec<u8>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of this process on the mesh. Must be stable for the lifetime
    /// of the transport.
    fn identity(&self) -> String;

    /// Joins the topic. Publications from every member, including this one,
    /// are delivered to the returned stream.
    async fn subscribe(&self) -> Result<Inbound, TransportError>;

    async fn publish(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Peers currently visible on the topic, excluding this process.
    fn live_peer_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_error_kind() {
        assert!(format!("{}", TransportError::Closed).contains("closed"));

        let publish = TransportError::Publish("queue full".to_string());
        assert!(format!("{publish}").contains("Publish error"));

        let subscribe = TransportError::Subscribe("no topic".to_string());
        assert!(format!("{subscribe}").contains("no topic"));
    }
}
