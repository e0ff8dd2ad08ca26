use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{Inbound, Transport, TransportError};

const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Process-local gossip topic.
///
/// Every publication is fanned out to every joined member, the publisher
/// included. Delivery is at-most-once: a member whose inbox is full simply
/// misses the message.
#[derive(Clone)]
pub struct MemoryMesh {
    // member id -> inbox (None until the member subscribes)
    members: Arc<Mutex<HashMap<String, Option<mpsc::Sender<Vec<u8>>>>>>,
    inbox_capacity: usize,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_inbox_capacity(inbox_capacity: usize) -> Self {
        Self {
            members: Arc::new(Mutex::new(HashMap::new())),
            inbox_capacity: inbox_capacity.max(1),
        }
    }

    /// Adds a member to the topic. Joining with an id that is already present
    /// replaces the previous member.
    pub fn join(&self, id: impl Into<String>) -> MemoryTransport {
        let id = id.into();
        self.lock().insert(id.clone(), None);
        debug!("Member {id} joined the mesh");

        MemoryTransport {
            id,
            mesh: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn members(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<mpsc::Sender<Vec<u8>>>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryMesh {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryTransport {
    id: String,
    mesh: MemoryMesh,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Leaves the mesh. The subscription stream ends, further publishes fail
    /// and the remaining members stop counting this one as a live peer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mesh.lock().remove(&self.id);
        debug!("Member {} left the mesh", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn identity(&self) -> String {
        self.id.clone()
    }

    async fn subscribe(&self) -> Result<Inbound, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.mesh.inbox_capacity);
        let mut members = self.mesh.lock();
        match members.get_mut(&self.id) {
            Some(inbox) => {
                *inbox = Some(tx);
                Ok(rx)
            }
            None => Err(TransportError::Subscribe(format!(
                "{} is not a member of the mesh",
                self.id
            ))),
        }
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        // Snapshot the inboxes so the mesh lock is not held while sending.
        let inboxes: Vec<(String, mpsc::Sender<Vec<u8>>)> = self
            .mesh
            .lock()
            .iter()
            .filter_map(|(id, inbox)| inbox.clone().map(|tx| (id.clone(), tx)))
            .collect();

        for (id, tx) in inboxes {
            match tx.try_send(data.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Inbox of {id} is full, dropping message from {}", self.id);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        Ok(())
    }

    fn live_peer_count(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.mesh
            .lock()
            .keys()
            .filter(|id| **id != self.id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_member_including_sender() {
        let mesh = MemoryMesh::new();
        let a = mesh.join("a");
        let b = mesh.join("b");

        let mut a_in = a.subscribe().await.expect("subscribe a");
        let mut b_in = b.subscribe().await.expect("subscribe b");

        a.publish(b"hello".to_vec()).await.expect("publish");

        assert_eq!(a_in.recv().await.as_deref(), Some(&b"hello"[..]));
        assert_eq!(b_in.recv().await.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn live_peer_count_tracks_joins_and_closes() {
        let mesh = MemoryMesh::new();
        let a = mesh.join("a");
        assert_eq!(a.live_peer_count(), 0);

        let b = mesh.join("b");
        let c = mesh.join("c");
        assert_eq!(a.live_peer_count(), 2);
        assert_eq!(mesh.members(), vec!["a", "b", "c"]);

        c.close();
        assert_eq!(a.live_peer_count(), 1);
        assert_eq!(b.live_peer_count(), 1);
        assert_eq!(c.live_peer_count(), 0);
    }

    #[tokio::test]
    async fn closed_transport_ends_stream_and_rejects_publish() {
        let mesh = MemoryMesh::new();
        let a = mesh.join("a");
        let mut inbound = a.subscribe().await.expect("subscribe");

        a.close();

        assert!(inbound.recv().await.is_none());
        assert!(matches!(
            a.publish(b"late".to_vec()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.subscribe().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn full_inbox_drops_instead_of_blocking() {
        let mesh = MemoryMesh::with_inbox_capacity(1);
        let a = mesh.join("a");
        let mut inbound = a.subscribe().await.expect("subscribe");

        a.publish(b"first".to_vec()).await.expect("publish first");
        a.publish(b"second".to_vec()).await.expect("publish second");

        assert_eq!(inbound.recv().await.as_deref(), Some(&b"first"[..]));
        assert!(inbound.try_recv().is_err());
    }
}
