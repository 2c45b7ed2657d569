//! Broadcast hub
//!
//! Fan-out point for log/status events. Each connected client is represented
//! by the sender side of its session's outbound queue; the session's writer
//! task is the only thing that touches the socket, so broadcast never blocks
//! on a slow peer and frames never interleave.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use espbridge_core::{LogEvent, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies one registered client
pub type ClientId = u64;

struct ClientHandle {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Registry of connected control clients
#[derive(Default)]
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client's outbound queue; returns its id
    pub fn register(&self, addr: SocketAddr, tx: mpsc::UnboundedSender<ServerMessage>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients.lock().insert(id, ClientHandle { addr, tx });
        debug!(client = %addr, id, "Registered control client");
        id
    }

    /// Remove a client; returns whether it was still registered
    pub fn unregister(&self, id: ClientId) -> bool {
        match self.clients.lock().remove(&id) {
            Some(handle) => {
                debug!(client = %handle.addr, id, "Unregistered control client");
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every registered client
    ///
    /// The client set is snapshotted first so the lock is never held while
    /// enqueueing. Clients whose queue is gone are dropped from the set;
    /// delivery to the others continues regardless.
    pub fn broadcast(&self, event: &LogEvent) {
        let message = event.to_message();
        let snapshot: Vec<(ClientId, mpsc::UnboundedSender<ServerMessage>)> = {
            let clients = self.clients.lock();
            clients
                .iter()
                .map(|(id, handle)| (*id, handle.tx.clone()))
                .collect()
        };

        for (id, tx) in snapshot {
            if tx.send(message.clone()).is_err() {
                self.unregister(id);
            }
        }
    }

    /// Number of currently registered clients
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn broadcast_reaches_all_registered_clients() {
        let hub = BroadcastHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register(test_addr(1000), tx_a);
        hub.register(test_addr(1001), tx_b);

        hub.broadcast(&LogEvent::device_line("MainPCB", "boot ok"));

        let expected = ServerMessage::Log {
            device: "MainPCB".to_string(),
            text: "boot ok".to_string(),
        };
        assert_eq!(rx_a.recv().await.unwrap(), expected);
        assert_eq!(rx_b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn unregistered_client_stops_receiving() {
        let hub = BroadcastHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let id_a = hub.register(test_addr(1000), tx_a);
        hub.register(test_addr(1001), tx_b);

        assert!(hub.unregister(id_a));
        hub.broadcast(&LogEvent::device_line("MainPCB", "second"));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_some());
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn dead_queue_is_evicted_without_hurting_others() {
        let hub = BroadcastHub::new();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register(test_addr(1000), tx_a);
        hub.register(test_addr(1001), tx_b);
        drop(rx_a);

        hub.broadcast(&LogEvent::device_line("SlavePCB", "ping"));

        assert_eq!(hub.client_count(), 1);
        assert!(rx_b.recv().await.is_some());
    }
}
