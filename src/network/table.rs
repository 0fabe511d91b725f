//! Peer connection table
//!
//! Maps peer identifiers to their single live connection. All mutations go
//! through one lock, so replacing an entry and marking the old one closed
//! happen together: a sender that looks the peer up afterwards always sees
//! the new connection, and a sender still holding the old handle gets a
//! `Disconnected` error instead of writing to a half-replaced socket.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::network::connection::PeerConnection;

/// Result of offering a connection to the table
#[derive(Debug)]
pub enum Offer {
    /// The connection was inserted; holds the entry it replaced, already closed
    Inserted(Option<Arc<PeerConnection>>),
    /// The existing entry was kept; the offered connection was not inserted
    Kept(Arc<PeerConnection>),
}

/// Concurrency-safe map of live peer connections
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: RwLock<HashMap<String, Arc<PeerConnection>>>,
}

impl PeerTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connection, closing any entry it replaces
    ///
    /// Returns the replaced connection, already closed.
    pub async fn upsert(&self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        match self.offer(conn, |_, _| false).await {
            Offer::Inserted(previous) => previous,
            Offer::Kept(_) => None,
        }
    }

    /// Inserts a connection unless `keep_existing` prefers the open entry
    ///
    /// The choice is made under the table lock, so two connections for the
    /// same peer offered at once are always ordered.
    pub async fn offer<F>(&self, conn: Arc<PeerConnection>, keep_existing: F) -> Offer
    where
        F: FnOnce(&PeerConnection, &PeerConnection) -> bool,
    {
        let peer_id = conn.peer_id().to_string();
        let previous = {
            let mut entries = self.entries.write().await;
            if let Some(existing) = entries.get(&peer_id) {
                if !existing.is_closed() && keep_existing(existing, &conn) {
                    return Offer::Kept(existing.clone());
                }
            }
            let previous = entries.insert(peer_id.clone(), conn);
            if let Some(prev) = &previous {
                prev.mark_closed();
            }
            previous
        };

        if let Some(prev) = &previous {
            info!(
                "Replacing connection {} to {} (from {})",
                prev.id(),
                peer_id,
                prev.remote_addr()
            );
            prev.shutdown_socket().await;
        } else {
            debug!("Added connection to {}", peer_id);
        }

        Offer::Inserted(previous)
    }

    /// Removes a peer's entry without closing it
    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.entries.write().await.remove(peer_id)
    }

    /// Removes the entry only if it is still the given connection
    ///
    /// Stale readers and senders use this so they never evict a newer
    /// connection that replaced theirs.
    pub async fn remove_if_current(
        &self,
        peer_id: &str,
        connection_id: u64,
    ) -> Option<Arc<PeerConnection>> {
        let mut entries = self.entries.write().await;
        match entries.get(peer_id) {
            Some(conn) if conn.id() == connection_id => entries.remove(peer_id),
            _ => None,
        }
    }

    /// Looks up a peer's live connection
    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.entries.read().await.get(peer_id).cloned()
    }

    /// Checks whether a peer has a live entry
    pub async fn contains(&self, peer_id: &str) -> bool {
        self.entries.read().await.contains_key(peer_id)
    }

    /// Copies out the current connections for scanning without the lock
    pub async fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Identifiers of all connected peers
    pub async fn peer_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if no peers are connected
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Removes and returns every entry
    pub async fn drain(&self) -> Vec<Arc<PeerConnection>> {
        self.entries.write().await.drain().map(|(_, conn)| conn).collect()
    }
}
