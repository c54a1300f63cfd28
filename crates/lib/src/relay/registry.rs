//! Connection registry: every live connection's client record plus the rooms they form.
//!
//! One lock guards both maps, so pairing decisions, renames, liveness sweeps, removal, and
//! broadcast iteration are mutually exclusive. Delivery under the lock is only an enqueue onto
//! the target connection's outbound queue; no socket I/O happens while the lock is held.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::relay::frame;
use crate::relay::pairing::Room;
use crate::relay::protocol::ServerMessage;

/// Random client identity (32 lowercase hex characters).
pub type ClientId = String;

/// Opaque room ticket; equal to the identity of the client that created the room.
pub type RoomTicket = String;

/// Frames a connection may have queued before it counts as stalled.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Outbound side of one connection: bounded FIFO queue of encoded frames plus an idempotent
/// close switch. The registry holds a clone; the connection's writer task owns the receiving end.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Vec<u8>>,
    closer: CancellationToken,
}

/// The frame was dropped: the writer is gone or the peer stopped draining its queue.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection writer has shut down")]
    Closed,
    #[error("outbound queue full ({OUTBOUND_CAPACITY} frames), closing connection")]
    Backlogged,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        Self::with_capacity(OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound,
                closer: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queue an already-encoded frame for the writer task. A full queue closes the connection,
    /// so its read loop tears it down like any other eviction.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        if self.closer.is_cancelled() {
            return Err(SendError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close();
                Err(SendError::Backlogged)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Close the connection. Safe to call any number of times from any task.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closer.cancelled()
    }

    /// Token the writer task watches; it does not keep the outbound queue open.
    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }
}

/// Stored per connection.
#[derive(Debug)]
pub(crate) struct ClientRecord {
    pub name: String,
    pub room: RoomTicket,
    pub alive: bool,
    pub conn: ConnectionHandle,
}

/// Read-only view of a client record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub room: RoomTicket,
    pub alive: bool,
    pub paired: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub clients: HashMap<ClientId, ClientRecord>,
    pub rooms: HashMap<RoomTicket, Room>,
}

impl RegistryState {
    /// Queue a server notification for one client; failures are logged and otherwise ignored.
    pub fn notify(&self, to: &str, message: &ServerMessage) {
        let Some(record) = self.clients.get(to) else {
            return;
        };
        match serde_json::to_string(message) {
            Ok(text) => {
                if let Err(e) = record.conn.send(frame::encode_text(&text)) {
                    log::error!("{}: error sending ws message: {}", to, e);
                }
            }
            Err(e) => log::error!("{}: error encoding ws message: {}", to, e),
        }
    }

    /// Queue `text` for every client in `room` except `from`. Returns how many were queued.
    pub fn broadcast(&self, from: &str, room: &str, text: &str) -> usize {
        let mut encoded: Option<Vec<u8>> = None;
        let mut delivered = 0;
        for (id, record) in &self.clients {
            if id == from || record.room != room {
                continue;
            }
            let frame = encoded
                .get_or_insert_with(|| frame::encode_text(text))
                .clone();
            match record.conn.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => log::error!("{}: error writing frame: {}", id, e),
            }
        }
        delivered
    }

    fn info(&self, id: &str) -> Option<ClientInfo> {
        let record = self.clients.get(id)?;
        let paired = self
            .rooms
            .get(&record.room)
            .map(|room| room.paired)
            .unwrap_or(false);
        Some(ClientInfo {
            id: id.to_string(),
            name: record.name.clone(),
            room: record.room.clone(),
            alive: record.alive,
            paired,
        })
    }
}

/// Shared registry of live connections and rooms.
pub struct Registry {
    pub(crate) inner: RwLock<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryState::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.clients.is_empty()
    }

    /// Snapshot of one client, including its room's paired flag.
    pub async fn client(&self, id: &str) -> Option<ClientInfo> {
        self.inner.read().await.info(id)
    }

    /// Set the client's display name.
    pub async fn rename(&self, id: &str, name: String) {
        let mut state = self.inner.write().await;
        if let Some(record) = state.clients.get_mut(id) {
            log::debug!("{}: renamed {:?} -> {:?}", id, record.name, name);
            record.name = name;
        }
    }

    /// Record an observed ping or pong from the client.
    pub async fn mark_alive(&self, id: &str) {
        if let Some(record) = self.inner.write().await.clients.get_mut(id) {
            record.alive = true;
        }
    }

    /// Relay a client message verbatim to the other members of `room`.
    pub async fn relay(&self, from: &str, room: &str, text: &str) -> usize {
        self.inner.read().await.broadcast(from, room, text)
    }

    /// Remove a client: broadcast its leave notice to the rest of its room, drop the record,
    /// and release its room slot. Returns the removed client's final state.
    pub async fn depart(&self, id: &str) -> Option<ClientInfo> {
        let mut state = self.inner.write().await;
        let info = state.info(id)?;

        let leave = ServerMessage::leave(&info.id, &info.name, &info.room);
        match serde_json::to_string(&leave) {
            Ok(text) => {
                state.broadcast(id, &info.room, &text);
            }
            Err(e) => log::error!("invalid server message: {}", e),
        }

        state.clients.remove(id);
        let now_empty = match state.rooms.get_mut(&info.room) {
            Some(room) => {
                room.release(id);
                room.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.rooms.remove(&info.room);
        }
        Some(info)
    }

    /// Close every registered connection (server shutdown). Each read loop tears itself down.
    pub async fn close_all(&self) {
        let state = self.inner.read().await;
        for record in state.clients.values() {
            record.conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testutil::next_json;

    #[tokio::test]
    async fn rename_is_visible_in_leave_notice() {
        let registry = Registry::new();
        let (a, mut a_rx) = ConnectionHandle::new();
        let (b, mut b_rx) = ConnectionHandle::new();
        let owner = registry.admit(None, a).await;
        let guest = registry.admit(Some(&owner.room), b).await;
        next_json(&mut a_rx).await;
        next_json(&mut a_rx).await;
        next_json(&mut b_rx).await;

        registry.rename(&guest.id, "Bea".into()).await;
        assert_eq!(registry.client(&guest.id).await.unwrap().name, "Bea");

        let gone = registry.depart(&guest.id).await.unwrap();
        assert_eq!(gone.name, "Bea");
        let leave = next_json(&mut a_rx).await;
        assert_eq!(leave["type"], "server:leave");
        assert_eq!(leave["id"], guest.id.as_str());
        assert_eq!(leave["name"], "Bea");
        assert_eq!(leave["roomId"], owner.room.as_str());
        assert!(a_rx.try_recv().is_err());
        assert!(registry.client(&guest.id).await.is_none());
    }

    #[tokio::test]
    async fn relay_skips_sender_and_other_rooms() {
        let registry = Registry::new();
        let (a, mut a_rx) = ConnectionHandle::new();
        let (b, mut b_rx) = ConnectionHandle::new();
        let (c, mut c_rx) = ConnectionHandle::new();
        let owner = registry.admit(None, a).await;
        let guest = registry.admit(Some(&owner.room), b).await;
        let _loner = registry.admit(None, c).await;
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}
        while c_rx.try_recv().is_ok() {}

        let text = format!(r#"{{"type":"chat","roomId":"{}"}}"#, owner.room);
        assert_eq!(registry.relay(&guest.id, &owner.room, &text).await, 1);
        let got = next_json(&mut a_rx).await;
        assert_eq!(got["type"], "chat");
        assert!(b_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_handle_refuses_frames() {
        let (conn, _rx) = ConnectionHandle::new();
        assert!(conn.send(vec![1]).is_ok());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(conn.send(vec![1]), Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn full_queue_closes_the_connection() {
        let (conn, mut rx) = ConnectionHandle::with_capacity(4);
        for i in 0..4u8 {
            conn.send(vec![i]).unwrap();
        }
        assert!(!conn.is_closed());
        assert!(matches!(conn.send(vec![4]), Err(SendError::Backlogged)));
        assert!(conn.is_closed());
        assert!(matches!(conn.send(vec![5]), Err(SendError::Closed)));
        // Frames queued before the overflow are still there for the writer to drop.
        assert_eq!(rx.recv().await, Some(vec![0]));
    }

    #[tokio::test]
    async fn stalled_peer_is_evicted_from_relay() {
        let registry = Registry::new();
        let (a, mut a_rx) = ConnectionHandle::new();
        let (b, _b_rx) = ConnectionHandle::new();
        let owner = registry.admit(None, a).await;
        let guest = registry.admit(Some(&owner.room), b).await;
        while a_rx.try_recv().is_ok() {}

        let payload = "x".repeat(64 * 1024);
        let text = format!(r#"{{"type":"blob","roomId":"{}","data":"{}"}}"#, owner.room, payload);
        let mut queued = 0;
        for round in 0..2000 {
            queued += registry.relay(&owner.id, &owner.room, &text).await;
            if round % 100 == 0 {
                // Unsolicited pongs keep the liveness flag up; they must not keep it queueing.
                registry.sweep().await;
                registry.mark_alive(&owner.id).await;
                registry.mark_alive(&guest.id).await;
            }
        }
        assert!(queued <= OUTBOUND_CAPACITY, "queued {} frames for a stalled peer", queued);
        let guest_conn = registry.inner.read().await.clients[&guest.id].conn.clone();
        assert!(guest_conn.is_closed());
    }
}
