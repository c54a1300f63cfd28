//! Room pairing: each new connection either opens a room or joins the one its ticket names.
//!
//! A room holds at most two members. The first arrival on a ticket owns it; the paired flag is
//! set once when the second arrives and blocks further joins. A client asking for a paired room
//! gets a fresh room of its own plus a `room:full` notice.

use uuid::Uuid;

use crate::relay::protocol::ServerMessage;
use crate::relay::registry::{
    ClientId, ClientRecord, ConnectionHandle, Registry, RegistryState, RoomTicket,
};

/// Room entity: owner, optional second member, and the paired flag both members share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Room {
    /// None once the owner has left; the ticket then no longer admits joiners.
    pub owner: Option<ClientId>,
    pub guest: Option<ClientId>,
    pub paired: bool,
}

impl Room {
    fn open(owner: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            guest: None,
            paired: false,
        }
    }

    /// Free the departing client's slot. Any departure unpairs the room.
    pub fn release(&mut self, id: &str) {
        if self.owner.as_deref() == Some(id) {
            self.owner = None;
        }
        if self.guest.as_deref() == Some(id) {
            self.guest = None;
        }
        self.paired = false;
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.guest.is_none()
    }
}

/// How a new connection was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Opened its own room. `redirected` is true when the requested room was already full.
    Opened { redirected: bool },
    /// Joined the room owned by `owner`.
    Joined { owner: ClientId },
}

/// Result of admitting a connection into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub id: ClientId,
    pub name: String,
    pub room: RoomTicket,
    pub placement: Placement,
}

/// Default display name: `Anon#` plus the first four characters of the identity.
pub fn default_name(id: &str) -> String {
    format!("Anon#{}", id.get(..4).unwrap_or(id))
}

/// Fresh identity that collides with no registered client and no held room ticket.
fn mint_id(state: &RegistryState) -> ClientId {
    loop {
        let id = Uuid::new_v4().simple().to_string();
        if !state.clients.contains_key(&id) && !state.rooms.contains_key(&id) {
            return id;
        }
    }
}

/// What a requested ticket resolves to: joinable, full, or nothing.
enum Resolved {
    Open { ticket: RoomTicket, owner: ClientId },
    Full,
    Missing,
}

fn resolve(state: &RegistryState, requested: Option<&str>) -> Resolved {
    let Some(ticket) = requested.map(str::trim).filter(|t| !t.is_empty()) else {
        return Resolved::Missing;
    };
    let Some(room) = state.rooms.get(ticket) else {
        log::debug!("requested room {} not found", ticket);
        return Resolved::Missing;
    };
    match (&room.owner, room.paired) {
        (None, _) => Resolved::Missing,
        (Some(_), true) => Resolved::Full,
        (Some(owner), false) => Resolved::Open {
            ticket: ticket.to_string(),
            owner: owner.clone(),
        },
    }
}

impl Registry {
    /// Register a freshly upgraded connection, placing it in a room and queueing the
    /// join notifications (`room:full` first when redirected, then `server:join`; the owner
    /// of a joined room gets `room:join`).
    pub async fn admit(&self, requested: Option<&str>, conn: ConnectionHandle) -> Admission {
        let mut state = self.inner.write().await;
        let id = mint_id(&state);
        let name = default_name(&id);
        let record = |room: &str, conn: ConnectionHandle| ClientRecord {
            name: name.clone(),
            room: room.to_string(),
            alive: true,
            conn,
        };

        let admission = match resolve(&state, requested) {
            Resolved::Open { ticket, owner } => {
                if let Some(room) = state.rooms.get_mut(&ticket) {
                    room.guest = Some(id.clone());
                    room.paired = true;
                }
                let owner_name = state
                    .clients
                    .get(&owner)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                state.clients.insert(id.clone(), record(&ticket, conn));
                state.notify(&owner, &ServerMessage::room_join(&id, &name, &ticket));
                state.notify(&id, &ServerMessage::join(&id, &name, &ticket, Some(owner_name)));
                Admission {
                    id,
                    name,
                    room: ticket,
                    placement: Placement::Joined { owner },
                }
            }
            resolved => {
                let redirected = matches!(resolved, Resolved::Full);
                state.rooms.insert(id.clone(), Room::open(&id));
                state.clients.insert(id.clone(), record(&id, conn));
                if redirected {
                    state.notify(&id, &ServerMessage::room_full(&id, &id));
                }
                state.notify(&id, &ServerMessage::join(&id, &name, &id, None));
                Admission {
                    room: id.clone(),
                    id,
                    name,
                    placement: Placement::Opened { redirected },
                }
            }
        };
        log::debug!(
            "{}: websocket connection established in room {}",
            admission.id,
            admission.room
        );
        admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testutil::next_json;

    #[test]
    fn default_name_uses_identity_prefix() {
        assert_eq!(default_name("3fa9c2d1"), "Anon#3fa9");
        assert_eq!(default_name("ab"), "Anon#ab");
    }

    #[tokio::test]
    async fn first_connection_owns_a_fresh_room() {
        let registry = Registry::new();
        let (conn, mut rx) = ConnectionHandle::new();
        let a = registry.admit(None, conn).await;

        assert_eq!(a.room, a.id);
        assert_eq!(a.id.len(), 32);
        assert_eq!(a.placement, Placement::Opened { redirected: false });
        let info = registry.client(&a.id).await.unwrap();
        assert!(!info.paired);
        assert!(info.alive);

        let join = next_json(&mut rx).await;
        assert_eq!(join["type"], "server:join");
        assert_eq!(join["id"], a.id.as_str());
        assert_eq!(join["name"], a.name.as_str());
        assert_eq!(join["roomId"], a.room.as_str());
        assert!(join.get("ownerName").is_none());
    }

    #[tokio::test]
    async fn second_connection_pairs_and_third_is_redirected() {
        let registry = Registry::new();
        let (a_conn, mut a_rx) = ConnectionHandle::new();
        let (b_conn, mut b_rx) = ConnectionHandle::new();
        let (c_conn, mut c_rx) = ConnectionHandle::new();

        let a = registry.admit(None, a_conn).await;
        next_json(&mut a_rx).await;
        registry.rename(&a.id, "Ann".into()).await;

        let b = registry.admit(Some(&a.room), b_conn).await;
        assert_eq!(b.room, a.room);
        assert_eq!(b.placement, Placement::Joined { owner: a.id.clone() });
        assert!(registry.client(&a.id).await.unwrap().paired);
        assert!(registry.client(&b.id).await.unwrap().paired);

        let to_owner = next_json(&mut a_rx).await;
        assert_eq!(to_owner["type"], "room:join");
        assert_eq!(to_owner["id"], b.id.as_str());
        assert_eq!(to_owner["name"], b.name.as_str());
        let to_guest = next_json(&mut b_rx).await;
        assert_eq!(to_guest["type"], "server:join");
        assert_eq!(to_guest["ownerName"], "Ann");
        assert_eq!(to_guest["roomId"], a.room.as_str());

        let c = registry.admit(Some(&a.room), c_conn).await;
        assert_eq!(c.placement, Placement::Opened { redirected: true });
        assert_eq!(c.room, c.id);
        assert!(!registry.client(&c.id).await.unwrap().paired);
        let full = next_json(&mut c_rx).await;
        assert_eq!(full["type"], "room:full");
        assert_eq!(full["roomId"], c.room.as_str());
        assert_eq!(next_json(&mut c_rx).await["type"], "server:join");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_ticket_opens_new_room() {
        let registry = Registry::new();
        let (conn, _rx) = ConnectionHandle::new();
        let a = registry.admit(Some("no-such-room"), conn).await;
        assert_eq!(a.placement, Placement::Opened { redirected: false });
        assert_eq!(a.room, a.id);
    }

    #[tokio::test]
    async fn guest_departure_reopens_room() {
        let registry = Registry::new();
        let (a_conn, _a_rx) = ConnectionHandle::new();
        let (b_conn, _b_rx) = ConnectionHandle::new();
        let (c_conn, _c_rx) = ConnectionHandle::new();
        let a = registry.admit(None, a_conn).await;
        let b = registry.admit(Some(&a.room), b_conn).await;

        registry.depart(&b.id).await;
        assert!(!registry.client(&a.id).await.unwrap().paired);

        let c = registry.admit(Some(&a.room), c_conn).await;
        assert_eq!(c.placement, Placement::Joined { owner: a.id.clone() });
    }

    #[tokio::test]
    async fn owner_departure_closes_ticket() {
        let registry = Registry::new();
        let (a_conn, _a_rx) = ConnectionHandle::new();
        let (b_conn, _b_rx) = ConnectionHandle::new();
        let (c_conn, _c_rx) = ConnectionHandle::new();
        let a = registry.admit(None, a_conn).await;
        let b = registry.admit(Some(&a.room), b_conn).await;

        registry.depart(&a.id).await;
        assert_eq!(registry.client(&b.id).await.unwrap().room, a.room);

        let c = registry.admit(Some(&a.room), c_conn).await;
        assert_eq!(c.placement, Placement::Opened { redirected: false });
        assert_ne!(c.room, a.room);

        registry.depart(&b.id).await;
        assert!(registry.inner.read().await.rooms.get(&a.room).is_none());
    }
}
