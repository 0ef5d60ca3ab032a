/// Connection Hub
///
/// The hub owns every live client and every room. It is shared by all actix
/// workers behind one `RwLock`; frames are handed to each client's unbounded
/// outbound queue so no lock is ever held across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::error::RelayError;
use crate::core::protocol::{self, EventFrame};

pub type ConnId = String;

/// Longest accepted room name, in characters.
pub const MAX_ROOM_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    EventStream,
}

/// Who a broadcast is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Room(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    pub members: usize,
}

#[derive(Debug)]
struct Client {
    transport: Transport,
    sender: mpsc::UnboundedSender<String>,
    rooms: HashSet<String>,
    connected_at: Instant,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<ConnId, Client>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

/// Counters exposed on `/metrics`.
#[derive(Default)]
pub struct HubStats {
    pub connections_total: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
}

#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
    pub stats: HubStats,
}

/// Check a room name and return its canonical (trimmed) form.
pub fn validate_room(name: &str) -> Result<String, RelayError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RelayError::InvalidRoom("room name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(RelayError::InvalidRoom(format!(
            "room name exceeds {MAX_ROOM_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(RelayError::InvalidRoom(
            "room name must not contain control characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client and hand back its id and outbound queue.
    pub fn connect(&self, transport: Transport) -> (ConnId, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.inner.write().clients.insert(
            conn_id.clone(),
            Client {
                transport,
                sender,
                rooms: HashSet::new(),
                connected_at: Instant::now(),
            },
        );
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        info!(conn_id = %conn_id, ?transport, "client connected");
        (conn_id, receiver)
    }

    /// Remove a client from the hub and every room it belonged to.
    ///
    /// Remaining members of those rooms receive a `left` event. Returns
    /// `false` when the client was already gone.
    pub fn disconnect(&self, conn_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(client) = inner.clients.remove(conn_id) else {
            return false;
        };

        let mut rooms: Vec<String> = client.rooms.into_iter().collect();
        rooms.sort();
        for room in &rooms {
            inner.remove_member(room, conn_id);
            let frame = EventFrame::new("left", json!({ "id": conn_id, "room": room })).in_room(room.as_str());
            inner.fan_out(&self.stats, &Target::Room(room.clone()), &frame, None);
        }

        info!(
            conn_id = %conn_id,
            transport = ?client.transport,
            rooms = rooms.len(),
            connected_secs = client.connected_at.elapsed().as_secs(),
            "client disconnected"
        );
        true
    }

    /// Add a client to a room and return the room's member count.
    ///
    /// Joining a room twice is a no-op; other members are only notified on
    /// the first join.
    pub fn join(&self, conn_id: &str, room: &str) -> Result<usize, RelayError> {
        let room = validate_room(room)?;
        let mut inner = self.inner.write();
        let client = inner
            .clients
            .get_mut(conn_id)
            .ok_or_else(|| RelayError::UnknownConnection(conn_id.to_string()))?;

        let newly_joined = client.rooms.insert(room.clone());
        let members = inner.rooms.entry(room.clone()).or_default();
        members.insert(conn_id.to_string());
        let count = members.len();

        if newly_joined {
            debug!(conn_id = %conn_id, room = %room, members = count, "joined room");
            let frame = EventFrame::new("joined", json!({ "id": conn_id, "room": room })).in_room(room.as_str());
            inner.fan_out(&self.stats, &Target::Room(room.clone()), &frame, Some(conn_id));
        }
        Ok(count)
    }

    /// Remove a client from a room. Returns whether it was a member.
    pub fn leave(&self, conn_id: &str, room: &str) -> Result<bool, RelayError> {
        let room = validate_room(room)?;
        let mut inner = self.inner.write();
        let client = inner
            .clients
            .get_mut(conn_id)
            .ok_or_else(|| RelayError::UnknownConnection(conn_id.to_string()))?;

        if !client.rooms.remove(&room) {
            return Ok(false);
        }
        inner.remove_member(&room, conn_id);
        debug!(conn_id = %conn_id, room = %room, "left room");

        let frame = EventFrame::new("left", json!({ "id": conn_id, "room": room })).in_room(room.as_str());
        inner.fan_out(&self.stats, &Target::Room(room.clone()), &frame, None);
        Ok(true)
    }

    pub fn is_member(&self, conn_id: &str, room: &str) -> bool {
        self.inner
            .read()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(conn_id))
    }

    /// Rooms a client belongs to, sorted by name.
    pub fn rooms_of(&self, conn_id: &str) -> Result<Vec<String>, RelayError> {
        let inner = self.inner.read();
        let client = inner
            .clients
            .get(conn_id)
            .ok_or_else(|| RelayError::UnknownConnection(conn_id.to_string()))?;
        let mut rooms: Vec<String> = client.rooms.iter().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }

    /// Queue a frame for a single client.
    pub fn emit_to(&self, conn_id: &str, frame: &EventFrame) -> Result<bool, RelayError> {
        let text = protocol::encode(frame)?;
        let inner = self.inner.read();
        let Some(client) = inner.clients.get(conn_id) else {
            return Ok(false);
        };
        let sent = client.sender.send(text).is_ok();
        if sent {
            self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(sent)
    }

    /// Queue a frame for every client addressed by `target`, skipping
    /// `except`. Returns the number of clients the frame was queued for.
    ///
    /// Clients whose queue has been dropped are disconnected afterwards.
    pub fn broadcast(
        &self,
        target: &Target,
        frame: &EventFrame,
        except: Option<&str>,
    ) -> Result<usize, RelayError> {
        let text = protocol::encode(frame)?;
        let (delivered, dead) = {
            let inner = self.inner.read();
            inner.send_all(&self.stats, target, &text, except)
        };
        for conn_id in dead {
            debug!(conn_id = %conn_id, "pruning closed client");
            self.disconnect(&conn_id);
        }
        Ok(delivered)
    }

    /// All non-empty rooms with their member counts, sorted by name.
    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        let inner = self.inner.read();
        let mut rooms: Vec<RoomSummary> = inner
            .rooms
            .iter()
            .map(|(name, members)| RoomSummary {
                name: name.clone(),
                members: members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Members of a room, sorted, or `None` if the room does not exist.
    pub fn room_members(&self, room: &str) -> Option<Vec<ConnId>> {
        let inner = self.inner.read();
        inner.rooms.get(room).map(|members| {
            let mut members: Vec<ConnId> = members.iter().cloned().collect();
            members.sort();
            members
        })
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }
}

impl HubInner {
    fn remove_member(&mut self, room: &str, conn_id: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Send without pruning; used for notifications issued under the write
    /// lock. Closed clients are picked up by the next `Hub::broadcast`.
    fn fan_out(&self, stats: &HubStats, target: &Target, frame: &EventFrame, except: Option<&str>) {
        match protocol::encode(frame) {
            Ok(text) => {
                self.send_all(stats, target, &text, except);
            }
            Err(e) => tracing::warn!(error = %e, event = %frame.event, "failed to encode notification"),
        }
    }

    fn send_all(
        &self,
        stats: &HubStats,
        target: &Target,
        text: &str,
        except: Option<&str>,
    ) -> (usize, Vec<ConnId>) {
        let recipients: Vec<&ConnId> = match target {
            Target::All => self.clients.keys().collect(),
            Target::Room(room) => match self.rooms.get(room) {
                Some(members) => members.iter().collect(),
                None => Vec::new(),
            },
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn_id in recipients {
            if except == Some(conn_id.as_str()) {
                continue;
            }
            let Some(client) = self.clients.get(conn_id) else {
                continue;
            };
            if client.sender.send(text.to_string()).is_ok() {
                delivered += 1;
            } else {
                dead.push(conn_id.clone());
            }
        }
        stats.frames_out.fetch_add(delivered as u64, Ordering::Relaxed);
        (delivered, dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[test]
    fn join_notifies_existing_members_only() {
        let hub = Hub::new();
        let (a, mut rx_a) = hub.connect(Transport::WebSocket);
        let (b, mut rx_b) = hub.connect(Transport::WebSocket);

        assert_eq!(hub.join(&a, "lobby").unwrap(), 1);
        assert!(drain(&mut rx_a).is_empty());

        assert_eq!(hub.join(&b, " lobby ").unwrap(), 2);
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "joined");
        assert_eq!(frames[0]["data"]["id"], b.as_str());
        assert!(drain(&mut rx_b).is_empty());

        // Idempotent join: no second notification.
        assert_eq!(hub.join(&b, "lobby").unwrap(), 2);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn broadcast_to_room_excludes_sender() {
        let hub = Hub::new();
        let (a, mut rx_a) = hub.connect(Transport::WebSocket);
        let (b, mut rx_b) = hub.connect(Transport::WebSocket);
        let (_c, mut rx_c) = hub.connect(Transport::EventStream);
        hub.join(&a, "lobby").unwrap();
        hub.join(&b, "lobby").unwrap();
        drain(&mut rx_a);

        let frame = EventFrame::new("chat", json!("hi")).from_conn(a.as_str()).in_room("lobby");
        let delivered = hub.broadcast(&Target::Room("lobby".into()), &frame, Some(&a)).unwrap();
        assert_eq!(delivered, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b)[0]["data"], "hi");
        assert!(drain(&mut rx_c).is_empty());

        let delivered = hub.broadcast(&Target::All, &EventFrame::new("news", Value::Null), None).unwrap();
        assert_eq!(delivered, 3);
    }

    #[test]
    fn leave_and_empty_room_cleanup() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.connect(Transport::WebSocket);
        let (b, mut rx_b) = hub.connect(Transport::WebSocket);
        hub.join(&a, "lobby").unwrap();
        hub.join(&b, "lobby").unwrap();

        assert!(hub.leave(&a, "lobby").unwrap());
        assert!(!hub.leave(&a, "lobby").unwrap());
        let left: Vec<Value> = drain(&mut rx_b);
        assert_eq!(left.last().unwrap()["event"], "left");
        assert_eq!(hub.room_members("lobby").unwrap(), vec![b.clone()]);

        hub.leave(&b, "lobby").unwrap();
        assert!(hub.room_members("lobby").is_none());
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn disconnect_clears_membership_and_notifies() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.connect(Transport::WebSocket);
        let (b, mut rx_b) = hub.connect(Transport::WebSocket);
        hub.join(&a, "x").unwrap();
        hub.join(&a, "y").unwrap();
        hub.join(&b, "y").unwrap();

        assert!(hub.disconnect(&a));
        assert!(!hub.disconnect(&a));
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.room_summaries(), vec![RoomSummary { name: "y".into(), members: 1 }]);

        let frames = drain(&mut rx_b);
        assert_eq!(frames.last().unwrap()["event"], "left");
        assert_eq!(frames.last().unwrap()["data"]["id"], a.as_str());
    }

    #[test]
    fn closed_clients_are_pruned_on_broadcast() {
        let hub = Hub::new();
        let (a, rx_a) = hub.connect(Transport::EventStream);
        let (_b, _rx_b) = hub.connect(Transport::WebSocket);
        hub.join(&a, "lobby").unwrap();
        drop(rx_a);

        let delivered = hub.broadcast(&Target::All, &EventFrame::new("tick", json!(1)), None).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.room_members("lobby").is_none());
    }

    #[test]
    fn unknown_connection_and_bad_room() {
        let hub = Hub::new();
        assert_eq!(hub.join("nope", "lobby").unwrap_err().code(), "unknown_connection");

        let (a, _rx) = hub.connect(Transport::WebSocket);
        assert_eq!(hub.join(&a, "   ").unwrap_err().code(), "invalid_room");
        assert_eq!(hub.join(&a, "bad\nroom").unwrap_err().code(), "invalid_room");
        let long = "r".repeat(MAX_ROOM_NAME_LEN + 1);
        assert!(hub.join(&a, &long).is_err());
        assert!(hub.rooms_of(&a).unwrap().is_empty());
    }

    #[test]
    fn stats_track_connections_and_frames() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.connect(Transport::WebSocket);
        let (_b, _rx_b) = hub.connect(Transport::WebSocket);
        assert!(hub.emit_to(&a, &EventFrame::new("hello", Value::Null)).unwrap());
        assert!(!hub.emit_to("missing", &EventFrame::new("hello", Value::Null)).unwrap());
        hub.broadcast(&Target::All, &EventFrame::new("tick", Value::Null), None).unwrap();

        assert_eq!(hub.stats.connections_total.load(Ordering::Relaxed), 2);
        assert_eq!(hub.stats.frames_out.load(Ordering::Relaxed), 3);
    }
}
