use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::event::RealtimeEvent;
use crate::models::location::GeoPoint;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Uuid),
    Driver(Uuid),
    Drivers,
    All,
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user_{id}"),
            Room::Driver(id) => write!(f, "driver_{id}"),
            Room::Drivers => f.write_str("drivers"),
            Room::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Rider,
    Driver,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Rider => "rider",
            ConnectionRole::Driver => "driver",
        }
    }

    fn rooms(&self, user_id: Uuid) -> Vec<Room> {
        match self {
            ConnectionRole::Rider => vec![Room::User(user_id), Room::All],
            ConnectionRole::Driver => vec![
                Room::User(user_id),
                Room::Driver(user_id),
                Room::Drivers,
                Room::All,
            ],
        }
    }
}

/// Process-local view of one authenticated socket. Never persisted.
#[derive(Debug)]
pub struct LiveConnection {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub role: ConnectionRole,
    pub location: Option<GeoPoint>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    rooms: Vec<Room>,
    sender: mpsc::Sender<RealtimeEvent>,
}

impl LiveConnection {
    pub fn joined(&self, room: &Room) -> bool {
        self.rooms.contains(room)
    }
}

pub struct Subscription {
    pub connection_id: Uuid,
    pub receiver: mpsc::Receiver<RealtimeEvent>,
}

/// Live connections keyed by user. One authoritative connection per user: a
/// newer one replaces the older, whose channel then closes.
pub struct Notifier {
    connections: DashMap<Uuid, LiveConnection>,
    buffer_size: usize,
    metrics: Metrics,
}

impl Notifier {
    pub fn new(buffer_size: usize, metrics: Metrics) -> Self {
        Self {
            connections: DashMap::new(),
            buffer_size: buffer_size.max(1),
            metrics,
        }
    }

    pub fn attach(&self, user_id: Uuid, role: ConnectionRole) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let now = Utc::now();
        let connection = LiveConnection {
            connection_id: Uuid::new_v4(),
            user_id,
            role,
            location: None,
            connected_at: now,
            last_seen: now,
            rooms: role.rooms(user_id),
            sender,
        };
        let connection_id = connection.connection_id;

        if let Some(previous) = self.connections.insert(user_id, connection) {
            self.metrics
                .live_connections
                .with_label_values(&[previous.role.as_str()])
                .dec();
            info!(
                user_id = %user_id,
                replaced = %previous.connection_id,
                "connection replaced by newer handshake"
            );
        }
        self.metrics
            .live_connections
            .with_label_values(&[role.as_str()])
            .inc();

        Subscription {
            connection_id,
            receiver,
        }
    }

    /// Removes the user's connection only if it is still `connection_id`; a
    /// stale socket closing must not evict its replacement.
    pub fn detach(&self, user_id: Uuid, connection_id: Uuid) -> Option<ConnectionRole> {
        let (_, removed) = self
            .connections
            .remove_if(&user_id, |_, conn| conn.connection_id == connection_id)?;

        self.metrics
            .live_connections
            .with_label_values(&[removed.role.as_str()])
            .dec();
        Some(removed.role)
    }

    /// Best-effort fan-out. Returns how many connections accepted the event.
    pub fn publish(&self, room: &Room, event: RealtimeEvent) -> usize {
        let mut delivered = 0;

        for conn in self.connections.iter() {
            if !conn.joined(room) {
                continue;
            }

            match conn.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    self.metrics.realtime_events_dropped_total.inc();
                    warn!(
                        user_id = %conn.user_id,
                        room = %room,
                        event = event.name(),
                        "dropped realtime event"
                    );
                }
            }
        }

        delivered
    }

    pub fn touch(&self, user_id: Uuid, location: Option<GeoPoint>) {
        if let Some(mut conn) = self.connections.get_mut(&user_id) {
            conn.last_seen = Utc::now();
            if location.is_some() {
                conn.location = location;
            }
        }
    }

    pub fn location_of(&self, user_id: Uuid) -> Option<GeoPoint> {
        self.connections.get(&user_id).and_then(|conn| conn.location)
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
