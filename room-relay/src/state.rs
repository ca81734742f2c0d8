use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    lock,
    protocol::ServerFrame,
    room::Room,
    session::{Outbound, Session, SessionId},
};

/// Room every session starts in. It is created with the server and never removed.
pub const DEFAULT_ROOM: &str = "waiting room";

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("Server is full")]
    CapacityExceeded { capacity: usize },
}

/// Room and session registries shared by every connection task.
pub struct ServerState {
    capacity: usize,
    default_room: Arc<Room>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    registry: Mutex<SessionRegistry>,
}

struct SessionRegistry {
    sessions: HashMap<SessionId, Arc<Session>>,
    next_seq: u64,
}

impl ServerState {
    pub fn new(capacity: usize) -> Arc<Self> {
        let default_room = Arc::new(Room::new(DEFAULT_ROOM));
        let rooms = HashMap::from([(DEFAULT_ROOM.to_string(), Arc::clone(&default_room))]);

        Arc::new(Self {
            capacity,
            default_room,
            rooms: Mutex::new(rooms),
            registry: Mutex::new(SessionRegistry {
                sessions: HashMap::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn default_room(&self) -> Arc<Room> {
        Arc::clone(&self.default_room)
    }

    /// Registers a new session writing to `outbound` and places it in the
    /// default room.
    ///
    /// `CONNECTED;<name>` is queued before the session becomes visible to
    /// anyone else, so it is always the first frame the client reads. Capacity
    /// check, name allocation and registration happen under one lock.
    pub fn admit(self: &Arc<Self>, outbound: Outbound) -> Result<Arc<Session>, AdmitError> {
        let mut registry = lock(&self.registry);
        if registry.sessions.len() >= self.capacity {
            return Err(AdmitError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let id = registry.next_seq;
        registry.next_seq += 1;
        let name = format!("Client-{id}");
        let session = Session::new(
            id,
            name.clone(),
            outbound,
            &self.default_room,
            Arc::downgrade(self),
        );

        // The receiver lives in the caller until the writer starts, so this
        // only fails if the caller already gave up on the connection.
        let _ = session.send(&ServerFrame::Connected { name: name.clone() });

        registry.sessions.insert(id, Arc::clone(&session));
        // Joining may tear down unreachable members, which takes the registry
        // lock again.
        drop(registry);
        self.default_room.add_member(&session);

        info!(session = id, %name, "session admitted");
        Ok(session)
    }

    /// Returns the room called `name`, creating it on first use.
    pub fn get_or_create_room(&self, name: &str) -> Arc<Room> {
        let mut rooms = lock(&self.rooms);
        let room = rooms.entry(name.to_string()).or_insert_with(|| {
            debug!(room = name, "creating room");
            Arc::new(Room::new(name))
        });
        Arc::clone(room)
    }

    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        lock(&self.rooms).get(name).cloned()
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.rooms).keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops the session from the registry; a missing session is ignored.
    pub fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        lock(&self.registry).sessions.remove(&id)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.registry).sessions.len()
    }

    /// Tells every live session why it is being dropped, then tears it down.
    pub fn shutdown(&self, reason: &str) {
        let sessions: Vec<_> = lock(&self.registry).sessions.values().cloned().collect();
        let frame = ServerFrame::Error {
            reason: reason.to_string(),
        };

        for session in sessions {
            let _ = session.send(&frame);
            session.teardown();
        }
    }
}
