use std::{
    ops::ControlFlow,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::{
    Notify,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, info, warn};

use crate::{
    lock,
    protocol::{ClientFrame, ServerFrame},
    room::{Room, SYSTEM_OWNER, system_notice},
    state::ServerState,
};

pub type SessionId = u64;

/// Frames that may wait for a session's writer before the session counts as
/// unreachable.
pub const OUTBOUND_CAPACITY: usize = 128;

/// Queue feeding a session's connection writer.
pub type Outbound = mpsc::Sender<ServerFrame>;
pub type OutboundQueue = mpsc::Receiver<ServerFrame>;

pub fn outbound_channel() -> (Outbound, OutboundQueue) {
    mpsc::channel(OUTBOUND_CAPACITY)
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection for session {0} is closed")]
    Closed(SessionId),
    #[error("session {0} is not keeping up with its outbound queue")]
    Full(SessionId),
}

/// Server-side state for one connected client.
///
/// The session owns the sending half of its connection's outbound queue.
/// Dropping that sender is how the connection gets closed: the writer drains
/// whatever is already queued and then shuts the socket down.
pub struct Session {
    id: SessionId,
    name: Mutex<String>,
    outbound: Mutex<Option<Outbound>>,
    room: Mutex<Weak<Room>>,
    server: Weak<ServerState>,
    alive: AtomicBool,
    closed: Notify,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        name: String,
        outbound: Outbound,
        room: &Arc<Room>,
        server: Weak<ServerState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: Mutex::new(name),
            outbound: Mutex::new(Some(outbound)),
            room: Mutex::new(Arc::downgrade(room)),
            server,
            alive: AtomicBool::new(true),
            closed: Notify::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn current_room(&self) -> Option<Arc<Room>> {
        lock(&self.room).upgrade()
    }

    /// Queues a frame for this session's connection.
    ///
    /// Never waits. A closed connection or a full queue is reported, not
    /// handled: callers that get a [`SendError`] are expected to call
    /// [`Session::teardown`] once they no longer hold any room lock.
    pub fn send(&self, frame: &ServerFrame) -> Result<(), SendError> {
        let outbound = lock(&self.outbound);
        let Some(sender) = outbound.as_ref() else {
            return Err(SendError::Closed(self.id));
        };
        sender.try_send(frame.clone()).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full(self.id),
            TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        if !self.is_alive() {
            return;
        }
        self.closed.notified().await;
    }

    /// Closes the connection and removes the session from its room and from
    /// the server registry.
    ///
    /// Only the first call does anything; it returns `true` when this call
    /// performed the teardown.
    pub fn teardown(&self) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }

        lock(&self.outbound).take();
        self.closed.notify_one();

        if let Some(room) = self.current_room() {
            room.remove_member(self.id);
        }
        if let Some(server) = self.server.upgrade() {
            server.remove_session(self.id);
        }

        info!(session = self.id, name = %self.name(), "session closed");
        true
    }

    /// Decodes and dispatches one inbound line.
    ///
    /// Garbled frames get an `ERROR` reply and end the session.
    pub fn handle_line(self: &Arc<Self>, line: &str) -> ControlFlow<()> {
        match ClientFrame::decode(line) {
            Ok(frame) => self.dispatch(frame),
            Err(err) => {
                warn!(session = self.id, error = %err, "dropping session after bad frame");
                let _ = self.send(&ServerFrame::Error {
                    reason: err.to_string(),
                });
                self.teardown();
                ControlFlow::Break(())
            }
        }
    }

    pub fn dispatch(self: &Arc<Self>, frame: ClientFrame) -> ControlFlow<()> {
        debug!(session = self.id, ?frame, "dispatching frame");
        match frame {
            ClientFrame::Message { text } => self.relay_message(text),
            ClientFrame::JoinRoom { room } => self.join_room(&room),
            ClientFrame::QuitRoom => self.leave_room(),
            ClientFrame::ChangeName { name } => self.change_name(&name),
            ClientFrame::Disconnect => {
                self.teardown();
                return ControlFlow::Break(());
            }
        }

        if self.is_alive() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    fn relay_message(&self, text: String) {
        if text.is_empty() {
            return;
        }
        let Some(room) = self.current_room() else {
            return;
        };

        let frame = ServerFrame::Message {
            owner: self.name(),
            body: text,
        };
        room.broadcast(&frame, Some(self.id));
    }

    fn join_room(self: &Arc<Self>, target: &str) {
        let target = target.trim();
        if target.is_empty() {
            self.reply_error("Room name cannot be empty");
            return;
        }
        let Some(server) = self.server.upgrade() else {
            return;
        };

        let previous = self.current_room();
        if previous.as_ref().is_some_and(|room| room.name() == target) {
            return;
        }

        let next = server.get_or_create_room(target);
        // Point at the new room before touching membership so a concurrent
        // teardown either removes us from `next` or makes `add_member` refuse.
        *lock(&self.room) = Arc::downgrade(&next);
        if let Some(previous) = previous {
            previous.remove_member(self.id);
        }
        if next.add_member(self) {
            info!(session = self.id, room = next.name(), "session changed room");
        }
    }

    fn leave_room(self: &Arc<Self>) {
        if let Some(server) = self.server.upgrade() {
            let default_room = server.default_room().name().to_string();
            self.join_room(&default_room);
        }
    }

    fn change_name(&self, name: &str) {
        let name = name.trim();
        if let Err(reason) = validate_display_name(name) {
            self.reply_error(reason);
            return;
        }

        let previous = std::mem::replace(&mut *lock(&self.name), name.to_string());
        info!(session = self.id, from = %previous, to = name, "session renamed");

        if let Some(room) = self.current_room() {
            room.broadcast(
                &system_notice(format!("User {previous} changed their name to {name}")),
                Some(self.id),
            );
        }
    }

    fn reply_error(&self, reason: &str) {
        let frame = ServerFrame::Error {
            reason: reason.to_string(),
        };
        if let Err(err) = self.send(&frame) {
            debug!(error = %err, "failed to deliver error reply");
            self.teardown();
        }
    }
}

/// A display name ends up as the owner of `MESSAGE` frames, so it cannot
/// contain the owner delimiter or pass for the server.
fn validate_display_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Display name cannot be empty");
    }
    if name.contains('|') {
        return Err("Display name cannot contain `|`");
    }
    if name.eq_ignore_ascii_case(SYSTEM_OWNER) {
        return Err("Display name is reserved");
    }
    Ok(())
}
