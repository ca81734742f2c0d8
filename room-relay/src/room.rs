use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{
    lock,
    protocol::ServerFrame,
    session::{Session, SessionId},
};

/// Owner shown on notices generated by the server itself.
pub const SYSTEM_OWNER: &str = "Server";

pub fn system_notice(body: String) -> ServerFrame {
    ServerFrame::Message {
        owner: SYSTEM_OWNER.to_string(),
        body,
    }
}

/// A named set of sessions that see each other's messages.
///
/// Membership changes and broadcasts are serialized by one lock, so every
/// member observes broadcasts to this room in the same order. Sends only push
/// onto each member's outbound queue and never wait on a socket while the lock
/// is held. Members whose connection turns out to be closed are torn down after
/// the lock is released.
pub struct Room {
    name: String,
    members: Mutex<BTreeMap<SessionId, Arc<Session>>>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `session` and tells everyone else it arrived.
    ///
    /// Returns `false` without touching membership if the session has already
    /// been torn down; the liveness check happens under the membership lock so
    /// it cannot interleave with the teardown's removal.
    pub fn add_member(&self, session: &Arc<Session>) -> bool {
        let failed = {
            let mut members = lock(&self.members);
            if !session.is_alive() {
                return false;
            }
            members.insert(session.id(), Arc::clone(session));

            let notice = system_notice(format!(
                "Client `{}` has joined the room `{}`",
                session.name(),
                self.name
            ));
            deliver(&members, &notice, Some(session.id()))
        };

        teardown_all(failed);
        true
    }

    /// Removes the session if it is a member and tells the rest it left.
    ///
    /// Removing a session that is not a member is a silent no-op.
    pub fn remove_member(&self, id: SessionId) -> Option<Arc<Session>> {
        let (removed, failed) = {
            let mut members = lock(&self.members);
            let removed = members.remove(&id)?;

            let notice = system_notice(format!(
                "Client `{}` has left the room `{}`",
                removed.name(),
                self.name
            ));
            let failed = deliver(&members, &notice, None);
            (removed, failed)
        };

        teardown_all(failed);
        Some(removed)
    }

    /// Sends `frame` to every member except `exclude`.
    ///
    /// Returns how many members the frame was queued for. A member whose
    /// connection is gone or whose queue is full is skipped and torn down; the
    /// remaining members still get the frame.
    pub fn broadcast(&self, frame: &ServerFrame, exclude: Option<SessionId>) -> usize {
        let (delivered, failed) = {
            let members = lock(&self.members);
            let failed = deliver(&members, frame, exclude);
            let targeted = members
                .keys()
                .filter(|id| Some(**id) != exclude)
                .count();
            (targeted - failed.len(), failed)
        };

        teardown_all(failed);
        delivered
    }

    pub fn contains(&self, id: SessionId) -> bool {
        lock(&self.members).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display names of current members, ordered by session id.
    pub fn member_names(&self) -> Vec<String> {
        lock(&self.members)
            .values()
            .map(|session| session.name())
            .collect()
    }
}

fn deliver(
    members: &BTreeMap<SessionId, Arc<Session>>,
    frame: &ServerFrame,
    exclude: Option<SessionId>,
) -> Vec<Arc<Session>> {
    members
        .iter()
        .filter(|(id, _)| Some(**id) != exclude)
        .filter_map(|(_, member)| match member.send(frame) {
            Ok(()) => None,
            Err(err) => {
                debug!(error = %err, "member unreachable during broadcast");
                Some(Arc::clone(member))
            }
        })
        .collect()
}

fn teardown_all(sessions: Vec<Arc<Session>>) {
    for session in sessions {
        session.teardown();
    }
}
