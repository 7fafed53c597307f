//! Room membership and ordered fan-out of pushes.
//!
//! Every connected session owns one bounded outbox; a room is a set of
//! session ids. A push is encoded once and the shared bytes are queued on
//! each member's outbox, so ordering per session is the order in which
//! the server accepted the changes.
//!
//! A session whose outbox is full is cut off: its outbox is dropped, the
//! connection task observes the closed channel and disconnects, and the
//! client resynchronizes on reconnect. Silently skipping a push would leave
//! its replica diverged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use atelier_core::TenantId;

use crate::protocol::{ProtocolError, SyncMessage};

pub type SessionId = u64;

/// Encoded frame shared between all recipients.
pub type Frame = Arc<Vec<u8>>;

pub type Outbox = mpsc::Sender<Frame>;

/// Target audience of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    /// Every connected session regardless of membership.
    Global,
    /// Sessions authenticated for a tenant.
    Tenant(TenantId),
    /// Sessions that currently have the map open.
    Map(u64),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_queued: u64,
    pub sessions_cut_off: u64,
    pub active_rooms: usize,
    pub connected_sessions: usize,
}

/// Owner of every outbox and every room.
///
/// Not internally synchronized; the hub mutates it under its state lock
/// together with the store, which is what keeps pushes ordered with the
/// accepted changes they describe.
#[derive(Debug, Default)]
pub struct RoomManager {
    outboxes: HashMap<SessionId, Outbox>,
    rooms: HashMap<RoomId, HashSet<SessionId>>,
    cut_off: Vec<SessionId>,
    messages_sent: u64,
    frames_queued: u64,
    sessions_cut_off: u64,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's outbox.
    pub fn connect(&mut self, session: SessionId, outbox: Outbox) {
        self.outboxes.insert(session, outbox);
    }

    /// Drop a session's outbox and remove it from every room.
    ///
    /// Returns the rooms it was a member of.
    pub fn disconnect(&mut self, session: SessionId) -> Vec<RoomId> {
        self.outboxes.remove(&session);
        let mut left = Vec::new();
        self.rooms.retain(|room, members| {
            if members.remove(&session) {
                left.push(*room);
            }
            !members.is_empty()
        });
        left
    }

    pub fn is_connected(&self, session: SessionId) -> bool {
        self.outboxes.contains_key(&session)
    }

    /// Add a session to a room. Returns false if it was already a member.
    pub fn join(&mut self, room: RoomId, session: SessionId) -> bool {
        if room == RoomId::Global {
            return false;
        }
        self.rooms.entry(room).or_default().insert(session)
    }

    /// Remove a session from a room. Empty rooms are dropped.
    pub fn leave(&mut self, room: RoomId, session: SessionId) -> bool {
        let Some(members) = self.rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&session);
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        removed
    }

    /// Remove every member from a room, returning who was in it.
    pub fn close(&mut self, room: RoomId) -> Vec<SessionId> {
        let mut members: Vec<_> = self.rooms.remove(&room).unwrap_or_default().into_iter().collect();
        members.sort_unstable();
        members
    }

    pub fn is_member(&self, room: RoomId, session: SessionId) -> bool {
        match room {
            RoomId::Global => self.outboxes.contains_key(&session),
            _ => self.rooms.get(&room).is_some_and(|m| m.contains(&session)),
        }
    }

    /// Members of a room, sorted by session id.
    pub fn members(&self, room: RoomId) -> Vec<SessionId> {
        let mut members: Vec<_> = match room {
            RoomId::Global => self.outboxes.keys().copied().collect(),
            _ => self.rooms.get(&room).map(|m| m.iter().copied().collect()).unwrap_or_default(),
        };
        members.sort_unstable();
        members
    }

    pub fn is_empty(&self, room: RoomId) -> bool {
        self.members(room).is_empty()
    }

    /// Queue `msg` for every member of `room` except `exclude`.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub fn broadcast(
        &mut self,
        room: RoomId,
        msg: &SyncMessage,
        exclude: Option<SessionId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::new(msg.encode()?);
        let recipients: Vec<SessionId> = self
            .members(room)
            .into_iter()
            .filter(|s| Some(*s) != exclude)
            .collect();
        self.messages_sent += 1;
        let mut queued = 0;
        for session in recipients {
            if self.deliver(session, frame.clone()) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queue `msg` for a single session.
    pub fn send_to(&mut self, session: SessionId, msg: &SyncMessage) -> Result<bool, ProtocolError> {
        let frame: Frame = Arc::new(msg.encode()?);
        self.messages_sent += 1;
        Ok(self.deliver(session, frame))
    }

    fn deliver(&mut self, session: SessionId, frame: Frame) -> bool {
        let Some(outbox) = self.outboxes.get(&session) else {
            return false;
        };
        match outbox.try_send(frame) {
            Ok(()) => {
                self.frames_queued += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("session {session} outbox full, disconnecting");
                self.cut(session);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("session {session} outbox closed");
                self.cut(session);
                false
            }
        }
    }

    fn cut(&mut self, session: SessionId) {
        if self.outboxes.remove(&session).is_some() {
            self.sessions_cut_off += 1;
            self.cut_off.push(session);
        }
    }

    /// Sessions whose outbox was dropped since the last call.
    pub fn take_cut_off(&mut self) -> Vec<SessionId> {
        std::mem::take(&mut self.cut_off)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            frames_queued: self.frames_queued,
            sessions_cut_off: self.sessions_cut_off,
            active_rooms: self.rooms.len(),
            connected_sessions: self.outboxes.len(),
        }
    }
}
