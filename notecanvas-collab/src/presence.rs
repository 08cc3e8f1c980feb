//! Ephemeral per-user presence over the document channel.
//!
//! ## Architecture
//!
//! ```text
//! Local UI event
//!       │
//!       ▼
//! PresenceTracker::update_*()      (cursor rate-limited: 30fps)
//!       │
//!       ▼
//! ChannelMessage::PresenceSync { full state }
//!       │
//!       ▼   (broadcast channel, best effort)
//! Remote PresenceRoom::handle_message()
//!       │
//!       ▼
//! PresenceRoom::sorted()  ── Editing, Viewing, Idle
//! ```
//!
//! Status transitions happen only when the owning client asks for them.
//! Observers drop peers they have not heard from within a timeout
//! (see [`PresenceRoom::expire_stale`]); clients keep themselves alive with
//! [`PresenceTracker::heartbeat`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::channel::{ChannelMessage, NodeId};
use crate::ot::UserId;

/// Minimum interval between cursor broadcasts (30fps).
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Viewing,
    Editing,
    Idle,
}

impl PresenceStatus {
    /// Display rank; lower sorts first.
    pub fn priority(self) -> u8 {
        match self {
            PresenceStatus::Editing => 0,
            PresenceStatus::Viewing => 1,
            PresenceStatus::Idle => 2,
        }
    }
}

/// Pointer position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Text selection, in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

/// Everything one user publishes about themselves. Each sync carries the
/// whole state and replaces the previous one.
///
/// Fields are snake_case on the wire, unlike the camelCase node and lock
/// events. `userId` is accepted on input so senders may use either form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(alias = "userId")]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    #[serde(default)]
    pub typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_element: Option<NodeId>,
    /// Join time, unix milliseconds.
    pub online_at: u64,
}

impl PresencePayload {
    pub fn new(user_id: UserId, status: PresenceStatus) -> Self {
        Self {
            user_id,
            name: None,
            avatar: None,
            status,
            cursor_position: None,
            selection: None,
            typing: false,
            focused_element: None,
            online_at: unix_millis(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Owning side
// ───────────────────────────────────────────────────────────────────

/// The local user's presence. Every mutation returns the message to
/// broadcast; sending is left to the caller.
pub struct PresenceTracker {
    state: PresencePayload,
    last_cursor_broadcast: Option<Instant>,
    cursor_interval: Duration,
}

impl PresenceTracker {
    pub fn new(user_id: UserId, name: Option<String>, avatar: Option<String>) -> Self {
        let mut state = PresencePayload::new(user_id, PresenceStatus::Viewing);
        state.name = name;
        state.avatar = avatar;
        Self {
            state,
            last_cursor_broadcast: None,
            cursor_interval: CURSOR_BROADCAST_INTERVAL,
        }
    }

    /// Custom cursor rate limit (for testing).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.cursor_interval = interval;
        self
    }

    pub fn state(&self) -> &PresencePayload {
        &self.state
    }

    /// Announce the current state on joining a channel.
    pub fn join(&self) -> ChannelMessage {
        self.sync()
    }

    pub fn update_status(&mut self, status: PresenceStatus) -> ChannelMessage {
        self.state.status = status;
        self.sync()
    }

    /// Returns `None` while throttled; the position is still recorded and
    /// goes out with the next message.
    pub fn update_cursor_position(&mut self, x: f64, y: f64) -> Option<ChannelMessage> {
        self.state.cursor_position = Some(CursorPosition { x, y });
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.cursor_interval {
                return None;
            }
        }
        self.last_cursor_broadcast = Some(Instant::now());
        Some(self.sync())
    }

    pub fn update_selection(&mut self, selection: Option<SelectionRange>) -> ChannelMessage {
        self.state.selection = selection;
        self.sync()
    }

    pub fn update_typing_status(&mut self, typing: bool) -> ChannelMessage {
        self.state.typing = typing;
        self.sync()
    }

    pub fn update_focused_element(&mut self, element: Option<NodeId>) -> ChannelMessage {
        self.state.focused_element = element;
        self.sync()
    }

    /// Re-announce unchanged state so observers do not expire us.
    pub fn heartbeat(&self) -> ChannelMessage {
        self.sync()
    }

    pub fn leave(&self) -> ChannelMessage {
        ChannelMessage::PresenceLeave {
            user_id: self.state.user_id,
        }
    }

    fn sync(&self) -> ChannelMessage {
        ChannelMessage::PresenceSync(self.state.clone())
    }
}

// ───────────────────────────────────────────────────────────────────
// Observing side
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub payload: PresencePayload,
    pub last_seen: Instant,
}

/// Presence of everyone else on a channel, derived from observed messages.
pub struct PresenceRoom {
    local_user_id: UserId,
    peers: HashMap<UserId, PresenceEntry>,
}

impl PresenceRoom {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
        }
    }

    /// Apply a channel message. Returns whether the displayed set changed.
    pub fn handle_message(&mut self, msg: &ChannelMessage) -> bool {
        if msg.user_id() == self.local_user_id {
            return false;
        }

        match msg {
            ChannelMessage::PresenceSync(payload) => {
                let entry = PresenceEntry {
                    payload: payload.clone(),
                    last_seen: Instant::now(),
                };
                let previous = self.peers.insert(payload.user_id, entry);
                previous.map_or(true, |p| p.payload != *payload)
            }
            ChannelMessage::PresenceLeave { user_id } => self.peers.remove(user_id).is_some(),
            // Any other traffic from a peer still proves it is alive.
            other => {
                if let Some(entry) = self.peers.get_mut(&other.user_id()) {
                    entry.last_seen = Instant::now();
                }
                false
            }
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresencePayload> {
        self.peers.get(user_id).map(|e| &e.payload)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers ordered Editing, Viewing, Idle, then by name and id.
    pub fn sorted(&self) -> Vec<&PresencePayload> {
        let mut out: Vec<&PresencePayload> = self.peers.values().map(|e| &e.payload).collect();
        out.sort_by(|a, b| {
            a.status
                .priority()
                .cmp(&b.status.priority())
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        out
    }

    /// Drop peers silent for longer than `timeout`.
    pub fn expire_stale(&mut self, timeout: Duration) -> Vec<UserId> {
        self.expire_stale_at(Instant::now(), timeout)
    }

    pub fn expire_stale_at(&mut self, now: Instant, timeout: Duration) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .peers
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Expired {} silent presence entries", stale.len());
        }
        stale
    }
}
