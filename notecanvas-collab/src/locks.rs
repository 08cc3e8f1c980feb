//! Advisory node locks.
//!
//! A lock is only a `node_lock` broadcast. Every subscriber rebuilds the
//! `node_id -> user_id` map from the messages it sees; nothing arbitrates.
//! Two users locking the same node at nearly the same moment can both
//! believe they hold it, and each observer keeps whichever `lock` it saw
//! last. These are soft locks: they make collisions less likely, they do
//! not make them impossible. Observed collisions surface as
//! [`LockContention`] for the UI to warn about.
//!
//! Locks held by a user who disconnects are released by the server; locks
//! older than a TTL are dropped by [`NodeLockTable::expire`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::channel::{ChannelMessage, NodeId, NodeLock};
use crate::ot::UserId;

/// Someone else appears to be editing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockContention {
    pub node_id: NodeId,
    /// Holder before the conflicting lock was seen.
    pub holder: UserId,
    pub contender: UserId,
}

impl std::fmt::Display for LockContention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Node {} may be edited by {} as well as {}",
            self.node_id, self.holder, self.contender
        )
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    user_id: UserId,
    acquired: Instant,
}

/// Locally observed lock state for one channel.
pub struct NodeLockTable {
    /// Nil for a pure observer such as the server.
    local_user_id: UserId,
    locks: HashMap<NodeId, HeldLock>,
}

impl NodeLockTable {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            locks: HashMap::new(),
        }
    }

    /// A table that never locks on its own behalf.
    pub fn observer() -> Self {
        Self::new(Uuid::nil())
    }

    /// Lock `node_id` for the local user and return the message to send.
    ///
    /// Refuses when another user is already known to hold the node.
    pub fn lock(&mut self, node_id: impl Into<NodeId>) -> Result<ChannelMessage, LockContention> {
        let node_id = node_id.into();
        if let Some(held) = self.locks.get(&node_id) {
            if held.user_id != self.local_user_id {
                return Err(LockContention {
                    node_id,
                    holder: held.user_id,
                    contender: self.local_user_id,
                });
            }
        }
        self.locks.insert(
            node_id.clone(),
            HeldLock {
                user_id: self.local_user_id,
                acquired: Instant::now(),
            },
        );
        Ok(lock_message(self.local_user_id, node_id, true))
    }

    /// Release a lock the local user holds.
    pub fn unlock(&mut self, node_id: &str) -> Option<ChannelMessage> {
        match self.locks.get(node_id) {
            Some(held) if held.user_id == self.local_user_id => {
                self.locks.remove(node_id);
                Some(lock_message(self.local_user_id, node_id.to_owned(), false))
            }
            _ => None,
        }
    }

    /// Apply a message seen on the channel.
    pub fn observe(&mut self, msg: &ChannelMessage) -> Option<LockContention> {
        match msg {
            ChannelMessage::NodeLock(NodeLock {
                user_id,
                node_id,
                locked: true,
            }) => {
                let previous = self.locks.insert(
                    node_id.clone(),
                    HeldLock {
                        user_id: *user_id,
                        acquired: Instant::now(),
                    },
                );
                match previous {
                    Some(prev) if prev.user_id != *user_id => {
                        let contention = LockContention {
                            node_id: node_id.clone(),
                            holder: prev.user_id,
                            contender: *user_id,
                        };
                        log::warn!("{contention}");
                        Some(contention)
                    }
                    _ => None,
                }
            }
            ChannelMessage::NodeLock(NodeLock {
                user_id,
                node_id,
                locked: false,
            }) => {
                if self.holder(node_id) == Some(*user_id) {
                    self.locks.remove(node_id);
                }
                None
            }
            ChannelMessage::PresenceLeave { user_id } => {
                self.release_user(*user_id);
                None
            }
            _ => None,
        }
    }

    pub fn holder(&self, node_id: &str) -> Option<UserId> {
        self.locks.get(node_id).map(|h| h.user_id)
    }

    /// Whether a user other than the local one holds `node_id`.
    pub fn is_locked_by_other(&self, node_id: &str) -> bool {
        self.holder(node_id)
            .is_some_and(|holder| holder != self.local_user_id)
    }

    pub fn locks_held_by(&self, user_id: UserId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .locks
            .iter()
            .filter(|(_, h)| h.user_id == user_id)
            .map(|(n, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every lock held by `user_id`; returns the freed nodes.
    pub fn release_user(&mut self, user_id: UserId) -> Vec<NodeId> {
        let freed = self.locks_held_by(user_id);
        for node in &freed {
            self.locks.remove(node);
        }
        freed
    }

    /// Drop locks older than `ttl`; returns `(node, former holder)`.
    pub fn expire(&mut self, ttl: Duration) -> Vec<(NodeId, UserId)> {
        self.expire_at(Instant::now(), ttl)
    }

    pub fn expire_at(&mut self, now: Instant, ttl: Duration) -> Vec<(NodeId, UserId)> {
        let stale: Vec<(NodeId, UserId)> = self
            .locks
            .iter()
            .filter(|(_, h)| now.saturating_duration_since(h.acquired) > ttl)
            .map(|(n, h)| (n.clone(), h.user_id))
            .collect();
        for (node, _) in &stale {
            self.locks.remove(node);
        }
        stale
    }
}

/// A `node_lock` message.
pub fn lock_message(user_id: UserId, node_id: NodeId, locked: bool) -> ChannelMessage {
    ChannelMessage::NodeLock(NodeLock {
        user_id,
        node_id,
        locked,
    })
}
