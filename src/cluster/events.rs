//! Cluster membership events.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Liveness of a member as last reported by the membership protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

/// One member as seen by the membership protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Unique, gossip-visible name.
    pub name: String,

    /// Gossip address.
    pub addr: SocketAddr,

    /// Advertised string tags.
    pub tags: HashMap<String, String>,

    pub status: MemberStatus,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            tags: HashMap::new(),
            status: MemberStatus::Alive,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }
}

/// Events related to cluster membership changes.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A member joined the cluster.
    Join(Member),

    /// A member left gracefully.
    Leave(Member),

    /// A member was declared dead by failure detection.
    Failed(Member),

    /// A member's tags changed.
    Update(Member),

    /// A user broadcast.
    User {
        /// Event name; coalescing broadcasts with the same name replace
        /// each other while queued.
        name: String,
        payload: Bytes,
        /// Name of the sending member.
        from: String,
    },
}

impl MembershipEvent {
    /// Member the event is about; `None` for user broadcasts.
    pub fn member(&self) -> Option<&Member> {
        match self {
            MembershipEvent::Join(m)
            | MembershipEvent::Leave(m)
            | MembershipEvent::Failed(m)
            | MembershipEvent::Update(m) => Some(m),
            MembershipEvent::User { .. } => None,
        }
    }

    /// Whether the alive-member set or member tags may have changed.
    pub fn changes_membership(&self) -> bool {
        self.member().is_some()
    }
}
