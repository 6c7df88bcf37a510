//! Membership provider seam.
//!
//! The ring only needs join/leave, a member snapshot, broadcasts and an event
//! stream, so the gossip library sits behind [`MembershipProvider`] and can be
//! swapped. [`StaticMembership`] is the in-process driver used by tests and
//! single-node deployments.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::events::{Member, MemberStatus, MembershipEvent};
use crate::error::{MembershipError, Result};

/// Capacity of membership event channels. Slow subscribers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait MembershipProvider: Send + Sync + 'static {
    /// Bring the local member up.
    async fn start(&self) -> Result<()>;

    /// Contact `seeds` and merge their view. Returns how many answered.
    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize>;

    /// Leave gracefully.
    async fn leave(&self) -> Result<()>;

    /// Stop without announcing a leave. Idempotent.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Snapshot of known members, the local one included.
    fn members(&self) -> Vec<Member>;

    /// Forget members that have left or failed. Returns how many went.
    ///
    /// Called by the ring after each rebuild, so departures are always seen
    /// once before they are dropped.
    fn prune_departed(&self) -> usize {
        0
    }

    fn local_name(&self) -> String;

    /// Best-effort broadcast to the other members.
    ///
    /// With `coalesce`, a queued broadcast with the same name is replaced
    /// instead of sending both.
    fn broadcast(&self, name: &str, payload: Bytes, coalesce: bool) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Replace the local member's tags and advertise them.
    async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()>;
}

/// Member table shared by every [`StaticMembership`] attached to it.
#[derive(Debug)]
struct Hub {
    members: RwLock<HashMap<String, Member>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Hub {
    fn upsert(&self, member: Member) {
        let prev = self
            .members
            .write()
            .insert(member.name.clone(), member.clone());
        let event = match prev {
            Some(p) if p.is_alive() => MembershipEvent::Update(member),
            _ => MembershipEvent::Join(member),
        };
        let _ = self.events.send(event);
    }

    fn set_status(&self, name: &str, status: MemberStatus) -> bool {
        let member = {
            let mut members = self.members.write();
            match members.get_mut(name) {
                Some(m) if m.is_alive() => {
                    m.status = status;
                    m.clone()
                }
                _ => return false,
            }
        };
        let event = match status {
            MemberStatus::Failed => MembershipEvent::Failed(member),
            _ => MembershipEvent::Leave(member),
        };
        let _ = self.events.send(event);
        true
    }
}

/// In-process membership with a manually edited member table.
///
/// Instances created with [`StaticMembership::sibling`] share one table and
/// one event stream, which simulates a cluster inside a single process.
#[derive(Debug)]
pub struct StaticMembership {
    local: RwLock<Member>,
    hub: Arc<Hub>,
    started: AtomicBool,
}

impl StaticMembership {
    pub fn new(local: Member) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local: RwLock::new(local),
            hub: Arc::new(Hub {
                members: RwLock::new(HashMap::new()),
                events,
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Another local member attached to the same table.
    pub fn sibling(&self, local: Member) -> Self {
        Self {
            local: RwLock::new(local),
            hub: self.hub.clone(),
            started: AtomicBool::new(false),
        }
    }

    /// Add or update a member by hand.
    pub fn insert_member(&self, member: Member) {
        self.hub.upsert(member);
    }

    pub fn remove_member(&self, name: &str) -> bool {
        self.hub.set_status(name, MemberStatus::Left)
    }

    /// Mark a member dead, as failure detection would.
    pub fn fail_member(&self, name: &str) -> bool {
        self.hub.set_status(name, MemberStatus::Failed)
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(MembershipError::NotStarted.into());
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipProvider for StaticMembership {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let local = self.local.read().clone();
        info!(member = %local.name, addr = %local.addr, "static membership started");
        self.hub.upsert(local);
        Ok(())
    }

    async fn join(&self, _seeds: &[SocketAddr]) -> Result<usize> {
        self.ensure_started()?;
        let local = self.local_name();
        Ok(self
            .members()
            .iter()
            .filter(|m| m.is_alive() && m.name != local)
            .count())
    }

    async fn leave(&self) -> Result<()> {
        self.ensure_started()?;
        let name = self.local_name();
        self.hub.set_status(&name, MemberStatus::Left);
        info!(member = %name, "left static membership");
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.hub.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn prune_departed(&self) -> usize {
        let mut members = self.hub.members.write();
        let before = members.len();
        members.retain(|_, m| m.is_alive());
        before - members.len()
    }

    fn local_name(&self) -> String {
        self.local.read().name.clone()
    }

    fn broadcast(&self, name: &str, payload: Bytes, _coalesce: bool) -> Result<()> {
        self.ensure_started()?;
        debug!(event = name, len = payload.len(), "static broadcast");
        let _ = self.hub.events.send(MembershipEvent::User {
            name: name.to_string(),
            payload,
            from: self.local_name(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.hub.events.subscribe()
    }

    async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        let member = {
            let mut local = self.local.write();
            local.tags = tags;
            local.clone()
        };
        if self.started.load(Ordering::Acquire) {
            self.hub.upsert(member);
        }
        Ok(())
    }
}
