//! SWIM gossip membership via the `memberlist` crate.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 MemberlistMembership                     │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Memberlist (gossip, failure detection)             │  │
//! │  │  - node meta: advertised address + tags            │  │
//! │  │  - user messages: tag updates, user broadcasts     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │              │ EventDelegate / NodeDelegate              │
//! │              ▼                                           │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Shared: member table, broadcast queue, event bus   │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Node metadata is only re-read by memberlist when the node re-announces
//! itself, so tag changes after start are also pushed as gossip messages.

use async_trait::async_trait;
use bytes::Bytes;
use memberlist::delegate::{CompositeDelegate, EventDelegate, NodeDelegate, VoidDelegate};
use memberlist::net::resolver::socket_addr::SocketAddrResolver;
use memberlist::net::stream_layer::tcp::Tcp;
use memberlist::net::{NetTransport, NetTransportOptions};
use memberlist::proto::{MaybeResolvedAddress, Meta};
use memberlist::tokio::TokioRuntime;
use memberlist::{Memberlist, Options};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{Member, MemberStatus, MembershipEvent};
use super::provider::{MembershipProvider, EVENT_CHANNEL_CAPACITY};
use crate::config::MemberlistConfig;
use crate::error::{MembershipError, Result};

type Transport = NetTransport<
    SmolStr,
    SocketAddrResolver<TokioRuntime>,
    Tcp<TokioRuntime>,
    TokioRuntime,
>;

/// CompositeDelegate<I, Address, A, C, E, M, N, P> with only the event (E)
/// and node (N) delegates filled in.
type GossipDelegate = CompositeDelegate<
    SmolStr,
    SocketAddr,
    VoidDelegate<SmolStr, SocketAddr>,
    VoidDelegate<SmolStr, SocketAddr>,
    GossipEventDelegate,
    VoidDelegate<SmolStr, SocketAddr>,
    GossipNodeDelegate,
    VoidDelegate<SmolStr, SocketAddr>,
>;

/// Times each queued broadcast is piggybacked before it is dropped.
const BROADCAST_TRANSMITS: u32 = 3;

/// What a node advertises in its memberlist metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeMeta {
    addr: SocketAddr,
    tags: HashMap<String, String>,
}

impl NodeMeta {
    fn to_meta(&self) -> Result<Meta> {
        let bytes = bincode::serialize(self)?;
        let len = bytes.len();
        Meta::try_from(bytes).map_err(|_| {
            MembershipError::TransportError(format!("node metadata of {len} bytes is too large"))
                .into()
        })
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum GossipMessage {
    Tags {
        member: String,
        tags: HashMap<String, String>,
    },
    User {
        name: String,
        payload: Vec<u8>,
        from: String,
    },
}

#[derive(Debug)]
struct Queued {
    /// Coalescing key; `None` never coalesces.
    key: Option<String>,
    data: Bytes,
    transmits_left: u32,
}

/// State shared between the provider and its delegates.
#[derive(Debug)]
struct Shared {
    local_name: String,
    members: RwLock<HashMap<String, Member>>,
    events: broadcast::Sender<MembershipEvent>,
    local_meta: RwLock<NodeMeta>,
    queue: Mutex<VecDeque<Queued>>,
}

impl Shared {
    fn emit(&self, event: MembershipEvent) {
        let _ = self.events.send(event);
    }

    fn on_join(&self, name: &str, meta: &[u8]) {
        let Some(meta) = NodeMeta::from_bytes(meta) else {
            warn!(member = name, "ignoring member with unreadable metadata");
            return;
        };
        let member = Member {
            name: name.to_string(),
            addr: meta.addr,
            tags: meta.tags,
            status: MemberStatus::Alive,
        };
        let prev = self.members.write().insert(name.to_string(), member.clone());
        match prev {
            Some(p) if p.is_alive() => {
                if p != member {
                    self.emit(MembershipEvent::Update(member));
                }
            }
            _ => {
                info!(member = name, addr = %member.addr, "member joined");
                self.emit(MembershipEvent::Join(member));
            }
        }
    }

    fn on_leave(&self, name: &str) {
        let member = {
            let mut members = self.members.write();
            match members.get_mut(name) {
                Some(m) if m.is_alive() => {
                    m.status = MemberStatus::Left;
                    m.clone()
                }
                _ => return,
            }
        };
        info!(member = name, "member left");
        self.emit(MembershipEvent::Leave(member));
    }

    fn prune_departed(&self) -> usize {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|_, m| m.is_alive());
        before - members.len()
    }

    fn on_tags(&self, name: &str, tags: HashMap<String, String>) {
        let member = {
            let mut members = self.members.write();
            match members.get_mut(name) {
                Some(m) if m.tags != tags => {
                    m.tags = tags;
                    m.clone()
                }
                _ => return,
            }
        };
        debug!(member = name, "member tags updated");
        self.emit(MembershipEvent::Update(member));
    }

    fn on_message(&self, data: &[u8]) {
        match bincode::deserialize::<GossipMessage>(data) {
            Ok(GossipMessage::Tags { member, tags }) => {
                if member != self.local_name {
                    self.on_tags(&member, tags);
                }
            }
            Ok(GossipMessage::User {
                name,
                payload,
                from,
            }) => {
                if from != self.local_name {
                    self.emit(MembershipEvent::User {
                        name,
                        payload: payload.into(),
                        from,
                    });
                }
            }
            Err(e) => debug!(error = %e, "dropping undecodable gossip message"),
        }
    }

    fn enqueue(&self, key: Option<String>, msg: &GossipMessage) -> Result<()> {
        let data = Bytes::from(bincode::serialize(msg)?);
        let mut queue = self.queue.lock();
        if let Some(k) = &key {
            queue.retain(|q| q.key.as_ref() != Some(k));
        }
        queue.push_back(Queued {
            key,
            data,
            transmits_left: BROADCAST_TRANSMITS,
        });
        Ok(())
    }

    /// Pick queued broadcasts whose framed size fits in `limit`.
    fn take_broadcasts<F>(&self, limit: usize, encoded_len: F) -> Vec<Bytes>
    where
        F: Fn(Bytes) -> (usize, Bytes),
    {
        let mut queue = self.queue.lock();
        let mut used = 0;
        let mut out = Vec::new();
        let mut keep = VecDeque::with_capacity(queue.len());
        while let Some(mut q) = queue.pop_front() {
            let (len, framed) = encoded_len(q.data.clone());
            if used + len > limit {
                keep.push_back(q);
                continue;
            }
            used += len;
            out.push(framed);
            q.transmits_left -= 1;
            if q.transmits_left > 0 {
                keep.push_back(q);
            }
        }
        *queue = keep;
        out
    }
}

/// Feeds memberlist join/leave/update notifications into the member table.
pub struct GossipEventDelegate {
    shared: Arc<Shared>,
}

impl EventDelegate for GossipEventDelegate {
    type Id = SmolStr;
    type Address = SocketAddr;

    fn notify_join(
        &self,
        node: Arc<memberlist::proto::NodeState<Self::Id, Self::Address>>,
    ) -> impl Future<Output = ()> + Send {
        let meta = node.meta().to_vec();
        self.shared.on_join(node.id().as_str(), &meta);
        async {}
    }

    fn notify_leave(
        &self,
        node: Arc<memberlist::proto::NodeState<Self::Id, Self::Address>>,
    ) -> impl Future<Output = ()> + Send {
        self.shared.on_leave(node.id().as_str());
        async {}
    }

    fn notify_update(
        &self,
        node: Arc<memberlist::proto::NodeState<Self::Id, Self::Address>>,
    ) -> impl Future<Output = ()> + Send {
        let meta = node.meta().to_vec();
        self.shared.on_join(node.id().as_str(), &meta);
        async {}
    }
}

/// Supplies local metadata and carries tag updates and user broadcasts.
pub struct GossipNodeDelegate {
    shared: Arc<Shared>,
}

impl NodeDelegate for GossipNodeDelegate {
    fn node_meta(&self, _limit: usize) -> impl Future<Output = Meta> + Send {
        let meta = self
            .shared
            .local_meta
            .read()
            .to_meta()
            .unwrap_or_else(|_| Meta::empty());
        async move { meta }
    }

    fn notify_message(&self, msg: Cow<'_, [u8]>) -> impl Future<Output = ()> + Send {
        self.shared.on_message(&msg);
        async {}
    }

    fn broadcast_messages<F>(
        &self,
        limit: usize,
        encoded_len: F,
    ) -> impl Future<Output = impl Iterator<Item = Bytes> + Send> + Send
    where
        F: Fn(Bytes) -> (usize, Bytes) + Send + Sync + 'static,
    {
        let out = self.shared.take_broadcasts(limit, encoded_len);
        async move { out.into_iter() }
    }

    /// Push-pull carries our current tags so joiners see updates made after
    /// start.
    fn local_state(&self, _join: bool) -> impl Future<Output = Bytes> + Send {
        let msg = GossipMessage::Tags {
            member: self.shared.local_name.clone(),
            tags: self.shared.local_meta.read().tags.clone(),
        };
        let state = bincode::serialize(&msg).map(Bytes::from).unwrap_or_default();
        async move { state }
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) -> impl Future<Output = ()> + Send {
        if !buf.is_empty() {
            self.shared.on_message(buf);
        }
        async {}
    }
}

/// Gossip-backed [`MembershipProvider`].
pub struct MemberlistMembership {
    node_name: String,
    config: MemberlistConfig,
    shared: Arc<Shared>,
    memberlist: Mutex<Option<Arc<Memberlist<Transport, GossipDelegate>>>>,
}

impl std::fmt::Debug for MemberlistMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberlistMembership")
            .field("node_name", &self.node_name)
            .field("bind_addr", &self.config.bind_addr)
            .field("members", &self.shared.members.read().len())
            .finish()
    }
}

impl MemberlistMembership {
    pub fn new(node_name: impl Into<String>, config: MemberlistConfig) -> Self {
        let node_name = node_name.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let advertised = config.advertise_addr.unwrap_or(config.bind_addr);
        let shared = Arc::new(Shared {
            local_name: node_name.clone(),
            members: RwLock::new(HashMap::new()),
            events,
            local_meta: RwLock::new(NodeMeta {
                addr: advertised,
                tags: config.tags.clone(),
            }),
            queue: Mutex::new(VecDeque::new()),
        });
        Self {
            node_name,
            config,
            shared,
            memberlist: Mutex::new(None),
        }
    }

    fn handle(&self) -> Result<Arc<Memberlist<Transport, GossipDelegate>>> {
        self.memberlist
            .lock()
            .clone()
            .ok_or_else(|| MembershipError::NotStarted.into())
    }
}

#[async_trait]
impl MembershipProvider for MemberlistMembership {
    async fn start(&self) -> Result<()> {
        if self.memberlist.lock().is_some() {
            return Ok(());
        }
        info!(
            member = %self.node_name,
            bind_addr = %self.config.bind_addr,
            "starting memberlist"
        );

        // fail early rather than gossip empty metadata
        let meta = self.shared.local_meta.read().clone();
        meta.to_meta()?;

        let delegate: GossipDelegate = CompositeDelegate::new()
            .with_node_delegate(GossipNodeDelegate {
                shared: self.shared.clone(),
            })
            .with_event_delegate(GossipEventDelegate {
                shared: self.shared.clone(),
            });

        let mut transport_opts = NetTransportOptions::<
            SmolStr,
            SocketAddrResolver<TokioRuntime>,
            Tcp<TokioRuntime>,
        >::new(SmolStr::from(self.node_name.as_str()));
        transport_opts.add_bind_address(self.config.bind_addr.into());
        if let Some(advertise_addr) = self.config.advertise_addr {
            transport_opts = transport_opts.with_advertise_address(advertise_addr.into());
        }

        let memberlist = Memberlist::with_delegate(delegate, transport_opts, Options::local())
            .await
            .map_err(|e| MembershipError::BindError(e.to_string()))?;

        self.shared.members.write().insert(
            self.node_name.clone(),
            Member {
                name: self.node_name.clone(),
                addr: meta.addr,
                tags: meta.tags,
                status: MemberStatus::Alive,
            },
        );
        *self.memberlist.lock() = Some(Arc::new(memberlist));

        if !self.config.seed_nodes.is_empty() {
            let seeds = self.config.seed_nodes.clone();
            if let Err(e) = self.join(&seeds).await {
                // seeds may come up later; the caller can join again
                warn!(error = %e, "initial join failed");
            }
        }
        Ok(())
    }

    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let memberlist = self.handle()?;
        let mut joined = 0;
        for seed in seeds {
            let node = memberlist::transport::Node::new(
                format!("seed-{}", seed).into(),
                MaybeResolvedAddress::Resolved(*seed),
            );
            match memberlist.join(node).await {
                Ok(_) => {
                    info!(seed = %seed, "joined seed node");
                    joined += 1;
                }
                Err(e) => warn!(seed = %seed, error = %e, "failed to join seed node"),
            }
        }
        if joined == 0 && !seeds.is_empty() {
            return Err(MembershipError::JoinError(format!("no seed in {seeds:?} answered")).into());
        }
        Ok(joined)
    }

    async fn leave(&self) -> Result<()> {
        let memberlist = self.handle()?;
        info!(member = %self.node_name, "leaving memberlist");
        memberlist
            .leave(self.config.leave_timeout)
            .await
            .map_err(|e| MembershipError::TransportError(e.to_string()))?;
        self.shutdown().await
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.shared.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn prune_departed(&self) -> usize {
        self.shared.prune_departed()
    }

    fn local_name(&self) -> String {
        self.node_name.clone()
    }

    fn broadcast(&self, name: &str, payload: Bytes, coalesce: bool) -> Result<()> {
        self.handle()?;
        let msg = GossipMessage::User {
            name: name.to_string(),
            payload: payload.to_vec(),
            from: self.node_name.clone(),
        };
        let key = coalesce.then(|| format!("user:{name}"));
        self.shared.enqueue(key, &msg)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.shared.events.subscribe()
    }

    async fn shutdown(&self) -> Result<()> {
        let memberlist = self.memberlist.lock().take();
        if let Some(memberlist) = memberlist {
            info!(member = %self.node_name, "shutting down memberlist");
            memberlist
                .shutdown()
                .await
                .map_err(|e| MembershipError::TransportError(e.to_string()))?;
        }
        Ok(())
    }

    async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        let candidate = NodeMeta {
            addr: self.shared.local_meta.read().addr,
            tags: tags.clone(),
        };
        candidate.to_meta()?;
        *self.shared.local_meta.write() = candidate;

        let local = {
            let mut members = self.shared.members.write();
            members.get_mut(&self.node_name).map(|m| {
                m.tags = tags.clone();
                m.clone()
            })
        };
        if let Some(member) = local {
            self.shared.emit(MembershipEvent::Update(member));
            let msg = GossipMessage::Tags {
                member: self.node_name.clone(),
                tags,
            };
            self.shared.enqueue(Some("tags".to_string()), &msg)?;
        }
        Ok(())
    }
}
