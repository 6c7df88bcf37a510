//! Membership-driven consistent-hash ring.
//!
//! The ring is rebuilt from the alive-member set on every membership event
//! and on a forced interval, in case events were missed. Rebuilds go through
//! a [`CoalescingNotifier`], so a burst of events costs at most two rebuilds.
//! Each rebuild publishes a new immutable [`RingSnapshot`] with one atomic
//! swap, so readers never take a lock or see a half-built ring.
//!
//! Only members advertising a parseable serving-port tag are placed on the
//! ring; their serving address is the gossip IP with that port.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::Member;
use super::hashring::HashRing;
use super::notify::CoalescingNotifier;
use super::provider::MembershipProvider;
use crate::config::RingConfig;
use crate::error::{Error, MembershipError, Result};
use crate::network::PeerClient;

/// A ring member with its serving address resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    /// Where the member serves forwarded requests.
    pub addr: SocketAddr,
    pub tags: HashMap<String, String>,
}

impl MemberInfo {
    fn from_member(member: &Member, port_tag: &str) -> Result<Self> {
        let missing = || MembershipError::MissingTag {
            member: member.name.clone(),
            tag: port_tag.to_string(),
        };
        let port: u16 = member
            .tags
            .get(port_tag)
            .ok_or_else(missing)?
            .parse()
            .map_err(|_| missing())?;
        Ok(Self {
            name: member.name.clone(),
            addr: SocketAddr::new(member.addr.ip(), port),
            tags: member.tags.clone(),
        })
    }
}

/// One published ring.
#[derive(Debug, Default)]
pub struct RingSnapshot {
    ring: HashRing,
    members: HashMap<String, MemberInfo>,
    generation: u64,
}

impl RingSnapshot {
    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn members(&self) -> &HashMap<String, MemberInfo> {
        &self.members
    }

    /// Increases by one per rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn owner(&self, key: &[u8]) -> Option<&MemberInfo> {
        self.ring.owner(key).and_then(|name| self.members.get(name))
    }
}

/// Creates per-peer client objects on first use.
pub trait PeerFactory: Send + Sync + 'static {
    fn create(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>>;
}

struct CachedPeer {
    addr: SocketAddr,
    client: Arc<dyn PeerClient>,
}

pub struct MembershipRing {
    provider: Arc<dyn MembershipProvider>,
    config: RingConfig,
    snapshot: ArcSwap<RingSnapshot>,
    generation: AtomicU64,
    /// Held for a whole rebuild so snapshots publish in generation order.
    rebuild: Mutex<()>,
    factory: Option<Arc<dyn PeerFactory>>,
    peers: DashMap<String, CachedPeer>,
    notifier: OnceLock<CoalescingNotifier>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MembershipRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("MembershipRing")
            .field("local", &self.provider.local_name())
            .field("members", &snapshot.ring.members())
            .field("generation", &snapshot.generation)
            .field("cached_peers", &self.peers.len())
            .finish()
    }
}

impl MembershipRing {
    /// Build the first ring and start the background rebuild tasks.
    ///
    /// `provider` must already be started.
    pub fn start(
        provider: Arc<dyn MembershipProvider>,
        config: RingConfig,
        factory: Option<Arc<dyn PeerFactory>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let period = config.forced_rebuild_interval;
        let ring = Arc::new(Self {
            provider,
            config,
            snapshot: ArcSwap::from_pointee(RingSnapshot::default()),
            generation: AtomicU64::new(0),
            rebuild: Mutex::new(()),
            factory,
            peers: DashMap::new(),
            notifier: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // subscribe first so nothing between the first build and the pump is lost
        let mut events = ring.provider.subscribe();
        ring.rebuild_now();

        let weak = Arc::downgrade(&ring);
        let (notifier, worker) = CoalescingNotifier::spawn(ring.cancel.child_token(), move || {
            let ring = weak.upgrade();
            async move {
                if let Some(ring) = ring {
                    ring.rebuild_now();
                }
            }
        });
        let _ = ring.notifier.set(notifier.clone());

        let pump = {
            let cancel = ring.cancel.clone();
            let notifier = notifier.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(event) if event.changes_membership() => {
                                debug!(event = ?event.member().map(|m| &m.name), "membership changed");
                                notifier.notify();
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "membership events lagged, rebuilding");
                                notifier.notify();
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        let ticker = {
            let cancel = ring.cancel.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => { notifier.notify(); }
                    }
                }
            })
        };

        ring.tasks.lock().extend([worker, pump, ticker]);
        Ok(ring)
    }

    /// Rebuild synchronously from the provider's current member list.
    pub fn rebuild_now(&self) -> Arc<RingSnapshot> {
        let _rebuilding = self.rebuild.lock();
        let tag = self.config.serving_port_tag.as_str();
        let mut members = HashMap::new();
        for member in self.provider.members() {
            if !member.is_alive() {
                continue;
            }
            match MemberInfo::from_member(&member, tag) {
                Ok(info) => {
                    members.insert(info.name.clone(), info);
                }
                Err(e) => warn!(member = %member.name, error = %e, "member left off the ring"),
            }
        }

        let pruned = self.provider.prune_departed();
        if pruned > 0 {
            debug!(pruned, "forgot departed members");
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let ring = HashRing::build(members.keys().cloned(), self.config.vnodes_per_member);
        let snapshot = Arc::new(RingSnapshot {
            ring,
            members,
            generation,
        });
        let previous = self.snapshot.swap(snapshot.clone());

        self.peers.retain(|name, peer| {
            snapshot
                .members
                .get(name)
                .is_some_and(|m| m.addr == peer.addr)
        });

        if previous.members != snapshot.members {
            info!(
                members = snapshot.members.len(),
                generation,
                "ring rebuilt"
            );
        } else {
            debug!(generation, "ring unchanged");
        }
        snapshot
    }

    /// Queue a coalesced rebuild.
    pub fn request_rebuild(&self) -> bool {
        self.notifier.get().is_some_and(|n| n.notify())
    }

    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot.load_full()
    }

    pub fn local_name(&self) -> String {
        self.provider.local_name()
    }

    pub fn provider(&self) -> &Arc<dyn MembershipProvider> {
        &self.provider
    }

    /// Owner of `key` as of the latest published ring.
    pub fn owner(&self, key: &[u8]) -> Option<MemberInfo> {
        self.snapshot.load().owner(key).cloned()
    }

    /// Whether this process owns `key`. False on an empty ring.
    pub fn is_local(&self, key: &[u8]) -> bool {
        let local = self.provider.local_name();
        self.snapshot
            .load()
            .ring
            .owner(key)
            .is_some_and(|owner| owner == local)
    }

    /// Client for `member`, created on first use and cached until the member
    /// leaves the ring or changes address.
    pub fn peer(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>> {
        if let Some(cached) = self.peers.get(&member.name) {
            if cached.addr == member.addr {
                return Ok(cached.client.clone());
            }
        }
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| Error::Config("membership ring has no peer factory".into()))?;
        let client = factory.create(member)?;
        debug!(member = %member.name, addr = %member.addr, "created peer client");
        self.peers.insert(
            member.name.clone(),
            CachedPeer {
                addr: member.addr,
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Owner of `key` with its client; `None` on an empty ring.
    pub fn peer_object(&self, key: &[u8]) -> Result<Option<(MemberInfo, Arc<dyn PeerClient>)>> {
        match self.owner(key) {
            Some(member) => {
                let client = self.peer(&member)?;
                Ok(Some((member, client)))
            }
            None => Ok(None),
        }
    }

    /// Like [`peer_object`](Self::peer_object) but discards any cached client
    /// first, e.g. after the old one failed.
    pub fn refresh_peer_object(
        &self,
        key: &[u8],
    ) -> Result<Option<(MemberInfo, Arc<dyn PeerClient>)>> {
        if let Some(owner) = self.owner(key) {
            self.drop_peer(&owner.name);
        }
        self.peer_object(key)
    }

    pub fn drop_peer(&self, name: &str) {
        self.peers.remove(name);
    }

    pub fn cached_peers(&self) -> usize {
        self.peers.len()
    }

    /// Stop the background tasks. The last published ring stays readable.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.peers.clear();
        debug!("membership ring stopped");
    }
}

impl Drop for MembershipRing {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticMembership;
    use crate::config::DEFAULT_SERVING_PORT_TAG;
    use crate::context::CallContext;
    use crate::packer::PackReceipt;
    use crate::types::{Entry, Prefix};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn member(name: &str, gossip_port: u16, serve_port: u16) -> Member {
        Member::new(name, SocketAddr::from(([127, 0, 0, 1], gossip_port)))
            .with_tag(DEFAULT_SERVING_PORT_TAG, serve_port.to_string())
    }

    struct NullPeer(SocketAddr);

    #[async_trait]
    impl PeerClient for NullPeer {
        async fn submit(&self, _: &CallContext, _: &Prefix, _: Entry) -> Result<PackReceipt> {
            Err(Error::Closed)
        }
        async fn ping(&self, _: &CallContext) -> Result<()> {
            Ok(())
        }
        fn addr(&self) -> SocketAddr {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingFactory(AtomicUsize);

    impl PeerFactory for CountingFactory {
        fn create(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullPeer(member.addr)))
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn started(local: Member) -> Arc<StaticMembership> {
        let provider = Arc::new(StaticMembership::new(local));
        provider.start().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_initial_ring_has_local_member() {
        let provider = started(member("a", 1, 101)).await;
        let ring = MembershipRing::start(provider, RingConfig::default(), None).unwrap();
        let owner = ring.owner(b"abcde").unwrap();
        assert_eq!(owner.name, "a");
        assert_eq!(owner.addr, SocketAddr::from(([127, 0, 0, 1], 101)));
        assert!(ring.is_local(b"abcde"));
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_members_without_port_tag_are_excluded() {
        let provider = started(member("a", 1, 101)).await;
        provider.insert_member(Member::new("untagged", "127.0.0.1:2".parse().unwrap()));
        provider.insert_member(
            Member::new("bad", "127.0.0.1:3".parse().unwrap())
                .with_tag(DEFAULT_SERVING_PORT_TAG, "http"),
        );
        let ring = MembershipRing::start(provider, RingConfig::default(), None).unwrap();
        assert_eq!(ring.snapshot().ring().members().to_vec(), vec!["a".to_string()]);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_trigger_rebuild() {
        let provider = started(member("a", 1, 101)).await;
        let ring = MembershipRing::start(provider.clone(), RingConfig::default(), None).unwrap();
        let first = ring.snapshot().generation();

        provider.insert_member(member("b", 2, 102));
        wait_for(|| ring.snapshot().ring().contains("b")).await;
        assert!(ring.snapshot().generation() > first);

        provider.fail_member("b");
        wait_for(|| !ring.snapshot().ring().contains("b")).await;
        // the rebuild that dropped b also forgot it
        assert!(provider.members().iter().all(|m| m.name != "b"));
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_rebuild_interval() {
        let provider = started(member("a", 1, 101)).await;
        let cfg = RingConfig::default().with_forced_rebuild_interval(Duration::from_millis(10));
        let ring = MembershipRing::start(provider, cfg, None).unwrap();
        wait_for(|| ring.snapshot().generation() >= 4).await;
        ring.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rebuilds_publish_latest_generation() {
        let provider = started(member("a", 1, 101)).await;
        let ring = MembershipRing::start(provider.clone(), RingConfig::default(), None).unwrap();
        // stop the background worker so only the threads below rebuild
        ring.shutdown().await;
        let start = ring.snapshot().generation();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let ring = ring.clone();
                let provider = provider.clone();
                std::thread::spawn(move || {
                    for j in 0..50u16 {
                        provider.insert_member(member(&format!("m{i}"), 10 + i, 200 + j));
                        ring.rebuild_now();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(ring.snapshot().generation(), start + 400);
        let last = ring.rebuild_now();
        assert_eq!(last.generation(), start + 401);
        assert_eq!(last.members().len(), 9);
    }

    #[tokio::test]
    async fn test_owner_is_stable_across_rebuilds() {
        let provider = started(member("a", 1, 101)).await;
        provider.insert_member(member("b", 2, 102));
        provider.insert_member(member("c", 3, 103));
        let ring = MembershipRing::start(provider, RingConfig::default(), None).unwrap();
        let keys: Vec<String> = (0..200).map(|i| format!("{i:05x}")).collect();
        let before: Vec<_> = keys.iter().map(|k| ring.owner(k.as_bytes())).collect();
        ring.rebuild_now();
        let after: Vec<_> = keys.iter().map(|k| ring.owner(k.as_bytes())).collect();
        assert_eq!(before, after);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_objects_cached_and_dropped_on_leave() {
        let provider = started(member("a", 1, 101)).await;
        provider.insert_member(member("b", 2, 102));
        let factory = Arc::new(CountingFactory::default());
        let peers: Arc<dyn PeerFactory> = factory.clone();
        let ring =
            MembershipRing::start(provider.clone(), RingConfig::default(), Some(peers)).unwrap();

        let b = ring.snapshot().members()["b"].clone();
        let first = ring.peer(&b).unwrap();
        let second = ring.peer(&b).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.addr(), b.addr);

        provider.remove_member("b");
        wait_for(|| ring.cached_peers() == 0).await;

        // a refresh always builds a new client
        let key = (0..)
            .map(|i: u32| format!("{i:05x}"))
            .find(|k| ring.owner(k.as_bytes()).is_some())
            .unwrap();
        ring.peer_object(key.as_bytes()).unwrap().unwrap();
        let created = factory.0.load(Ordering::SeqCst);
        ring.refresh_peer_object(key.as_bytes()).unwrap().unwrap();
        assert_eq!(factory.0.load(Ordering::SeqCst), created + 1);
        ring.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_without_factory() {
        let provider = started(member("a", 1, 101)).await;
        let ring = MembershipRing::start(provider, RingConfig::default(), None).unwrap();
        let owner = ring.owner(b"x").unwrap();
        assert!(matches!(ring.peer(&owner), Err(Error::Config(_))));
        ring.shutdown().await;
    }
}
