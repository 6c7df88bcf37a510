//! Prefix routing.
//!
//! The router decides which member owns a prefix and, for prefixes owned
//! locally, hands out the one [`PrefixPacker`] for it, creating it on first
//! use.
//!
//! The registry is an immutable map behind an [`ArcSwap`]: lookups are a
//! pointer load and inserts copy the map. Creation goes through a per-prefix
//! [`OnceCell`] gate, so concurrent first requests for a prefix run a single
//! `initialize` and share its packer.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::prefix_packer::{PackReceipt, PrefixPacker, RollupSink};
use crate::cluster::{MemberInfo, MembershipRing};
use crate::config::PackerConfig;
use crate::context::CallContext;
use crate::error::{Error, ErrorKind, Result};
use crate::network::SubmitHandler;
use crate::notary::Notary;
use crate::storage::ConditionalStore;
use crate::types::{Digest, Entry, Prefix};

/// Upper bound on one roll-up notarization, commit-wait included.
const ROLLUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Where requests for a prefix go.
#[derive(Debug, Clone)]
pub enum Route {
    Local(Arc<PrefixPacker>),
    Remote(MemberInfo),
}

type Gate = Arc<OnceCell<Arc<PrefixPacker>>>;

pub struct PackRouter {
    store: Arc<dyn ConditionalStore>,
    config: PackerConfig,
    ring: Option<Arc<MembershipRing>>,
    notary: Option<Arc<Notary>>,
    registry: ArcSwap<HashMap<Prefix, Arc<PrefixPacker>>>,
    gates: DashMap<Prefix, Gate>,
    rollup: Option<Arc<dyn RollupSink>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PackRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackRouter")
            .field("store", &self.store.describe())
            .field("packers", &self.registry.load().len())
            .field("clustered", &self.ring.is_some())
            .field("rollup", &self.rollup.is_some())
            .finish()
    }
}

impl PackRouter {
    /// A router over `store`.
    ///
    /// Without a ring every prefix is local. Roll-up runs only when enabled
    /// in `config` and a `notary` is given to sign the parent entries.
    pub fn new(
        store: Arc<dyn ConditionalStore>,
        config: PackerConfig,
        ring: Option<Arc<MembershipRing>>,
        notary: Option<Arc<Notary>>,
    ) -> Arc<Self> {
        let with_rollup = config.rollup && notary.is_some();
        Arc::new_cyclic(|router: &Weak<PackRouter>| {
            let rollup: Option<Arc<dyn RollupSink>> = with_rollup.then(|| {
                Arc::new(RouterRollup {
                    router: router.clone(),
                }) as Arc<dyn RollupSink>
            });
            Self {
                store,
                config,
                ring,
                notary,
                registry: ArcSwap::from_pointee(HashMap::new()),
                gates: DashMap::new(),
                rollup,
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    /// Shard prefix for a document digest.
    pub fn prefix_for(&self, digest: &Digest) -> Prefix {
        Prefix::of_digest(digest, self.config.prefix_nibbles)
    }

    /// Resolve the owner of `prefix`, creating the local packer if it is ours.
    pub async fn route(&self, prefix: &Prefix) -> Result<Route> {
        if let Some(ring) = &self.ring {
            if let Some(owner) = ring.owner(prefix.as_str().as_bytes()) {
                if owner.name != ring.local_name() {
                    return Ok(Route::Remote(owner));
                }
            }
        }
        Ok(Route::Local(self.local_packer(prefix).await?))
    }

    /// The local packer for `prefix`, regardless of ring ownership.
    pub async fn local_packer(&self, prefix: &Prefix) -> Result<Arc<PrefixPacker>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Some(packer) = self.registry.load().get(prefix) {
            return Ok(packer.clone());
        }

        let gate: Gate = self
            .gates
            .entry(prefix.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        // the previous gate may have finished between the two lookups
        if let Some(packer) = self.registry.load().get(prefix) {
            self.gates.remove_if(prefix, |_, g| Arc::ptr_eq(g, &gate));
            return Ok(packer.clone());
        }
        let result = gate
            .get_or_try_init(|| {
                debug!(prefix = %prefix, "creating prefix packer");
                PrefixPacker::initialize(
                    prefix.clone(),
                    self.store.clone(),
                    self.config.clone(),
                    self.rollup.clone(),
                )
            })
            .await
            .cloned();

        if let Ok(packer) = &result {
            self.registry.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.entry(prefix.clone()).or_insert_with(|| packer.clone());
                next
            });
        } else {
            warn!(prefix = %prefix, "prefix packer initialization failed");
        }
        // registry first, then the gate: a lookup always finds one of them
        self.gates.remove_if(prefix, |_, g| Arc::ptr_eq(g, &gate));

        let packer = result?;
        // close() may have snapshotted the registry before the insert above
        if self.closed.load(Ordering::SeqCst) {
            packer.close().await;
            return Err(Error::Closed);
        }
        Ok(packer)
    }

    /// Notarized `entry` goes to the prefix derived from its digest.
    pub async fn submit(&self, ctx: &CallContext, entry: Entry) -> Result<PackReceipt> {
        let prefix = self.prefix_for(&entry.digest);
        self.submit_to_prefix(ctx, prefix, entry).await
    }

    /// Submit to an explicit prefix, forwarding when another member owns it.
    pub async fn submit_to_prefix(
        &self,
        ctx: &CallContext,
        prefix: Prefix,
        entry: Entry,
    ) -> Result<PackReceipt> {
        if prefix.len() > self.config.prefix_nibbles {
            return Err(Error::InvalidEntry(format!(
                "prefix {prefix:?} is longer than {} nibbles",
                self.config.prefix_nibbles
            )));
        }
        match self.route(&prefix).await? {
            Route::Local(packer) => packer.submit(ctx, entry).await,
            Route::Remote(owner) => self.forward(ctx, &owner, &prefix, entry).await,
        }
    }

    async fn forward(
        &self,
        ctx: &CallContext,
        owner: &MemberInfo,
        prefix: &Prefix,
        entry: Entry,
    ) -> Result<PackReceipt> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| Error::Internal("remote route without a ring".into()))?;
        let client = ring.peer(owner)?;
        let result = client.submit(ctx, prefix, entry).await;
        if let Err(e) = &result {
            if matches!(e, Error::Network(_)) {
                // the next request reconnects from scratch
                ring.drop_peer(&owner.name);
            }
            if e.kind() != ErrorKind::DeadlineExceeded {
                warn!(prefix = %prefix, member = %owner.name, error = %e, "forwarded submission failed");
            }
        }
        result
    }

    /// Notarize `digest` and submit the resulting entry.
    pub async fn notarize(&self, ctx: &CallContext, digest: Digest) -> Result<PackReceipt> {
        let notary = self
            .notary
            .as_ref()
            .ok_or_else(|| Error::Config("router has no notary".into()))?;
        let entry = notary.notarize(ctx, digest).await?;
        self.submit(ctx, entry).await
    }

    pub fn packer(&self, prefix: &Prefix) -> Option<Arc<PrefixPacker>> {
        self.registry.load().get(prefix).cloned()
    }

    /// Prefixes with a local packer, sorted.
    pub fn local_prefixes(&self) -> Vec<Prefix> {
        let mut prefixes: Vec<Prefix> = self.registry.load().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Refuse new work and drain every local packer.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let packers = self.registry.load_full();
        futures::future::join_all(packers.values().map(|p| p.close())).await;
        info!(packers = packers.len(), "pack router closed");
    }
}

#[async_trait]
impl SubmitHandler for PackRouter {
    async fn submit_local(
        &self,
        ctx: &CallContext,
        prefix: Prefix,
        entry: Entry,
    ) -> Result<PackReceipt> {
        self.local_packer(&prefix).await?.submit(ctx, entry).await
    }

    fn node_name(&self) -> String {
        self.ring
            .as_ref()
            .map(|r| r.local_name())
            .unwrap_or_else(|| "standalone".to_string())
    }

    fn max_prefix_len(&self) -> usize {
        self.config.prefix_nibbles
    }
}

/// Notarizes child pack digests into the parent prefix's chain.
struct RouterRollup {
    router: Weak<PackRouter>,
}

#[async_trait]
impl RollupSink for RouterRollup {
    async fn roll_up(&self, parent: Prefix, pack_digest: Digest) -> Result<()> {
        let router = self.router.upgrade().ok_or(Error::Closed)?;
        let notary = router
            .notary
            .clone()
            .ok_or_else(|| Error::Config("roll-up without a notary".into()))?;
        let ctx = CallContext::with_timeout(ROLLUP_TIMEOUT);
        let entry = notary.notarize(&ctx, pack_digest).await?;
        let receipt = router.submit_to_prefix(&ctx, parent, entry).await?;
        debug!(
            prefix = %receipt.prefix,
            seq_no = receipt.seq_no,
            "pack digest rolled up"
        );
        Ok(())
    }
}
