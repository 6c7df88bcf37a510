//! A complete packchain node.
//!
//! ```text
//!            submit / notarize
//!                   │
//!                   ▼
//!   ┌────────────────────────────┐      forwarded submit      ┌──────────┐
//!   │         PackRouter         │ ─────────────────────────▶ │ PackNode │
//!   │  ring owner? local packer  │ ◀───────────────────────── │  (peer)  │
//!   └────────────────────────────┘        PackServer          └──────────┘
//!          │                 │
//!          ▼                 ▼
//!   ┌─────────────┐   ┌───────────────┐
//!   │PrefixPacker │   │MembershipRing │◀── MembershipProvider events
//!   │ per prefix  │   └───────────────┘
//!   └─────────────┘
//!          │
//!          ▼
//!   ConditionalStore
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::{
    Member, MemberlistMembership, MembershipProvider, MembershipRing, PeerFactory,
    StaticMembership,
};
use crate::config::NodeConfig;
use crate::context::CallContext;
use crate::error::Result;
use crate::network::{PackServer, TcpPeerFactory};
use crate::notary::Notary;
use crate::packer::{PackReceipt, PackRouter};
use crate::storage::{open_store, ConditionalStore};
use crate::types::{Digest, Entry};

/// Store, ring, router, and forwarding server for one member.
pub struct PackNode {
    config: NodeConfig,
    serve_addr: SocketAddr,
    store: Arc<dyn ConditionalStore>,
    provider: Arc<dyn MembershipProvider>,
    ring: Arc<MembershipRing>,
    router: Arc<PackRouter>,
    shutdown: CancellationToken,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PackNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackNode")
            .field("name", &self.config.node_name)
            .field("serve_addr", &self.serve_addr)
            .field("store", &self.store.describe())
            .finish()
    }
}

impl PackNode {
    /// Start a node with the membership its config selects.
    ///
    /// With gossip disabled the node is a cluster of one.
    pub async fn start(config: NodeConfig, notary: Option<Arc<Notary>>) -> Result<Self> {
        let provider: Arc<dyn MembershipProvider> = if config.memberlist.enabled {
            Arc::new(MemberlistMembership::new(
                config.node_name.clone(),
                config.memberlist.clone(),
            ))
        } else {
            Arc::new(StaticMembership::new(Member::new(
                config.node_name.clone(),
                config.serve_addr,
            )))
        };
        Self::start_with_provider(config, provider, notary).await
    }

    /// Start a node on an existing, not yet started, membership provider.
    pub async fn start_with_provider(
        config: NodeConfig,
        provider: Arc<dyn MembershipProvider>,
        notary: Option<Arc<Notary>>,
    ) -> Result<Self> {
        config.validate()?;
        info!(node = %config.node_name, "starting pack node");

        let store = open_store(&config.store)?;
        let server = PackServer::bind(config.serve_addr, config.forwarding.max_frame_size).await?;
        let serve_addr = server.local_addr()?;

        let mut tags = config.memberlist.tags.clone();
        tags.insert(
            config.ring.serving_port_tag.clone(),
            serve_addr.port().to_string(),
        );
        provider.set_tags(tags).await?;
        provider.start().await?;

        let factory: Arc<dyn PeerFactory> =
            Arc::new(TcpPeerFactory::new(config.forwarding.clone()));
        let ring = MembershipRing::start(provider.clone(), config.ring.clone(), Some(factory))?;
        let router = PackRouter::new(
            store.clone(),
            config.packer.clone(),
            Some(ring.clone()),
            notary,
        );

        let shutdown = CancellationToken::new();
        let server_task = {
            let router = router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(router, shutdown).await {
                    error!(error = %e, "pack server stopped");
                }
            })
        };

        info!(
            node = %config.node_name,
            serve_addr = %serve_addr,
            store = %store.describe(),
            members = ring.snapshot().ring().len(),
            "pack node started"
        );
        Ok(Self {
            config,
            serve_addr,
            store,
            provider,
            ring,
            router,
            shutdown,
            server_task: Mutex::new(Some(server_task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    /// Address the forwarding server actually bound.
    pub fn serve_addr(&self) -> SocketAddr {
        self.serve_addr
    }

    pub fn store(&self) -> &Arc<dyn ConditionalStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn MembershipProvider> {
        &self.provider
    }

    pub fn ring(&self) -> &Arc<MembershipRing> {
        &self.ring
    }

    pub fn router(&self) -> &Arc<PackRouter> {
        &self.router
    }

    pub async fn submit(&self, ctx: &CallContext, entry: Entry) -> Result<PackReceipt> {
        self.router.submit(ctx, entry).await
    }

    pub async fn notarize(&self, ctx: &CallContext, digest: Digest) -> Result<PackReceipt> {
        self.router.notarize(ctx, digest).await
    }

    /// Stop serving, drain local packers, and leave the cluster.
    pub async fn shutdown(&self) {
        info!(node = %self.config.node_name, "shutting down pack node");
        self.shutdown.cancel();
        if let Some(task) = self.server_task.lock().await.take() {
            let _ = task.await;
        }
        self.router.close().await;
        self.ring.shutdown().await;
        if let Err(e) = self.provider.leave().await {
            warn!(error = %e, "leaving membership failed");
            if let Err(e) = self.provider.shutdown().await {
                warn!(error = %e, "membership shutdown failed");
            }
        }
    }
}
