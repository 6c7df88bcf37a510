//! Configuration types for a packchain node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::DIGEST_LEN;

/// Tag under which members advertise the port serving prefix requests.
pub const DEFAULT_SERVING_PORT_TAG: &str = "_packchainPort";

/// Main configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Gossip-visible member name; must be unique in the cluster.
    pub node_name: String,

    /// Address to bind for forwarded prefix requests.
    pub serve_addr: SocketAddr,

    /// Where pack objects live.
    pub store: StoreConfig,

    /// Per-prefix packer configuration.
    pub packer: PackerConfig,

    /// Consistent-hash ring configuration.
    pub ring: RingConfig,

    /// Gossip membership configuration.
    pub memberlist: MemberlistConfig,

    /// Peer forwarding configuration.
    pub forwarding: ForwardingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            serve_addr: SocketAddr::from(([127, 0, 0, 1], 7100)),
            store: StoreConfig::default(),
            packer: PackerConfig::default(),
            ring: RingConfig::default(),
            memberlist: MemberlistConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, serve_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            serve_addr,
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_packer_config(mut self, packer: PackerConfig) -> Self {
        self.packer = packer;
        self
    }

    pub fn with_ring_config(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }

    pub fn with_memberlist_config(mut self, memberlist: MemberlistConfig) -> Self {
        self.memberlist = memberlist;
        self
    }

    pub fn with_forwarding_config(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = forwarding;
        self
    }

    /// Check invariants the rest of the node relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Config("node_name must not be empty".into()));
        }
        if self.store.location.is_empty() {
            return Err(Error::Config("store location must not be empty".into()));
        }
        self.packer.validate()?;
        self.ring.validate()?;
        if self.forwarding.max_frame_size < 1024 {
            return Err(Error::Config("max_frame_size must be at least 1KiB".into()));
        }
        Ok(())
    }
}

/// Backing store selection.
///
/// `memory://` selects an in-process object store; anything else is a
/// filesystem directory.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub location: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: "memory://".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

/// Per-prefix packer configuration.
#[derive(Debug, Clone)]
pub struct PackerConfig {
    /// Entries per pack; also the batcher's buffer bound.
    pub max_pack_entries: usize,

    /// Commit attempts per batch before giving up on conflicts.
    pub max_commit_attempts: u32,

    /// Names requested per list call while probing for the next sequence number.
    pub list_page_size: usize,

    /// Hex nibbles of the document digest used as the prefix.
    pub prefix_nibbles: usize,

    /// Notarize each committed pack's digest one prefix level up.
    pub rollup: bool,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            max_pack_entries: 100,
            max_commit_attempts: 5,
            list_page_size: 1000,
            prefix_nibbles: 5,
            rollup: true,
        }
    }
}

impl PackerConfig {
    pub fn with_max_pack_entries(mut self, n: usize) -> Self {
        self.max_pack_entries = n;
        self
    }

    pub fn with_max_commit_attempts(mut self, n: u32) -> Self {
        self.max_commit_attempts = n;
        self
    }

    pub fn with_list_page_size(mut self, n: usize) -> Self {
        self.list_page_size = n;
        self
    }

    pub fn with_prefix_nibbles(mut self, n: usize) -> Self {
        self.prefix_nibbles = n;
        self
    }

    pub fn with_rollup(mut self, enabled: bool) -> Self {
        self.rollup = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pack_entries == 0 || self.max_pack_entries > u32::MAX as usize {
            return Err(Error::Config("max_pack_entries out of range".into()));
        }
        if self.max_commit_attempts == 0 {
            return Err(Error::Config("max_commit_attempts must be positive".into()));
        }
        if self.list_page_size == 0 {
            return Err(Error::Config("list_page_size must be positive".into()));
        }
        if self.prefix_nibbles > DIGEST_LEN * 2 {
            return Err(Error::Config(format!(
                "prefix_nibbles must be at most {}",
                DIGEST_LEN * 2
            )));
        }
        Ok(())
    }
}

/// Adaptive batcher configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Items buffered while handlers run before `add` blocks.
    pub max_buffered: usize,

    /// Handler invocations allowed in flight at once.
    pub max_concurrent_handlers: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_buffered: 100,
            max_concurrent_handlers: 1,
        }
    }
}

impl BatcherConfig {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            max_buffered,
            ..Default::default()
        }
    }

    /// Allow several handlers at once. Batches may then complete out of order.
    pub fn with_max_concurrent_handlers(mut self, n: usize) -> Self {
        self.max_concurrent_handlers = n;
        self
    }
}

/// Consistent-hash ring configuration.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Virtual nodes per member.
    pub vnodes_per_member: usize,

    /// Rebuild at least this often even without membership events.
    pub forced_rebuild_interval: Duration,

    /// Tag holding a member's serving port.
    pub serving_port_tag: String,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            vnodes_per_member: 100,
            forced_rebuild_interval: Duration::from_secs(30),
            serving_port_tag: DEFAULT_SERVING_PORT_TAG.to_string(),
        }
    }
}

impl RingConfig {
    pub fn with_vnodes_per_member(mut self, n: usize) -> Self {
        self.vnodes_per_member = n;
        self
    }

    pub fn with_forced_rebuild_interval(mut self, interval: Duration) -> Self {
        self.forced_rebuild_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.vnodes_per_member == 0 {
            return Err(Error::Config("vnodes_per_member must be positive".into()));
        }
        if self.forced_rebuild_interval.is_zero() {
            return Err(Error::Config(
                "forced_rebuild_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Memberlist gossip configuration.
#[derive(Debug, Clone)]
pub struct MemberlistConfig {
    /// Use memberlist gossip; when false the node runs alone.
    pub enabled: bool,

    /// Address to bind for gossip.
    pub bind_addr: SocketAddr,

    /// Address to advertise to other members.
    pub advertise_addr: Option<SocketAddr>,

    /// Gossip addresses to join at startup.
    pub seed_nodes: Vec<SocketAddr>,

    /// Extra tags advertised alongside the serving port.
    pub tags: HashMap<String, String>,

    /// How long a graceful leave may take.
    pub leave_timeout: Duration,
}

impl Default for MemberlistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7946)),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            tags: HashMap::new(),
            leave_timeout: Duration::from_secs(5),
        }
    }
}

impl MemberlistConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            enabled: true,
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_seed_nodes(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seed_nodes = seeds;
        self
    }

    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Peer forwarding configuration.
#[derive(Debug, Clone)]
pub struct ForwardingConfig {
    pub connect_timeout: Duration,

    /// Upper bound on a forwarded submit; the caller's deadline may be tighter.
    pub request_timeout: Duration,

    pub max_frame_size: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}
