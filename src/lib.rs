//! Sharded, append-only, hash-chained notarization log.
//!
//! Document digests are timestamped, signed, and appended to per-prefix
//! chains of immutable "pack" objects. Each pack names the digest of the one
//! before it, so a chain can be verified from any pack back to the first.
//!
//! This crate provides:
//! - **Create-if-absent storage** on a local directory or any `object_store`
//!   backend, the only coordination primitive between writers
//! - **Per-prefix packers** that batch concurrent submissions into packs and
//!   recover from write races optimistically
//! - **Gossip membership** and a consistent-hash ring deciding which member
//!   packs which prefix, with TCP forwarding to the owner
//!
//! # Example
//!
//! ```rust,no_run
//! use packchain::{CallContext, Digest, NodeConfig, PackNode, StoreConfig};
//! use packchain::notary::{KeyedHashSigner, Notary, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("node-1", "127.0.0.1:7100".parse()?)
//!         .with_store(StoreConfig::new("/var/lib/packchain"));
//!     let notary = Arc::new(Notary::new(
//!         Arc::new(SystemClock::new(Duration::from_millis(5))),
//!         Arc::new(KeyedHashSigner::new(b"secret".to_vec())),
//!     ));
//!
//!     let node = PackNode::start(config, Some(notary)).await?;
//!
//!     let ctx = CallContext::with_timeout(Duration::from_secs(10));
//!     let receipt = node.notarize(&ctx, Digest::of(b"contract.pdf")).await?;
//!     println!("{} pack {} entry {}", receipt.prefix, receipt.seq_no, receipt.index);
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  PackNode                   │
//! │  • notarize(digest) -> PackReceipt          │
//! │  • submit(entry) -> PackReceipt             │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │                 PackRouter                  │
//! │  owner on the ring? local packer : forward  │
//! └─────────────────────────────────────────────┘
//!         │                         │
//!         ▼                         ▼
//! ┌───────────────┐        ┌─────────────────┐
//! │ PrefixPacker  │        │ MembershipRing  │
//! │ (one/prefix)  │        │  + PeerClients  │
//! └───────────────┘        └─────────────────┘
//!         │                         │
//!         ▼                         ▼
//! ┌───────────────┐        ┌─────────────────┐
//! │ Conditional   │        │  Membership     │
//! │ Store         │        │  Provider       │
//! └───────────────┘        └─────────────────┘
//! ```
//!
//! # Ordering
//!
//! Within a prefix, entry timestamps never decrease along the chain. An
//! entry older than the last committed one is rejected with
//! [`Error::OrderingViolation`]; equal timestamps are accepted.

pub mod batching;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod network;
pub mod node;
pub mod notary;
pub mod packer;
pub mod search;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{
    BatcherConfig, ForwardingConfig, MemberlistConfig, NodeConfig, PackerConfig, RingConfig,
    StoreConfig,
};
pub use context::CallContext;
pub use error::{Error, ErrorKind, Result};
pub use node::PackNode;
pub use types::{Digest, Entry, Prefix, Timestamp};

pub use batching::{AdaptiveBatcher, BatchHandler};
pub use cluster::{
    HashRing, Member, MembershipEvent, MembershipProvider, MembershipRing, MemberlistMembership,
    StaticMembership,
};
pub use packer::{PackReceipt, PackRouter, PrefixPacker};
pub use storage::{ConditionalStore, FsStore, ObjectStoreDriver, ObjectWriter};
