//! Timestamp and signing collaborators.
//!
//! The packer only orders and chains entries. Producing an entry needs a
//! timestamp that is safely in the past (commit wait) and a signature over
//! `(digest, salt, timestamp)`; both come from outside through these traits.

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest as _, Sha512};
use std::sync::Arc;
use std::time::Duration;

use crate::context::CallContext;
use crate::error::Result;
use crate::types::{Digest, Entry, Timestamp};

/// Salt bytes attached to each notarized digest.
pub const SALT_LEN: usize = 16;

/// Source of commit-wait-safe timestamps.
#[async_trait]
pub trait CommitClock: Send + Sync + 'static {
    /// Resolves with a timestamp once it is known to be in the past on
    /// every correctly synchronized clock.
    async fn commit_safe_timestamp(&self, ctx: &CallContext) -> Result<Timestamp>;
}

/// Produces signatures over notarized triples.
pub trait Signer: Send + Sync + 'static {
    fn sign(&self, digest: &Digest, salt: &[u8], timestamp: Timestamp) -> Result<Vec<u8>>;

    fn public_key(&self) -> Vec<u8>;
}

/// Local wall clock with a fixed uncertainty bound.
///
/// Returns the latest time the clock could be reading, then waits twice the
/// bound so that time has certainly passed.
#[derive(Debug, Clone)]
pub struct SystemClock {
    uncertainty: Duration,
}

impl SystemClock {
    pub fn new(uncertainty: Duration) -> Self {
        Self { uncertainty }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

#[async_trait]
impl CommitClock for SystemClock {
    async fn commit_safe_timestamp(&self, ctx: &CallContext) -> Result<Timestamp> {
        let latest = Timestamp::now().as_nanos() + self.uncertainty.as_nanos() as u64;
        ctx.run(tokio::time::sleep(self.uncertainty * 2)).await?;
        Ok(Timestamp::from_nanos(latest))
    }
}

/// Keyed SHA-512 "signer" for development and single-operator deployments.
///
/// This authenticates entries to whoever holds the key; it is not a
/// public-key signature.
#[derive(Clone)]
pub struct KeyedHashSigner {
    key: Vec<u8>,
    key_id: Vec<u8>,
}

impl KeyedHashSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        let key_id = Sha512::digest(&key)[..16].to_vec();
        Self { key, key_id }
    }
}

impl std::fmt::Debug for KeyedHashSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedHashSigner")
            .field("key_id", &hex::encode(&self.key_id))
            .finish()
    }
}

impl Signer for KeyedHashSigner {
    fn sign(&self, digest: &Digest, salt: &[u8], timestamp: Timestamp) -> Result<Vec<u8>> {
        let mut h = Sha512::new();
        h.update(&self.key);
        h.update(digest.as_bytes());
        h.update(salt);
        h.update(timestamp.as_nanos().to_le_bytes());
        Ok(h.finalize().to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.key_id.clone()
    }
}

/// Builds signed entries from document digests.
#[derive(Clone)]
pub struct Notary {
    clock: Arc<dyn CommitClock>,
    signer: Arc<dyn Signer>,
}

impl std::fmt::Debug for Notary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notary").finish_non_exhaustive()
    }
}

impl Notary {
    pub fn new(clock: Arc<dyn CommitClock>, signer: Arc<dyn Signer>) -> Self {
        Self { clock, signer }
    }

    /// Salt, timestamp, and sign `digest`.
    pub async fn notarize(&self, ctx: &CallContext, digest: Digest) -> Result<Entry> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::rng().fill(&mut salt[..]);
        let timestamp = self.clock.commit_safe_timestamp(ctx).await?;
        let signature = self.signer.sign(&digest, &salt, timestamp)?;
        Ok(Entry::new(digest, salt, timestamp).with_signature(signature, self.signer.public_key()))
    }
}
