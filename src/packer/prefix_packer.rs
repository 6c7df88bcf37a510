//! Per-prefix packer.
//!
//! One packer owns the hash chain of one prefix within this process. Entries
//! submitted to it are batched by an [`AdaptiveBatcher`] with a single handler
//! slot, so at most one flush per prefix runs at a time and no lock is held
//! across storage I/O.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──► Ready ⇄ Flushing
//!                    │
//!                    ▼
//!                  Closed
//! ```
//!
//! Initialization probes storage for the next free sequence number and reads
//! the newest pack to recover the chain head (last timestamp and digest).
//!
//! # Flush
//!
//! 1. Entries older than the last committed timestamp are rejected.
//! 2. The rest are stably sorted by timestamp.
//! 3. A pack chained to the previous pack's digest is written with
//!    create-if-absent at the next sequence number.
//! 4. If another writer got there first, the packer re-probes from that
//!    sequence number, adopts the new chain head, re-checks ordering against
//!    it and tries again, up to `max_commit_attempts` times.
//!
//! Any other storage error fails every entry in the batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::format::{decode_pack, write_pack, EncodedEntry};
use crate::batching::{AdaptiveBatcher, BatchHandler};
use crate::codec::sortable;
use crate::config::{BatcherConfig, PackerConfig};
use crate::context::CallContext;
use crate::error::{Error, ErrorKind, Result};
use crate::search::try_search_batch;
use crate::storage::{CommitReceipt, ConditionalStore};
use crate::types::{
    pack_listing_prefix, pack_object_name, parse_pack_object_name, Digest, Entry, Prefix,
    Timestamp, PACK_SUFFIX,
};

/// Where a submitted entry ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackReceipt {
    pub prefix: Prefix,
    pub seq_no: u64,
    pub pack_digest: Digest,
    /// Position of the entry within the pack.
    pub index: u32,
}

/// Receives each committed pack digest for notarization one level up.
#[async_trait]
pub trait RollupSink: Send + Sync + 'static {
    async fn roll_up(&self, parent: Prefix, pack_digest: Digest) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackerState {
    Initializing = 0,
    Ready = 1,
    Flushing = 2,
    Closed = 3,
}

impl PackerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PackerState::Initializing,
            1 => PackerState::Ready,
            2 => PackerState::Flushing,
            _ => PackerState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackerStats {
    pub packs_committed: u64,
    pub entries_committed: u64,
    pub conflicts: u64,
    pub rejected: u64,
    pub failed_batches: u64,
}

/// Head of the chain as last observed in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChainHead {
    next_seq: u64,
    last_timestamp: Timestamp,
    last_digest: Digest,
}

impl ChainHead {
    const EMPTY: ChainHead = ChainHead {
        next_seq: 0,
        last_timestamp: Timestamp::ZERO,
        last_digest: Digest::ZERO,
    };
}

/// One waiting submission.
pub(crate) struct PackRequest {
    entry: EncodedEntry,
    reply: oneshot::Sender<Result<PackReceipt>>,
}

struct PackerCore {
    prefix: Prefix,
    store: Arc<dyn ConditionalStore>,
    config: PackerConfig,
    head: Mutex<ChainHead>,
    state: AtomicU8,
    rollup: Option<Arc<dyn RollupSink>>,
    packs_committed: AtomicU64,
    entries_committed: AtomicU64,
    conflicts: AtomicU64,
    rejected: AtomicU64,
    failed_batches: AtomicU64,
}

/// Sequencer for one prefix.
pub struct PrefixPacker {
    core: Arc<PackerCore>,
    batcher: AdaptiveBatcher<PackRequest>,
}

impl std::fmt::Debug for PrefixPacker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixPacker")
            .field("prefix", &self.core.prefix)
            .field("state", &self.state())
            .field("head", &*self.core.head.lock())
            .finish()
    }
}

impl PrefixPacker {
    /// Discover the chain head in `store` and start accepting entries.
    pub async fn initialize(
        prefix: Prefix,
        store: Arc<dyn ConditionalStore>,
        config: PackerConfig,
        rollup: Option<Arc<dyn RollupSink>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let core = Arc::new(PackerCore {
            prefix,
            store,
            config,
            head: Mutex::new(ChainHead::EMPTY),
            state: AtomicU8::new(PackerState::Initializing as u8),
            rollup,
            packs_committed: AtomicU64::new(0),
            entries_committed: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        });

        let head = core.discover(0).await?;
        *core.head.lock() = head;
        core.set_state(PackerState::Ready);
        info!(
            prefix = %core.prefix,
            next_seq = head.next_seq,
            last_timestamp = %head.last_timestamp,
            store = %core.store.describe(),
            "prefix packer initialized"
        );

        let batcher = AdaptiveBatcher::with_handler(
            BatcherConfig::new(core.config.max_pack_entries),
            core.clone(),
        );
        Ok(Arc::new(Self { core, batcher }))
    }

    pub fn prefix(&self) -> &Prefix {
        &self.core.prefix
    }

    /// Queue `entry` for the next pack and wait for it to be committed.
    pub async fn submit(&self, ctx: &CallContext, entry: Entry) -> Result<PackReceipt> {
        let entry = EncodedEntry::new(entry)?;
        let (reply, rx) = oneshot::channel();
        self.batcher.add(ctx, PackRequest { entry, reply }).await?;
        match ctx.run(rx).await? {
            Ok(result) => result,
            // The handler dropped the sender without replying.
            Err(_) => Err(Error::Closed),
        }
    }

    pub fn state(&self) -> PackerState {
        PackerState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    pub fn next_seq_no(&self) -> u64 {
        self.core.head.lock().next_seq
    }

    pub fn last_timestamp(&self) -> Timestamp {
        self.core.head.lock().last_timestamp
    }

    pub fn last_digest(&self) -> Digest {
        self.core.head.lock().last_digest
    }

    /// Entries waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.batcher.buffered()
    }

    pub fn stats(&self) -> PackerStats {
        let c = &self.core;
        PackerStats {
            packs_committed: c.packs_committed.load(Ordering::Relaxed),
            entries_committed: c.entries_committed.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting entries and wait for queued ones to be flushed.
    pub async fn close(&self) {
        self.batcher.close().await;
        self.core.set_state(PackerState::Closed);
        info!(prefix = %self.core.prefix, "prefix packer closed");
    }
}

#[async_trait]
impl BatchHandler<PackRequest> for PackerCore {
    async fn handle(&self, batch: Vec<PackRequest>) {
        self.set_state(PackerState::Flushing);
        self.flush(batch).await;
        // close() may have raced us; never resurrect a closed packer
        let _ = self.state.compare_exchange(
            PackerState::Flushing as u8,
            PackerState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl PackerCore {
    fn set_state(&self, state: PackerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether pack `i` is absent, scanning forward through one list page.
    ///
    /// Returns `(absent_at_last_checked, last_checked)`.
    async fn probe(&self, i: u64) -> Result<(bool, u64)> {
        let listing = pack_listing_prefix(&self.prefix);
        let start_after = match i {
            0 => None,
            _ => Some(format!(
                "{}{}{}",
                listing,
                sortable::decrement(&sortable::encode(i))?,
                PACK_SUFFIX
            )),
        };
        let page = self.config.list_page_size;
        let names = self
            .store
            .list_after(&listing, start_after.as_deref(), page)
            .await?;

        let mut expected = i;
        for name in &names {
            match parse_pack_object_name(name) {
                Ok((prefix, seq)) if prefix == self.prefix => {
                    if seq != expected {
                        // gap: `expected` is free
                        return Ok((true, expected));
                    }
                    expected += 1;
                }
                _ => debug!(prefix = %self.prefix, name, "ignoring foreign object"),
            }
        }
        if expected == i {
            return Ok((true, i));
        }
        if names.len() < page {
            // listing exhausted right after a contiguous run
            return Ok((true, expected));
        }
        Ok((false, expected - 1))
    }

    /// Find the first free sequence number at or after `from` and the chain
    /// head just before it.
    async fn discover(&self, from: u64) -> Result<ChainHead> {
        let next_seq = try_search_batch(from, |i| self.probe(i)).await?;
        if next_seq == 0 {
            return Ok(ChainHead::EMPTY);
        }
        let name = pack_object_name(&self.prefix, next_seq - 1);
        let data = self.store.read(&name).await?;
        let stored = decode_pack(&name, &data)?;
        if stored.pack.prefix != self.prefix || stored.pack.seq_no != next_seq - 1 {
            return Err(Error::Corrupt {
                name,
                reason: format!(
                    "header names prefix {:?} seq {}",
                    stored.pack.prefix.as_str(),
                    stored.pack.seq_no
                ),
            });
        }
        Ok(ChainHead {
            next_seq,
            last_timestamp: stored.last_timestamp().unwrap_or(Timestamp::ZERO),
            last_digest: stored.digest,
        })
    }

    async fn try_commit(
        &self,
        head: &ChainHead,
        entries: &[EncodedEntry],
    ) -> Result<(Digest, CommitReceipt)> {
        let name = pack_object_name(&self.prefix, head.next_seq);
        let writer = self.store.open_for_create(&name).await?;
        write_pack(writer, &self.prefix, head.next_seq, &head.last_digest, entries).await
    }

    /// Drop entries older than `last`, replying to them with an ordering error.
    fn reject_stale(
        &self,
        last: Timestamp,
        entries: &mut Vec<EncodedEntry>,
        replies: &mut Vec<oneshot::Sender<Result<PackReceipt>>>,
    ) {
        let mut kept_entries = Vec::with_capacity(entries.len());
        let mut kept_replies = Vec::with_capacity(replies.len());
        for (entry, reply) in entries.drain(..).zip(replies.drain(..)) {
            let timestamp = entry.entry.timestamp;
            if timestamp < last {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(prefix = %self.prefix, %timestamp, %last, "rejecting out-of-order entry");
                let _ = reply.send(Err(Error::OrderingViolation { timestamp, last }));
            } else {
                kept_entries.push(entry);
                kept_replies.push(reply);
            }
        }
        *entries = kept_entries;
        *replies = kept_replies;
    }

    async fn flush(&self, mut batch: Vec<PackRequest>) {
        batch.sort_by_key(|r| r.entry.entry.timestamp);
        let (mut entries, mut replies): (Vec<_>, Vec<_>) =
            batch.into_iter().map(|r| (r.entry, r.reply)).unzip();

        let mut head = *self.head.lock();
        self.reject_stale(head.last_timestamp, &mut entries, &mut replies);

        let mut attempt = 0;
        while !entries.is_empty() {
            attempt += 1;
            let err = match self.try_commit(&head, &entries).await {
                Ok((digest, receipt)) => {
                    self.on_committed(&mut head, digest, receipt, &entries, replies);
                    return;
                }
                Err(e) => e,
            };

            match err.kind() {
                ErrorKind::AlreadyExists | ErrorKind::AlreadyOpening
                    if attempt < self.config.max_commit_attempts =>
                {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        prefix = %self.prefix,
                        seq_no = head.next_seq,
                        attempt,
                        error = %err,
                        "pack commit conflicted, re-probing"
                    );
                    if err.kind() == ErrorKind::AlreadyExists {
                        head = match self.discover(head.next_seq).await {
                            Ok(h) => h,
                            Err(e) => return self.fail(replies, e),
                        };
                        *self.head.lock() = head;
                        self.reject_stale(head.last_timestamp, &mut entries, &mut replies);
                    }
                }
                ErrorKind::AlreadyExists | ErrorKind::AlreadyOpening => {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    let e = Error::RetriesExhausted {
                        prefix: self.prefix.to_string(),
                        attempts: attempt,
                    };
                    return self.fail(replies, e);
                }
                _ => return self.fail(replies, err),
            }
        }
    }

    fn on_committed(
        &self,
        head: &mut ChainHead,
        digest: Digest,
        receipt: CommitReceipt,
        entries: &[EncodedEntry],
        replies: Vec<oneshot::Sender<Result<PackReceipt>>>,
    ) {
        let seq_no = head.next_seq;
        *head = ChainHead {
            next_seq: seq_no + 1,
            last_timestamp: entries
                .last()
                .map(|e| e.entry.timestamp)
                .unwrap_or(head.last_timestamp),
            last_digest: digest,
        };
        *self.head.lock() = *head;
        self.packs_committed.fetch_add(1, Ordering::Relaxed);
        self.entries_committed
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        debug!(
            prefix = %self.prefix,
            seq_no,
            batch_len = entries.len(),
            size = receipt.size,
            crc32c = receipt.crc32c,
            "pack committed"
        );

        for (index, reply) in replies.into_iter().enumerate() {
            let _ = reply.send(Ok(PackReceipt {
                prefix: self.prefix.clone(),
                seq_no,
                pack_digest: digest,
                index: index as u32,
            }));
        }

        if !self.config.rollup {
            return;
        }
        if let (Some(sink), Some(parent)) = (self.rollup.clone(), self.prefix.parent()) {
            let child = self.prefix.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.roll_up(parent.clone(), digest).await {
                    // The child chain stands on its own; a missing roll-up only
                    // loses cross-prefix ordering for this pack.
                    warn!(prefix = %child, %parent, seq_no, error = %e, "roll-up failed");
                }
            });
        }
    }

    fn fail(&self, replies: Vec<oneshot::Sender<Result<PackReceipt>>>, err: Error) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        error!(prefix = %self.prefix, batch_len = replies.len(), error = %err, "pack batch failed");
        for reply in replies {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::format::encode_pack;
    use crate::packer::format::Pack;
    use crate::storage::{FsStore, ObjectStoreDriver};
    use std::time::Duration;

    fn entry_at(prefix: &str, n: u64, ts: u64) -> Entry {
        let mut raw = [0u8; 64];
        let head = hex::decode(format!("{prefix:0<16}")).unwrap();
        raw[..8].copy_from_slice(&head);
        raw[56..].copy_from_slice(&n.to_be_bytes());
        Entry::new(Digest::new(raw), n.to_le_bytes().to_vec(), Timestamp::from_nanos(ts))
    }

    fn config() -> PackerConfig {
        PackerConfig::default().with_rollup(false)
    }

    async fn read_pack(store: &dyn ConditionalStore, prefix: &Prefix, seq: u64) -> Pack {
        let name = pack_object_name(prefix, seq);
        decode_pack(&name, &store.read(&name).await.unwrap()).unwrap().pack
    }

    /// Seed `count` packs directly, bypassing the packer.
    async fn seed_packs(store: &dyn ConditionalStore, prefix: &Prefix, count: u64) -> Digest {
        let mut prev = Digest::ZERO;
        for seq in 0..count {
            let pack = Pack {
                prefix: prefix.clone(),
                seq_no: seq,
                prev_digest: prev,
                entries: vec![entry_at(prefix.as_str(), seq, (seq + 1) * 100)],
            };
            let (bytes, digest) = encode_pack(&pack).unwrap();
            let mut w = store
                .open_for_create(&pack_object_name(prefix, seq))
                .await
                .unwrap();
            w.write(&bytes).await.unwrap();
            w.commit_if_absent().await.unwrap();
            prev = digest;
        }
        prev
    }

    #[tokio::test]
    async fn test_initialize_empty_prefix() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let p = PrefixPacker::initialize(Prefix::new("abcde").unwrap(), store, config(), None)
            .await
            .unwrap();
        assert_eq!(p.next_seq_no(), 0);
        assert_eq!(p.last_digest(), Digest::ZERO);
        assert_eq!(p.state(), PackerState::Ready);
    }

    #[tokio::test]
    async fn test_initialize_recovers_chain_head() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let prefix = Prefix::new("0a1b2").unwrap();
        let last = seed_packs(store.as_ref(), &prefix, 37).await;
        // a neighbouring prefix must not confuse the probe
        seed_packs(store.as_ref(), &Prefix::new("0a1b").unwrap(), 3).await;

        // small pages force several probes
        let cfg = config().with_list_page_size(4);
        let p = PrefixPacker::initialize(prefix, store, cfg, None).await.unwrap();
        assert_eq!(p.next_seq_no(), 37);
        assert_eq!(p.last_digest(), last);
        assert_eq!(p.last_timestamp(), Timestamp::from_nanos(3700));
    }

    #[tokio::test]
    async fn test_sequential_packs_are_chained() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ConditionalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
        let prefix = Prefix::new("abcde").unwrap();
        let p = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
            .await
            .unwrap();
        let ctx = CallContext::background();

        let mut receipts = Vec::new();
        for (n, ts) in [(1, 10), (2, 20), (3, 30)] {
            receipts.push(p.submit(&ctx, entry_at("abcde", n, ts)).await.unwrap());
        }
        assert_eq!(
            receipts.iter().map(|r| r.seq_no).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let mut prev = Digest::ZERO;
        for (seq, receipt) in receipts.iter().enumerate() {
            let pack = read_pack(store.as_ref(), &prefix, seq as u64).await;
            assert_eq!(pack.prev_digest, prev);
            assert_eq!(pack.entries.len(), 1);
            prev = receipt.pack_digest;
        }
        assert_eq!(p.stats().packs_committed, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_batch_and_sort() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let prefix = Prefix::new("fffff").unwrap();
        let p = PrefixPacker::initialize(
            prefix.clone(),
            store.clone(),
            config().with_max_pack_entries(10),
            None,
        )
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for n in 0..50u64 {
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                p.submit(&CallContext::background(), entry_at("fffff", n, 1_000 + n))
                    .await
            }));
        }
        let mut ok = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::OrderingViolation { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        p.close().await;

        let stats = p.stats();
        assert_eq!(stats.entries_committed, ok);
        assert_eq!(stats.entries_committed + stats.rejected, 50);
        let mut last = Timestamp::ZERO;
        for seq in 0..p.next_seq_no() {
            let pack = read_pack(store.as_ref(), &prefix, seq).await;
            assert!(!pack.entries.is_empty() && pack.entries.len() <= 10);
            for e in &pack.entries {
                assert!(e.timestamp >= last);
                last = e.timestamp;
            }
        }
    }

    #[tokio::test]
    async fn test_stale_entry_rejected_equal_timestamp_allowed() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let prefix = Prefix::new("12345").unwrap();
        seed_packs(store.as_ref(), &prefix, 2).await; // last timestamp 200
        let p = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
            .await
            .unwrap();
        let ctx = CallContext::background();

        let err = p.submit(&ctx, entry_at("12345", 11, 150)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OrderingViolation { timestamp, last }
                if timestamp == Timestamp::from_nanos(150) && last == Timestamp::from_nanos(200)
        ));
        assert_eq!(p.next_seq_no(), 2, "nothing written for an all-stale batch");

        let r = p.submit(&ctx, entry_at("12345", 12, 200)).await.unwrap();
        assert_eq!(r.seq_no, 2);
        let r = p.submit(&ctx, entry_at("12345", 13, 250)).await.unwrap();
        assert_eq!(r.seq_no, 3);
        assert_eq!(p.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_conflict_reprobes_and_commits_next() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let prefix = Prefix::new("beef0").unwrap();
        seed_packs(store.as_ref(), &prefix, 5).await;

        let winner = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
            .await
            .unwrap();
        let loser = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
            .await
            .unwrap();
        assert_eq!(winner.next_seq_no(), 5);
        assert_eq!(loser.next_seq_no(), 5);

        let ctx = CallContext::background();
        let w = winner.submit(&ctx, entry_at("beef0", 100, 1_000)).await.unwrap();
        assert_eq!(w.seq_no, 5);

        let l = loser.submit(&ctx, entry_at("beef0", 101, 2_000)).await.unwrap();
        assert_eq!(l.seq_no, 6);
        assert_eq!(loser.stats().conflicts, 1);

        let pack = read_pack(store.as_ref(), &prefix, 6).await;
        assert_eq!(pack.prev_digest, w.pack_digest);
    }

    #[tokio::test]
    async fn test_conflict_revalidates_ordering_against_new_head() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let prefix = Prefix::new("c0ffe").unwrap();
        let a = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
            .await
            .unwrap();
        let b = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
            .await
            .unwrap();
        let ctx = CallContext::background();
        a.submit(&ctx, entry_at("c0ffe", 1, 5_000)).await.unwrap();

        // b still believes the chain is empty; after re-probing, its entry is stale
        let err = b.submit(&ctx, entry_at("c0ffe", 2, 4_000)).await.unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { .. }));
        assert_eq!(b.next_seq_no(), 1);
    }

    /// Store whose commits always report a conflict without creating anything.
    struct AlwaysConflicting(ObjectStoreDriver);

    #[async_trait]
    impl ConditionalStore for AlwaysConflicting {
        async fn open_for_create(&self, name: &str) -> Result<Box<dyn crate::storage::ObjectWriter>> {
            Ok(Box::new(ConflictWriter(name.to_string())))
        }
        async fn exists(&self, name: &str) -> Result<bool> {
            self.0.exists(name).await
        }
        async fn read(&self, name: &str) -> Result<bytes::Bytes> {
            self.0.read(name).await
        }
        async fn list_after(&self, p: &str, s: Option<&str>, l: usize) -> Result<Vec<String>> {
            self.0.list_after(p, s, l).await
        }
        fn describe(&self) -> String {
            "conflicting".into()
        }
    }

    struct ConflictWriter(String);

    #[async_trait]
    impl crate::storage::ObjectWriter for ConflictWriter {
        async fn write_checksummed(&mut self, _bytes: &[u8], _crc: u32) -> Result<()> {
            Ok(())
        }
        fn checksum(&self) -> u32 {
            0
        }
        fn len(&self) -> u64 {
            0
        }
        async fn commit_if_absent(self: Box<Self>) -> Result<CommitReceipt> {
            Err(crate::error::StoreError::AlreadyExists(self.0).into())
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_batch() {
        let store: Arc<dyn ConditionalStore> =
            Arc::new(AlwaysConflicting(ObjectStoreDriver::in_memory()));
        let p = PrefixPacker::initialize(
            Prefix::new("00000").unwrap(),
            store,
            config().with_max_commit_attempts(3),
            None,
        )
        .await
        .unwrap();
        let err = p
            .submit(&CallContext::background(), entry_at("00000", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }), "{err}");
        assert_eq!(p.stats().conflicts, 3);
        assert_eq!(p.stats().failed_batches, 1);
    }

    struct RecordingSink(tokio::sync::mpsc::UnboundedSender<(Prefix, Digest)>);

    #[async_trait]
    impl RollupSink for RecordingSink {
        async fn roll_up(&self, parent: Prefix, pack_digest: Digest) -> Result<()> {
            let _ = self.0.send((parent, pack_digest));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollup_sends_digest_to_parent() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let p = PrefixPacker::initialize(
            Prefix::new("abcde").unwrap(),
            store,
            PackerConfig::default(),
            Some(Arc::new(RecordingSink(tx))),
        )
        .await
        .unwrap();
        let receipt = p
            .submit(&CallContext::background(), entry_at("abcde", 1, 1))
            .await
            .unwrap();
        let (parent, digest) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parent.as_str(), "abcd");
        assert_eq!(digest, receipt.pack_digest);
    }

    #[tokio::test]
    async fn test_closed_packer_rejects_submissions() {
        let store: Arc<dyn ConditionalStore> = Arc::new(ObjectStoreDriver::in_memory());
        let p = PrefixPacker::initialize(Prefix::new("aaaaa").unwrap(), store, config(), None)
            .await
            .unwrap();
        p.close().await;
        assert_eq!(p.state(), PackerState::Closed);
        let err = p
            .submit(&CallContext::background(), entry_at("aaaaa", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
