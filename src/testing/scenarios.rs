//! One prefix chain, end to end.

use std::sync::Arc;
use std::time::Duration;

use super::utils::{entry_with_prefix, wait_until, GatedStore};
use crate::config::PackerConfig;
use crate::context::CallContext;
use crate::error::{Error, ErrorKind};
use crate::packer::{decode_pack, PackRouter, PrefixPacker, StoredPack};
use crate::storage::{ConditionalStore, FsStore, ObjectStoreDriver};
use crate::types::{pack_object_name, Digest, Prefix, Timestamp};

fn config() -> PackerConfig {
    PackerConfig::default().with_rollup(false)
}

async fn stored(store: &dyn ConditionalStore, prefix: &Prefix, seq: u64) -> StoredPack {
    let name = pack_object_name(prefix, seq);
    decode_pack(&name, &store.read(&name).await.unwrap()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_sequential_submissions_form_a_chain() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ConditionalStore> = Arc::new(FsStore::new(dir.path()).unwrap());
    let router = PackRouter::new(store.clone(), config(), None, None);
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    let mut receipts = Vec::new();
    for (n, ts) in [(1, 1_000), (2, 2_000), (3, 3_000)] {
        receipts.push(router.submit(&ctx, entry_with_prefix("abcde", n, ts)).await.unwrap());
    }

    let prefix = Prefix::new("abcde").unwrap();
    let mut prev = Digest::ZERO;
    for (seq, receipt) in receipts.iter().enumerate() {
        assert_eq!(receipt.prefix, prefix);
        assert_eq!(receipt.seq_no, seq as u64);
        assert_eq!(receipt.index, 0);

        let pack = stored(store.as_ref(), &prefix, seq as u64).await;
        assert_eq!(pack.pack.prev_digest, prev);
        assert_eq!(pack.digest, receipt.pack_digest);
        prev = pack.digest;
    }
    router.close().await;

    // a restarted router picks the chain up where it ended
    let router = PackRouter::new(store.clone(), config(), None, None);
    let packer = router.local_packer(&prefix).await.unwrap();
    assert_eq!(packer.next_seq_no(), 3);
    assert_eq!(packer.last_digest(), prev);
    assert_eq!(packer.last_timestamp(), Timestamp::from_nanos(3_000));
    router.close().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_racing_packers_after_restart() {
    let gated = Arc::new(GatedStore::new(Arc::new(ObjectStoreDriver::in_memory())));
    let store: Arc<dyn ConditionalStore> = gated.clone();
    let prefix = Prefix::new("beef0").unwrap();
    let ctx = CallContext::with_timeout(Duration::from_secs(10));

    let first = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
        .await
        .unwrap();
    for n in 0..5 {
        first
            .submit(&ctx, entry_with_prefix("beef0", n, 100 + n))
            .await
            .unwrap();
    }
    first.close().await;
    let opened = gated.opens();

    // two instances that both believe they own the prefix
    let a = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
        .await
        .unwrap();
    let b = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
        .await
        .unwrap();
    assert_eq!((a.next_seq_no(), b.next_seq_no()), (5, 5));

    gated.hold();
    let ta = {
        let (a, ctx) = (a.clone(), ctx.clone());
        tokio::spawn(async move { a.submit(&ctx, entry_with_prefix("beef0", 10, 1_000)).await })
    };
    let tb = {
        let (b, ctx) = (b.clone(), ctx.clone());
        tokio::spawn(async move { b.submit(&ctx, entry_with_prefix("beef0", 11, 1_000)).await })
    };
    assert!(wait_until(|| gated.opens() == opened + 2, Duration::from_secs(5)).await);
    gated.release();

    let ra = ta.await.unwrap().unwrap();
    let rb = tb.await.unwrap().unwrap();
    let mut seqs = [ra.seq_no, rb.seq_no];
    seqs.sort();
    assert_eq!(seqs, [5, 6]);
    assert_eq!(a.stats().conflicts + b.stats().conflicts, 1);

    let five = stored(store.as_ref(), &prefix, 5).await;
    let six = stored(store.as_ref(), &prefix, 6).await;
    assert_eq!(six.pack.prev_digest, five.digest);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_stale_entry_rejected_while_batch_siblings_commit() {
    let gated = Arc::new(GatedStore::new(Arc::new(ObjectStoreDriver::in_memory())));
    let store: Arc<dyn ConditionalStore> = gated.clone();
    let prefix = Prefix::new("12345").unwrap();
    let ctx = CallContext::with_timeout(Duration::from_secs(10));
    let packer = PrefixPacker::initialize(prefix.clone(), store.clone(), config(), None)
        .await
        .unwrap();

    packer
        .submit(&ctx, entry_with_prefix("12345", 1, 200))
        .await
        .unwrap();

    // stall the next flush so the following two entries share a batch
    gated.hold();
    let opened = gated.opens();
    let submit = |n: u64, ts: u64| {
        let (packer, ctx) = (packer.clone(), ctx.clone());
        tokio::spawn(async move { packer.submit(&ctx, entry_with_prefix("12345", n, ts)).await })
    };
    let stalled = submit(2, 210);
    assert!(wait_until(|| gated.opens() == opened + 1, Duration::from_secs(5)).await);
    let stale = submit(3, 150);
    let fresh = submit(4, 250);
    assert!(wait_until(|| packer.buffered() == 2, Duration::from_secs(5)).await);
    gated.release();

    assert_eq!(stalled.await.unwrap().unwrap().seq_no, 1);
    let err = stale.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OrderingViolation);
    assert!(matches!(
        err,
        Error::OrderingViolation { last, .. } if last == Timestamp::from_nanos(210)
    ));
    let fresh = fresh.await.unwrap().unwrap();
    assert_eq!(fresh.seq_no, 2);

    let pack = stored(store.as_ref(), &prefix, 2).await;
    assert_eq!(pack.pack.entries.len(), 1);
    assert_eq!(pack.pack.entries[0].timestamp, Timestamp::from_nanos(250));
    assert_eq!(packer.stats().rejected, 1);
}

#[test_log::test(tokio::test)]
async fn test_filesystem_underwrite_keeps_first_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path()).unwrap();

    let mut a = store.open_for_create("x").await.unwrap();
    let mut b = store.open_for_create("x").await.unwrap();
    a.write(b"writer a").await.unwrap();
    b.write(b"writer b").await.unwrap();

    b.commit_if_absent().await.unwrap();
    let err = a.commit_if_absent().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    assert_eq!(&store.read("x").await.unwrap()[..], b"writer b");
    assert_eq!(
        store.list_after("", None, 10).await.unwrap(),
        vec!["x".to_string()]
    );
}
