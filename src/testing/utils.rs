use async_trait::async_trait;
use bytes::Bytes;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::{NodeConfig, PackerConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::notary::{KeyedHashSigner, Notary, SystemClock};
use crate::storage::{ConditionalStore, ObjectWriter};
use crate::types::{Digest, Entry, Timestamp};

/// A port free for both UDP and TCP, as memberlist binds both.
pub(crate) async fn allocate_gossip_port() -> u16 {
    loop {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = udp.local_addr().unwrap().port();
        drop(udp);
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            drop(listener);
            return port;
        }
    }
}

pub(crate) fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Node config on an ephemeral serving port sharing the store at `store_dir`.
pub(crate) fn node_config(name: &str, store_dir: &std::path::Path) -> NodeConfig {
    NodeConfig::new(name, localhost(0))
        .with_store(StoreConfig::new(store_dir.to_string_lossy()))
        .with_packer_config(PackerConfig::default().with_rollup(false))
}

pub(crate) fn test_notary() -> Arc<Notary> {
    Arc::new(Notary::new(
        Arc::new(SystemClock::new(Duration::from_millis(1))),
        Arc::new(KeyedHashSigner::new(b"integration".to_vec())),
    ))
}

/// Entry whose digest starts with `hex_prefix`; `n` keeps digests distinct.
pub(crate) fn entry_with_prefix(hex_prefix: &str, n: u64, ts: u64) -> Entry {
    let mut raw = [0u8; 64];
    let head = hex::decode(format!("{hex_prefix:0<16}")).unwrap();
    raw[..8].copy_from_slice(&head);
    raw[56..].copy_from_slice(&n.to_be_bytes());
    Entry::new(Digest::new(raw), n.to_le_bytes().to_vec(), Timestamp::from_nanos(ts))
}

/// Poll `check` until it holds or `timeout` passes.
pub(crate) async fn wait_until<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Store whose `open_for_create` can be held closed to keep a flush in flight.
pub(crate) struct GatedStore {
    inner: Arc<dyn ConditionalStore>,
    gate: Semaphore,
    opens: AtomicUsize,
}

impl GatedStore {
    pub(crate) fn new(inner: Arc<dyn ConditionalStore>) -> Self {
        Self {
            inner,
            gate: Semaphore::new(1),
            opens: AtomicUsize::new(0),
        }
    }

    /// Block subsequent writers until [`release`](Self::release).
    pub(crate) fn hold(&self) {
        if let Ok(permit) = self.gate.try_acquire() {
            permit.forget();
        }
    }

    pub(crate) fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Writers that have asked for a handle, held or not.
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConditionalStore for GatedStore {
    async fn open_for_create(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.map_err(|_| Error::Closed)?;
        self.inner.open_for_create(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name).await
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        self.inner.read(name).await
    }

    async fn list_after(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.inner.list_after(prefix, start_after, limit).await
    }

    fn describe(&self) -> String {
        format!("gated({})", self.inner.describe())
    }
}
