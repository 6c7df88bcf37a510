//! Client side of peer forwarding.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::cluster::{MemberInfo, PeerFactory};
use crate::config::ForwardingConfig;
use crate::context::CallContext;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, PeerMessage};
use crate::packer::PackReceipt;
use crate::types::{Entry, Prefix};

/// Connection to the member owning a prefix.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Submit `entry` to `prefix` on the peer and wait for its receipt.
    async fn submit(&self, ctx: &CallContext, prefix: &Prefix, entry: Entry)
        -> Result<PackReceipt>;

    async fn ping(&self, ctx: &CallContext) -> Result<()>;

    fn addr(&self) -> SocketAddr;
}

/// [`PeerClient`] opening one TCP connection per request.
///
/// A submission waits for the owner's next flush, so requests are long-lived
/// and independent; a connection each keeps them from queueing behind one
/// another.
#[derive(Debug)]
pub struct TcpPeerClient {
    addr: SocketAddr,
    config: ForwardingConfig,
    next_request_id: AtomicU64,
}

impl TcpPeerClient {
    pub fn new(addr: SocketAddr, config: ForwardingConfig) -> Self {
        Self {
            addr,
            config,
            next_request_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Per-request budget: the caller's deadline capped by the configured
    /// request timeout.
    fn budget(&self, ctx: &CallContext) -> Duration {
        ctx.remaining()
            .map_or(self.config.request_timeout, |r| r.min(self.config.request_timeout))
    }

    async fn exchange(&self, msg: &PeerMessage) -> Result<PeerMessage> {
        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: self.addr.to_string(),
                reason: "connection timeout".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: self.addr.to_string(),
                reason: e.to_string(),
            })?;
        write_frame(&mut stream, msg, self.config.max_frame_size).await?;
        read_frame(&mut stream, self.config.max_frame_size)
            .await?
            .ok_or_else(|| NetworkError::ConnectionClosed.into())
    }

    async fn request(&self, ctx: &CallContext, msg: PeerMessage) -> Result<PeerMessage> {
        let budget = self.budget(ctx);
        let response = ctx
            .run(tokio::time::timeout(budget, self.exchange(&msg)))
            .await?
            .map_err(|_| NetworkError::Timeout(self.addr.to_string()))??;
        if response.request_id() != msg.request_id() {
            return Err(NetworkError::Protocol(format!(
                "response {} for request {}",
                response.request_id(),
                msg.request_id()
            ))
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn submit(
        &self,
        ctx: &CallContext,
        prefix: &Prefix,
        entry: Entry,
    ) -> Result<PackReceipt> {
        let msg = PeerMessage::Submit {
            request_id: self.next_id(),
            prefix: prefix.clone(),
            entry,
            timeout_ms: Some(self.budget(ctx).as_millis() as u64),
        };
        debug!(peer = %self.addr, prefix = %prefix, "forwarding submission");
        match self.request(ctx, msg).await? {
            PeerMessage::SubmitResult { result, .. } => result.map_err(Error::from),
            other => Err(NetworkError::Protocol(format!("expected submit result, got {other:?}")).into()),
        }
    }

    async fn ping(&self, ctx: &CallContext) -> Result<()> {
        match self.request(ctx, PeerMessage::Ping { request_id: self.next_id() }).await? {
            PeerMessage::Pong { .. } => Ok(()),
            other => Err(NetworkError::Protocol(format!("expected pong, got {other:?}")).into()),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Builds [`TcpPeerClient`]s for ring members.
#[derive(Debug, Clone, Default)]
pub struct TcpPeerFactory {
    config: ForwardingConfig,
}

impl TcpPeerFactory {
    pub fn new(config: ForwardingConfig) -> Self {
        Self { config }
    }
}

impl PeerFactory for TcpPeerFactory {
    fn create(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(TcpPeerClient::new(member.addr, self.config.clone())))
    }
}
