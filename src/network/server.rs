//! TCP server answering forwarded submissions.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::CallContext;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, PeerMessage, RemoteError};
use crate::packer::PackReceipt;
use crate::types::{Entry, Prefix};

/// Local side of a forwarded submission.
///
/// Implementations must not forward again: a stale ring on the sender could
/// otherwise bounce a request between members.
#[async_trait]
pub trait SubmitHandler: Send + Sync + 'static {
    async fn submit_local(
        &self,
        ctx: &CallContext,
        prefix: Prefix,
        entry: Entry,
    ) -> Result<PackReceipt>;

    fn node_name(&self) -> String;

    /// Longest prefix this node packs; longer forwarded prefixes are refused
    /// before they reach [`submit_local`](Self::submit_local).
    fn max_prefix_len(&self) -> usize;
}

/// TCP server for forwarded submissions.
///
/// Binding and serving are separate steps so the bound port can be
/// advertised before the handler exists.
pub struct PackServer {
    listener: TcpListener,
    max_frame: usize,
}

impl std::fmt::Debug for PackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

impl PackServer {
    /// Bind `addr`; port 0 picks a free port, see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr, max_frame: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(NetworkError::from)?;
        Ok(Self {
            listener,
            max_frame,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::from)?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(
        self,
        handler: Arc<dyn SubmitHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "pack server listening");
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "accepted connection");
                        let handler = handler.clone();
                        let max_frame = self.max_frame;
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let served = tokio::select! {
                                r = Self::handle_connection(stream, handler, max_frame) => r,
                                _ = shutdown.cancelled() => Ok(()),
                            };
                            if let Err(e) = served {
                                debug!(peer = %peer_addr, error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
                _ = shutdown.cancelled() => {
                    info!("pack server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn SubmitHandler>,
        max_frame: usize,
    ) -> Result<()> {
        while let Some(msg) = read_frame(&mut stream, max_frame).await? {
            let response = Self::dispatch(handler.as_ref(), msg).await;
            if let Some(response) = response {
                write_frame(&mut stream, &response, max_frame).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(handler: &dyn SubmitHandler, msg: PeerMessage) -> Option<PeerMessage> {
        match msg {
            PeerMessage::Submit {
                request_id,
                prefix,
                entry,
                timeout_ms,
            } => {
                if prefix.len() > handler.max_prefix_len() {
                    debug!(request_id, prefix = %prefix, "refusing oversized prefix");
                    let err = Error::InvalidEntry(format!(
                        "prefix {prefix:?} is longer than {} nibbles",
                        handler.max_prefix_len()
                    ));
                    return Some(PeerMessage::SubmitResult {
                        request_id,
                        result: Err(RemoteError::from(&err)),
                    });
                }
                let ctx = match timeout_ms {
                    Some(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
                    None => CallContext::background(),
                };
                let result = handler
                    .submit_local(&ctx, prefix, entry)
                    .await
                    .map_err(|e| RemoteError::from(&e));
                Some(PeerMessage::SubmitResult { request_id, result })
            }
            PeerMessage::Ping { request_id } => Some(PeerMessage::Pong {
                request_id,
                node_name: handler.node_name(),
            }),
            other => {
                debug!(request_id = other.request_id(), "ignoring unexpected message");
                None
            }
        }
    }
}
