//! Peer forwarding: members hand submissions for prefixes they do not own
//! to the owner over TCP.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{PeerClient, TcpPeerClient, TcpPeerFactory};
pub use rpc::{PeerMessage, RemoteError};
pub use server::{PackServer, SubmitHandler};
