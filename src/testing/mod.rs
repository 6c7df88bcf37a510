//! End-to-end tests for packers, routing, and forwarding.
//!
//! # Layout
//!
//! ```text
//! scenarios      single-process behaviour of one prefix chain
//! cluster_tests  several PackNodes sharing one store directory,
//!                over in-process and gossip membership
//! utils          ports, entries, and a store that can stall writers
//! ```

mod scenarios;
mod utils;
