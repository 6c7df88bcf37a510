//! Latency-minimizing batching.

mod adaptive;

pub use adaptive::{AdaptiveBatcher, BatchHandler, BatcherStats};
