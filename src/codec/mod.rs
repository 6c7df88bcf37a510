//! Encodings shared by the storage and packing layers.
//!
//! - [`sortable`]: fixed-width, order-preserving text form of a `u64` counter
//! - [`crc32combine`]: CRC-32 concatenation without re-reading the data

pub mod crc32combine;
pub mod sortable;

pub use crc32combine::{combine, crc32c, Crc32cAccumulator, CASTAGNOLI, IEEE};
pub use sortable::{decode, decrement, encode, increment, ALPHABET, ENCODED_LEN};
