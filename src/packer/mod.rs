//! Per-prefix hash-chained packs and the router that owns them.

pub mod format;
pub mod prefix_packer;
pub mod router;

pub use format::{decode_pack, encode_pack, EncodedEntry, Pack, StoredPack};
pub use prefix_packer::{PackReceipt, PackerState, PackerStats, PrefixPacker, RollupSink};
pub use router::{PackRouter, Route};
