//! Sparse block-level cache storage.
//!
//! [`range`] is the pure block arithmetic; [`storage`] stores fixed-size
//! blocks in recycled physical slots; [`cache`] composes storage into a
//! virtual file that knows what still needs to be fetched from the remote.
pub mod cache;
pub mod range;
pub mod storage;

pub use cache::BlockCachedFile;
pub use range::{block_range, ceil_div, BlockRange};
pub use storage::BlockStorage;

/// Default cache block size in bytes.
pub const BLOCK_SIZE: u64 = 131072;
