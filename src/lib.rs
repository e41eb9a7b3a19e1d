#![doc = include_str!("../README.md")]

pub mod blocks;
pub mod delta;
pub mod error;
pub mod framed;
pub mod fsops;
pub mod handle;
pub mod info;
pub mod inode;
mod keys;
pub mod registry;
pub mod remote;
pub mod sync;
pub mod upath;
#[doc(hidden)]
pub mod utils;

pub use error::Error;
pub use fsops::TruckeeFs;
pub use registry::CacheRegistry;

use std::path::PathBuf;

use clap::Parser;

/// Runtime options.
#[derive(Parser, Debug, Clone)]
pub struct Options {
    /// Base URL of the remote gateway node.
    #[clap(long, default_value = "http://127.0.0.1:3456")]
    pub node_url: String,
    /// Root capability of the remote directory tree.
    #[clap(long, env = "TRUCKEEFS_ROOTCAP", hide_env_values = true)]
    pub rootcap: String,
    /// Directory for cache files.
    #[clap(long, default_value = ".truckeefs-cache")]
    pub cache_dir: PathBuf,
    /// Target ceiling for the cache (bytes, with k/m/g/t or IEC suffixes).
    /// 0 disables eviction.
    #[clap(long, default_value = "1g", value_parser = utils::parse_size)]
    pub cache_size: u64,
    /// Cache lifetime for read operations (seconds).
    #[clap(long, alias = "cache-ttl", default_value = "10", value_parser = utils::parse_lifetime)]
    pub read_lifetime: u64,
    /// Cache lifetime for write-path lookups (seconds).
    #[clap(long, default_value = "10", value_parser = utils::parse_lifetime)]
    pub write_lifetime: u64,
    /// Network timeout for GET requests (seconds).
    #[clap(long, default_value_t = 30.0)]
    pub net_timeout: f64,
    /// Also persist file data and block state across close.
    #[clap(long)]
    pub cache_data: bool,
    /// Connection budget, split between GET and PUT pools.
    #[clap(long, default_value_t = 10)]
    pub max_connections: usize,
    /// Durable inode table location; defaults to `delta.db` in the cache
    /// directory.
    #[clap(long)]
    pub db_path: Option<PathBuf>,
    /// Ephemeral state store; in-process when not given.
    #[clap(long)]
    pub redis_url: Option<String>,
    /// TTL for ephemeral locks (seconds). Abandoned locks expire after
    /// this, e.g. when a sync owner crashed.
    #[clap(long, default_value_t = 1800)]
    pub redis_semaphore_timeout: u64,
}

impl Options {
    /// Defaults for programmatic construction (tests, embedding).
    pub fn for_cache_dir(cache_dir: PathBuf, rootcap: &str) -> Self {
        Self {
            node_url: "http://127.0.0.1:3456".into(),
            rootcap: rootcap.into(),
            cache_dir,
            cache_size: 0,
            read_lifetime: 10,
            write_lifetime: 10,
            net_timeout: 30.0,
            cache_data: false,
            max_connections: 10,
            db_path: None,
            redis_url: None,
            redis_semaphore_timeout: 1800,
        }
    }
}
