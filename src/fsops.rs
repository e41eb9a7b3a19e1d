//! The POSIX-facing operation surface.
//!
//! Thin stateless adapters composing the registry, the remote client and
//! the coordination layer. Host-side shims (FUSE or otherwise) call these
//! and map [`Error::errno`] onto their return convention.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::*;

use crate::delta::{Delta, InodeDb, MemoryStore, Process, ProcessState, RedisStore};
use crate::error::Error;
use crate::handle::FileHandle;
use crate::info::NodeKind;
use crate::registry::CacheRegistry;
use crate::remote::{Gateway, RemoteIo};
use crate::sync::{schedule_upstream_sync, SyncContext, WorkerSpawn};
use crate::upath::{normalize, ubasename, udirname};
use crate::utils::unix_timestamp;
use crate::Options;

/// Creating this name with `O_CREAT` invalidates the directory's cache
/// entry instead of creating a file.
pub const INVALIDATE_SENTINEL: &str = ".truckeefs-invalidate";

/// Attributes in the shape a POSIX `stat` wants them.
#[derive(Clone, Debug)]
pub struct FileAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub ctime: f64,
    pub mtime: f64,
}

pub struct TruckeeFs {
    pub registry: Arc<CacheRegistry>,
    pub remote: Arc<dyn RemoteIo>,
    pub delta: Arc<Delta>,
    /// When set, dirty files are handed to an out-of-band sync worker on
    /// release; otherwise they are uploaded in-band.
    sync_spawn: Option<WorkerSpawn>,
}

impl TruckeeFs {
    pub async fn new(options: &Options) -> Result<Self, Error> {
        let remote = Arc::new(Gateway::new(
            &options.node_url,
            &options.rootcap,
            Duration::from_secs_f64(options.net_timeout),
            options.max_connections,
        )?);
        Self::with_remote(options, remote).await
    }

    /// Construction against any remote implementation.
    pub async fn with_remote(
        options: &Options,
        remote: Arc<dyn RemoteIo>,
    ) -> Result<Self, Error> {
        let registry = Arc::new(
            CacheRegistry::new(
                options.cache_dir.clone(),
                options.rootcap.trim(),
                options.cache_size,
                options.cache_data,
                options.read_lifetime as f64,
                options.write_lifetime as f64,
            )
            .await?,
        );
        let db_path = options
            .db_path
            .clone()
            .unwrap_or_else(|| options.cache_dir.join("delta.db"));
        let db = Arc::new(InodeDb::open(&db_path)?);
        let ttl = Duration::from_secs(options.redis_semaphore_timeout);
        let store: Arc<dyn crate::delta::EphemeralStore> = match &options.redis_url {
            Some(url) => Arc::new(RedisStore::new(url, ttl)?),
            None => Arc::new(MemoryStore::new(ttl)),
        };
        Ok(Self {
            registry,
            remote,
            delta: Arc::new(Delta::new(db, store)),
            sync_spawn: None,
        })
    }

    /// Route dirty releases through a spawned `truckeefs-sync` process.
    pub fn with_sync_worker(mut self, spawn: WorkerSpawn) -> Self {
        self.sync_spawn = Some(spawn);
        self
    }

    fn sync_context(&self) -> SyncContext {
        SyncContext {
            registry: self.registry.clone(),
            remote: self.remote.clone(),
            delta: self.delta.clone(),
        }
    }

    // -- File handle ops

    pub async fn open(&self, path: &str, flags: i32) -> Result<Arc<FileHandle>, Error> {
        let upath = normalize(path);
        if ubasename(&upath) == INVALIDATE_SENTINEL && flags & libc::O_CREAT != 0 {
            info!(%upath, "Invalidation sentinel touched");
            self.registry.invalidate(udirname(&upath), false).await?;
            return Err(Error::Denied);
        }
        self.registry
            .open_file(&upath, self.remote.as_ref(), flags, None)
            .await
    }

    /// `create` has no mode support on the remote, so the mode is dropped.
    pub async fn create(&self, path: &str, flags: i32, _mode: u32) -> Result<Arc<FileHandle>, Error> {
        self.open(path, flags | libc::O_CREAT).await
    }

    pub async fn read(
        &self,
        handle: &Arc<FileHandle>,
        offset: u64,
        size: u64,
    ) -> Result<Bytes, Error> {
        handle.read(self.remote.as_ref(), offset, size).await
    }

    pub async fn write(
        &self,
        handle: &Arc<FileHandle>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, Error> {
        self.remote.wait_until_write_allowed().await;
        handle.write(self.remote.as_ref(), offset, data).await
    }

    pub async fn ftruncate(&self, handle: &Arc<FileHandle>, size: u64) -> Result<(), Error> {
        handle.truncate(size).await
    }

    /// Sync a dirty file and drop the handle. The sync outcome is reported
    /// even though the handle is closed regardless.
    pub async fn release(&self, handle: &Arc<FileHandle>) -> Result<(), Error> {
        let synced = self.sync_dirty(handle).await;
        if let Err(e) = &synced {
            warn!(upath = %handle.upath, "Failed to sync on release: {}", e);
        }
        let closed = self.registry.close_file(handle).await;
        synced.and(closed)
    }

    async fn sync_dirty(&self, handle: &Arc<FileHandle>) -> Result<(), Error> {
        let inode = handle.inode();
        let Some(upath) = inode.upath() else {
            return Ok(());
        };
        if !inode.dirty().await {
            return Ok(());
        }

        let Some(spawn) = &self.sync_spawn else {
            return self.registry.upload_file(inode, self.remote.as_ref()).await;
        };

        // Resolve the durable identity and hand off to a worker process
        let resolution = self
            .delta
            .resolve(self.registry.as_ref(), self.remote.clone(), &upath)
            .await;
        let id = match resolution {
            Ok(r) => match r.id {
                Some(id) => id,
                // Registry hit: the row may not exist yet (a file created
                // and never uploaded is unknown to the remote authority)
                None => self.delta.db.create_path(&upath, "filenode")?,
            },
            Err(Error::NotFound) => self.delta.db.create_path(&upath, "filenode")?,
            Err(e) => return Err(e),
        };
        if !self.delta.states_initialized(id).await {
            self.delta.init_states(id).await;
            self.delta.init_ephemerals(id).await;
        }
        self.delta
            .set_state(id, Process::Sync, ProcessState::Pending, None)
            .await;
        let frozen = inode.freeze().await;
        schedule_upstream_sync(&self.sync_context(), spawn, id, frozen).await
    }

    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), Error> {
        let upath = normalize(path);
        let handle = self
            .registry
            .open_file(&upath, self.remote.as_ref(), libc::O_RDWR, None)
            .await?;
        let result = handle.truncate(size).await;
        let released = self.release(&handle).await;
        result.and(released)
    }

    // -- Handleless ops

    pub async fn getattr(&self, path: &str) -> Result<FileAttr, Error> {
        let upath = normalize(path);
        let attr = self.registry.get_attr(&upath, self.remote.as_ref()).await?;
        Ok(match attr.kind {
            NodeKind::Dir => FileAttr {
                kind: NodeKind::Dir,
                size: 0,
                mode: libc::S_IFDIR | 0o500,
                nlink: 1,
                ctime: attr.ctime.unwrap_or(0.0),
                mtime: attr.mtime.unwrap_or(0.0),
            },
            NodeKind::File => FileAttr {
                kind: NodeKind::File,
                size: attr.size.unwrap_or(0),
                mode: libc::S_IFREG | 0o600,
                nlink: 1,
                ctime: attr.ctime.unwrap_or_else(unix_timestamp),
                mtime: attr.mtime.unwrap_or_else(unix_timestamp),
            },
        })
    }

    /// Child names only; the shim adds `.` and `..` itself.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>, Error> {
        let upath = normalize(path);
        let dir = self.registry.open_dir(&upath, self.remote.as_ref(), None).await?;
        let entries = dir.listdir().await;
        self.registry.close_dir(&dir).await?;
        entries
    }

    pub async fn unlink(&self, path: &str) -> Result<(), Error> {
        let upath = normalize(path);
        self.registry
            .unlink(&upath, self.remote.as_ref(), false)
            .await
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), Error> {
        let upath = normalize(path);
        self.registry.unlink(&upath, self.remote.as_ref(), true).await
    }

    /// `mode` is dropped; not supported on the remote.
    pub async fn mkdir(&self, path: &str, _mode: u32) -> Result<(), Error> {
        let upath = normalize(path);
        self.registry.mkdir(&upath, self.remote.as_ref()).await
    }
}
