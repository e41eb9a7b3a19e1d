//! Open inodes: process-wide unique objects per upath.
//!
//! Files and directories share identity, lifecycle and sync hooks but
//! diverge in storage; the [`Inode`] variant carries that shared contract.
//! Parents are never held by pointer: they are looked up by upath through
//! the registry, so the in-memory structure stays a tree plus a map.
mod dir;
mod file;

pub use dir::DirInode;
pub use file::{FileInode, FilePaths};

use std::sync::Arc;

use crate::error::Error;
use crate::info::NodeKind;
use crate::registry::CacheRegistry;
use crate::remote::RemoteIo;

/// POSIX-facing attributes of a cached node.
#[derive(Clone, Debug)]
pub struct Attr {
    pub kind: NodeKind,
    pub size: Option<u64>,
    pub ro_uri: Option<String>,
    pub rw_uri: Option<String>,
    pub ctime: Option<f64>,
    pub mtime: Option<f64>,
}

impl Default for Attr {
    fn default() -> Self {
        Self {
            kind: NodeKind::File,
            size: None,
            ro_uri: None,
            rw_uri: None,
            ctime: None,
            mtime: None,
        }
    }
}

/// An open inode of either kind.
#[derive(Clone)]
pub enum Inode {
    File(Arc<FileInode>),
    Dir(Arc<DirInode>),
}

impl Inode {
    pub fn kind(&self) -> NodeKind {
        match self {
            Inode::File(_) => NodeKind::File,
            Inode::Dir(_) => NodeKind::Dir,
        }
    }

    pub fn upath(&self) -> Option<String> {
        match self {
            Inode::File(f) => f.upath(),
            Inode::Dir(d) => d.upath(),
        }
    }

    pub fn incref(&self) -> usize {
        match self {
            Inode::File(f) => f.incref(),
            Inode::Dir(d) => d.incref(),
        }
    }

    pub fn decref(&self) -> usize {
        match self {
            Inode::File(f) => f.decref(),
            Inode::Dir(d) => d.decref(),
        }
    }

    pub fn refcnt(&self) -> usize {
        match self {
            Inode::File(f) => f.refcnt(),
            Inode::Dir(d) => d.refcnt(),
        }
    }

    pub fn set_invalidated(&self) {
        match self {
            Inode::File(f) => f.set_invalidated(),
            Inode::Dir(d) => d.set_invalidated(),
        }
    }

    pub async fn is_fresh(&self, lifetime: f64) -> bool {
        match self {
            Inode::File(f) => f.is_fresh(lifetime).await,
            Inode::Dir(d) => d.is_fresh(lifetime).await,
        }
    }

    pub fn as_file(&self) -> Result<&Arc<FileInode>, Error> {
        match self {
            Inode::File(f) => Ok(f),
            Inode::Dir(_) => Err(Error::IsDirectory),
        }
    }

    pub fn as_dir(&self) -> Result<&Arc<DirInode>, Error> {
        match self {
            Inode::Dir(d) => Ok(d),
            Inode::File(_) => Err(Error::NotDirectory),
        }
    }

    pub async fn get_attr(&self) -> Attr {
        match self {
            Inode::File(f) => Attr {
                kind: NodeKind::File,
                size: Some(f.size().await),
                ..Default::default()
            },
            Inode::Dir(d) => d.get_attr().await,
        }
    }

    /// Capture a serializable snapshot of the inode's state for the sync
    /// worker.
    pub async fn freeze(&self) -> serde_json::Value {
        match self {
            Inode::File(f) => f.freeze().await,
            Inode::Dir(d) => d.freeze().await,
        }
    }

    pub async fn before_push_upstream(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Push local dirty state to the remote. Files upload their cached
    /// content; directory children are pushed by their own operations, so a
    /// directory push is metadata-only and already persisted.
    pub async fn push_upstream(
        &self,
        registry: &CacheRegistry,
        remote: &dyn RemoteIo,
    ) -> Result<(), Error> {
        match self {
            Inode::File(f) => registry.upload_file(f, remote).await,
            Inode::Dir(_) => Ok(()),
        }
    }

    pub async fn after_push_upstream(&self) -> Result<(), Error> {
        Ok(())
    }

    pub async fn before_pull_downstream(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Refresh the local cache from the remote, updating `retrieved`.
    pub async fn pull_downstream(&self, remote: &dyn RemoteIo) -> Result<(), Error> {
        match self {
            Inode::File(f) => f.pull_downstream(remote).await,
            Inode::Dir(d) => d.pull_downstream(remote).await,
        }
    }

    pub async fn after_pull_downstream(&self) -> Result<(), Error> {
        Ok(())
    }
}
