//! Logical file and directory handles.
//!
//! There may be multiple open handles for the same inode; each handle
//! serializes its own operations and checks its open flags, while the inode
//! coordinates across handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::inode::{Attr, DirInode, FileInode};
use crate::remote::RemoteIo;

pub struct FileHandle {
    pub upath: String,
    inode: Arc<FileInode>,
    writeable: bool,
    readable: bool,
    append: bool,
    closed: AtomicBool,
    lock: Mutex<()>,
}

impl FileHandle {
    pub(crate) async fn new(
        upath: String,
        inode: Arc<FileInode>,
        flags: i32,
    ) -> Result<Self, Error> {
        let acc = flags & libc::O_ACCMODE;
        let writeable = acc == libc::O_RDWR || acc == libc::O_WRONLY;
        let readable = acc == libc::O_RDWR || acc == libc::O_RDONLY;

        for (flag, name) in [
            (libc::O_ASYNC, "O_ASYNC"),
            (libc::O_DIRECT, "O_DIRECT"),
            (libc::O_DIRECTORY, "O_DIRECTORY"),
            (libc::O_SYNC, "O_SYNC"),
        ] {
            if flags & flag != 0 {
                return Err(Error::Unsupported(name));
            }
        }
        if !writeable {
            for (flag, name) in [
                (libc::O_CREAT, "O_CREAT without writeable file"),
                (libc::O_TRUNC, "O_TRUNC without writeable file"),
                (libc::O_EXCL, "O_EXCL without writeable file"),
                (libc::O_APPEND, "O_APPEND without writeable file"),
            ] {
                if flags & flag != 0 {
                    return Err(Error::Invalid(name));
                }
            }
        }

        inode.incref();
        if flags & libc::O_TRUNC != 0 {
            if let Err(e) = inode.truncate(0).await {
                inode.decref();
                return Err(e);
            }
        }

        Ok(Self {
            upath,
            inode,
            writeable,
            readable,
            append: flags & libc::O_APPEND != 0,
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
        })
    }

    pub fn inode(&self) -> &Arc<FileInode> {
        &self.inode
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BadHandle);
        }
        Ok(())
    }

    /// Mark the handle closed and drop its reference; returns the remaining
    /// reference count.
    pub(crate) fn close(&self) -> Result<usize, Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::BadHandle);
        }
        Ok(self.inode.decref())
    }

    pub async fn get_size(&self) -> Result<u64, Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        Ok(self.inode.size().await)
    }

    pub async fn read(
        &self,
        remote: &dyn RemoteIo,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        if !self.readable {
            return Err(Error::NotReadable);
        }
        self.inode.read(remote, offset, length).await
    }

    pub async fn write(
        &self,
        remote: &dyn RemoteIo,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        if !self.writeable {
            return Err(Error::NotWriteable);
        }
        let offset = (!self.append).then_some(offset);
        self.inode.write(remote, offset, data).await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, size: u64) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        if !self.writeable {
            return Err(Error::NotWriteable);
        }
        self.inode.truncate(size).await
    }
}

pub struct DirHandle {
    pub upath: String,
    inode: Arc<DirInode>,
    closed: AtomicBool,
    lock: Mutex<()>,
}

impl DirHandle {
    pub(crate) fn new(upath: String, inode: Arc<DirInode>) -> Self {
        inode.incref();
        Self {
            upath,
            inode,
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    pub fn inode(&self) -> &Arc<DirInode> {
        &self.inode
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BadHandle);
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<usize, Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::BadHandle);
        }
        Ok(self.inode.decref())
    }

    pub async fn listdir(&self) -> Result<Vec<String>, Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        Ok(self.inode.listdir().await)
    }

    pub async fn get_attr(&self) -> Result<Attr, Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        Ok(self.inode.get_attr().await)
    }

    pub async fn get_child_attr(&self, childname: &str) -> Result<Attr, Error> {
        let _guard = self.lock.lock().await;
        self.check_open()?;
        self.inode.get_child_attr(childname).await
    }
}
