//! Cached file inodes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::*;

use crate::blocks::{BlockCachedFile, BLOCK_SIZE};
use crate::error::Error;
use crate::framed::{FramedFile, Mode, DEFAULT_BLOCK_SIZE};
use crate::info::{json_zlib_decode, json_zlib_encode, FileInfo, NodeInfo};
use crate::remote::{ContentStream, RemoteIo, UploadBody};
use crate::upath::ubasename;
use crate::utils::{touch, unix_timestamp};

/// The three on-disk artifacts backing a cached file.
pub struct FilePaths {
    pub info: PathBuf,
    pub state: PathBuf,
    pub data: PathBuf,
}

/// State protected by the cache lock: the block cache, the metadata record
/// and the dirty flag.
pub struct FileCache {
    pub info: FileInfo,
    pub dirty: bool,
    pub block_cache: BlockCachedFile,
    state_file: FramedFile,
}

struct StreamState {
    stream: Box<dyn ContentStream>,
    /// Remote offset the next committed byte corresponds to.
    offset: u64,
    /// Bytes received but not yet forming a whole block.
    pending: Vec<Bytes>,
}

enum RwOp<'a> {
    Read { length: u64 },
    Write { data: &'a [u8] },
    /// Fetch without producing a result (cache materialization).
    Buffer { length: u64 },
}

/// Logical file on disk. There is a single `FileInode` instance per open
/// upath, shared by all its handles.
///
/// Lock order: the cache lock is never held while acquiring the stream
/// lock; the fetch loop holds the stream lock and takes the cache lock only
/// for short commit sections.
pub struct FileInode {
    upath: std::sync::RwLock<Option<String>>,
    persistent: bool,
    invalidated: AtomicBool,
    closed: AtomicBool,
    refcnt: AtomicUsize,
    paths: FilePaths,
    /// `None` once the inode has been closed and its backing files
    /// released.
    cache: Arc<Mutex<Option<FileCache>>>,
    stream: Mutex<Option<StreamState>>,
}

impl FileInode {
    /// Open a cached file, reusing on-disk artifacts when they validate and
    /// falling back to a fresh fetch otherwise. A `filecap` of `None` means
    /// a new, not yet uploaded file.
    pub async fn open(
        upath: String,
        paths: FilePaths,
        filecap: Option<&str>,
        remote: &dyn RemoteIo,
        persistent: bool,
    ) -> Result<Self, Error> {
        let mut loaded = None;
        if filecap.is_some() {
            loaded = Self::try_reuse_info(&paths).await;
        }

        let cache = match loaded {
            Some(info) => {
                let mut restored = None;
                if persistent {
                    restored = Self::try_restore_data(&paths).await;
                }
                match restored {
                    Some((block_cache, state_file)) => FileCache {
                        info,
                        dirty: false,
                        block_cache,
                        state_file,
                    },
                    None => Self::fresh_data(&paths, info, false).await?,
                }
            }
            None => {
                let mut dirty = false;
                let mut info = match filecap {
                    Some(cap) => match remote.get_info(cap, true).await {
                        Ok(NodeInfo::File(fi)) => fi,
                        Ok(NodeInfo::Dir(_)) => return Err(Error::IsDirectory),
                        Err(e) => {
                            return Err(match e {
                                Error::NotFound => Error::NotFound,
                                e => Error::RemoteIo(format!(
                                    "failed to retrieve information: {}",
                                    e
                                )),
                            });
                        }
                    },
                    None => {
                        dirty = true;
                        FileInfo::default()
                    }
                };
                Self::persist_info(&paths.info, &mut info).await?;
                Self::fresh_data(&paths, info, dirty).await?
            }
        };

        for p in [&paths.info, &paths.state, &paths.data] {
            touch(p);
        }

        Ok(Self {
            upath: std::sync::RwLock::new(Some(upath)),
            persistent,
            invalidated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            refcnt: AtomicUsize::new(0),
            paths,
            cache: Arc::new(Mutex::new(Some(cache))),
            stream: Mutex::new(None),
        })
    }

    async fn try_reuse_info(paths: &FilePaths) -> Option<FileInfo> {
        let mut f = FramedFile::open(&paths.info, Mode::Read, DEFAULT_BLOCK_SIZE)
            .await
            .ok()?;
        let buf = f.read_all().await.ok()?;
        match json_zlib_decode::<NodeInfo>(&buf).ok()? {
            NodeInfo::File(info) => Some(info),
            NodeInfo::Dir(_) => None,
        }
    }

    async fn try_restore_data(paths: &FilePaths) -> Option<(BlockCachedFile, FramedFile)> {
        let mut state_file = FramedFile::open(&paths.state, Mode::ReadWrite, DEFAULT_BLOCK_SIZE)
            .await
            .ok()?;
        let data_file = FramedFile::open(&paths.data, Mode::ReadWrite, DEFAULT_BLOCK_SIZE)
            .await
            .ok()?;
        let block_cache = BlockCachedFile::restore_state(data_file, &mut state_file)
            .await
            .ok()?;
        Some((block_cache, state_file))
    }

    async fn fresh_data(
        paths: &FilePaths,
        info: FileInfo,
        dirty: bool,
    ) -> Result<FileCache, Error> {
        let data_file = FramedFile::open(&paths.data, Mode::Create, DEFAULT_BLOCK_SIZE).await?;
        let block_cache = BlockCachedFile::new(data_file, info.size, None);
        let state_file = FramedFile::open(&paths.state, Mode::Create, DEFAULT_BLOCK_SIZE).await?;
        Ok(FileCache {
            info,
            dirty,
            block_cache,
            state_file,
        })
    }

    /// Rewrite the metadata blob, stamping `retrieved` if it was never set.
    /// The blob is opened per write so invalidation scans are never locked
    /// out of it.
    async fn persist_info(path: &std::path::Path, info: &mut FileInfo) -> Result<(), Error> {
        if info.retrieved.is_none() {
            info.retrieved = Some(unix_timestamp());
        }
        let blob = json_zlib_encode(&NodeInfo::File(info.clone()))?;
        let mut f = FramedFile::open(path, Mode::Create, DEFAULT_BLOCK_SIZE).await?;
        f.write_at(0, &blob).await?;
        f.close().await?;
        Ok(())
    }

    pub fn upath(&self) -> Option<String> {
        self.upath
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn incref(&self) -> usize {
        self.refcnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decref(&self) -> usize {
        self.refcnt.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::SeqCst)
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn set_invalidated(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub async fn is_fresh(&self, lifetime: f64) -> bool {
        match self.cache.lock().await.as_ref() {
            // Closed inodes are never fresh
            None => false,
            Some(cache) => match cache.info.retrieved {
                // Not yet uploaded: nothing remote to go stale against
                None => true,
                Some(retrieved) => retrieved + lifetime >= unix_timestamp(),
            },
        }
    }

    pub async fn dirty(&self) -> bool {
        self.cache.lock().await.as_ref().map_or(false, |c| c.dirty)
    }

    pub async fn size(&self) -> u64 {
        self.cache
            .lock()
            .await
            .as_ref()
            .map_or(0, |c| c.block_cache.size())
    }

    pub async fn info(&self) -> FileInfo {
        self.cache
            .lock()
            .await
            .as_ref()
            .map(|c| c.info.clone())
            .unwrap_or_default()
    }

    pub async fn read(
        &self,
        remote: &dyn RemoteIo,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, Error> {
        self.do_rw(remote, offset, RwOp::Read { length }).await
    }

    /// Write at `offset`, or append when `offset` is `None`.
    pub async fn write(
        &self,
        remote: &dyn RemoteIo,
        offset: Option<u64>,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let offset = {
            let mut guard = self.cache.lock().await;
            let cache = guard.as_mut().ok_or(Error::BadHandle)?;
            cache.dirty = true;
            offset.unwrap_or_else(|| cache.block_cache.size())
        };
        self.do_rw(remote, offset, RwOp::Write { data }).await?;
        Ok(())
    }

    pub async fn truncate(&self, size: u64) -> Result<(), Error> {
        let mut guard = self.cache.lock().await;
        let cache = guard.as_mut().ok_or(Error::BadHandle)?;
        if size != cache.block_cache.size() {
            cache.dirty = true;
        }
        cache.block_cache.truncate(size).await?;
        Ok(())
    }

    /// The lazy-fetch loop: consult the block cache for the next missing
    /// range, fill it from a byte-range stream, repeat until the operation
    /// can run locally.
    async fn do_rw(
        &self,
        remote: &dyn RemoteIo,
        offset: u64,
        op: RwOp<'_>,
    ) -> Result<Bytes, Error> {
        let length = match &op {
            RwOp::Read { length } | RwOp::Buffer { length } => *length,
            RwOp::Write { data } => data.len() as u64,
        };
        let mut remote_eof = false;

        loop {
            let pos = {
                let mut guard = self.cache.lock().await;
                let cache = guard.as_mut().ok_or(Error::BadHandle)?;
                let pos = match &op {
                    RwOp::Write { .. } => cache.block_cache.pre_write(offset, length),
                    _ => cache.block_cache.pre_read(offset, length),
                };
                match pos {
                    Some(pos) if !remote_eof => pos,
                    // Cache ready (or the remote ended early: let the
                    // operation succeed short or fail on what is missing)
                    _ => {
                        return match op {
                            RwOp::Buffer { .. } => Ok(Bytes::new()),
                            RwOp::Write { data } => {
                                cache.block_cache.write(offset, data).await?;
                                Ok(Bytes::new())
                            }
                            RwOp::Read { length } => {
                                Ok(cache.block_cache.read(offset, length).await?)
                            }
                        };
                    }
                }
            };

            // Cache not ready: fill it up
            let mut stream = self.stream.lock().await;
            let fill = async {
                let (c_offset, c_length) = pos;

                // Reuse a stream that is at or just behind the wanted
                // offset; anything else is closed and reopened.
                let reusable = match stream.as_ref() {
                    Some(s) => s.offset <= c_offset && c_offset < s.offset + 3 * BLOCK_SIZE,
                    None => false,
                };
                if !reusable {
                    *stream = None;
                }
                if stream.is_none() {
                    let ro_uri = {
                        let guard = self.cache.lock().await;
                        let cache = guard.as_ref().ok_or(Error::BadHandle)?;
                        cache.info.ro_uri.clone()
                    }
                    .ok_or_else(|| Error::RemoteIo("no read capability".into()))?;
                    debug!(offset = c_offset, length = c_length, "Opening fetch stream");
                    let s = remote.get_content(&ro_uri, c_offset).await?;
                    *stream = Some(StreamState {
                        stream: s,
                        offset: c_offset,
                        pending: Vec::new(),
                    });
                }

                let mut eof = false;
                if let Some(st) = stream.as_mut() {
                    let mut buffered: u64 = st.pending.iter().map(|c| c.len() as u64).sum();
                    while st.offset + buffered < c_offset + c_length {
                        let chunk = st.stream.read_chunk().await?;
                        if chunk.is_empty() {
                            eof = true;
                            break;
                        }
                        st.pending.push(chunk);
                        {
                            let mut guard = self.cache.lock().await;
                            let cache = guard.as_mut().ok_or(Error::BadHandle)?;
                            let (new_offset, rest) = cache
                                .block_cache
                                .receive_cached_data(
                                    st.offset,
                                    std::mem::take(&mut st.pending),
                                )
                                .await?;
                            st.offset = new_offset;
                            st.pending = rest;
                        }
                        buffered = st.pending.iter().map(|c| c.len() as u64).sum();
                    }
                }
                if eof {
                    *stream = None;
                }
                Ok::<bool, Error>(eof)
            };

            match fill.await {
                Ok(eof) => remote_eof = eof,
                Err(e) => {
                    *stream = None;
                    return Err(Error::RemoteIo(format!("I/O error: {}", e)));
                }
            }
        }
    }

    /// Materialize the whole file locally, stream it to the remote, and
    /// record the returned capability. Serialized against reads and writes
    /// by the cache lock.
    pub async fn upload(
        &self,
        remote: &dyn RemoteIo,
        parent_cap: Option<&str>,
    ) -> Result<String, Error> {
        let upath = self.upath().ok_or(Error::Invalid("upload of unlinked file"))?;

        let mut guard = loop {
            let size = self.size().await;
            self.do_rw(remote, 0, RwOp::Buffer { length: size }).await?;
            let guard = self.cache.lock().await;
            let Some(cache) = guard.as_ref() else {
                return Err(Error::BadHandle);
            };
            let size = cache.block_cache.size();
            if cache.block_cache.pre_read(0, size).is_none() {
                break guard;
            }
            // A concurrent write slipped in while unlocked: buffer again
        };
        let cache = guard.as_mut().ok_or(Error::BadHandle)?;

        cache.block_cache.pad_to_size().await?;
        let size = cache.block_cache.size();

        // Spool to an unlinked temp file so the upload body is both
        // restartable and independent of the cache lock lifetime.
        let mut spool = tokio::fs::File::from_std(tempfile::tempfile()?);
        let mut off = 0u64;
        while off < size {
            let chunk = cache.block_cache.read(off, BLOCK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            off += chunk.len() as u64;
            spool.write_all(&chunk).await?;
        }
        spool.seek(std::io::SeekFrom::Start(0)).await?;

        let (upload_path, iscap) = match parent_cap {
            Some(cap) => (format!("{}/{}", cap, ubasename(&upath)), true),
            None => (upath.clone(), false),
        };
        let body = UploadBody {
            len: size,
            stream: Box::pin(tokio_util::io::ReaderStream::new(spool)),
        };
        let filecap = remote.put_file(&upload_path, body, iscap).await?;

        cache.info.ro_uri = Some(filecap.clone());
        cache.info.size = size;
        cache.info.retrieved = Some(unix_timestamp());
        Self::persist_info(&self.paths.info, &mut cache.info).await?;
        cache.dirty = false;
        info!(%upath, size, "Uploaded file");

        Ok(filecap)
    }

    /// Refresh the metadata record from the remote.
    pub(crate) async fn pull_downstream(&self, remote: &dyn RemoteIo) -> Result<(), Error> {
        let cap = self.info().await.ro_uri.ok_or(Error::NotFound)?;
        match remote.get_info(&cap, true).await? {
            NodeInfo::File(mut fi) => {
                let mut guard = self.cache.lock().await;
                let cache = guard.as_mut().ok_or(Error::BadHandle)?;
                if fi.rw_uri.is_none() {
                    fi.rw_uri = cache.info.rw_uri.take();
                }
                fi.retrieved = Some(unix_timestamp());
                cache.info = fi;
                Self::persist_info(&self.paths.info, &mut cache.info).await
            }
            NodeInfo::Dir(_) => Err(Error::IsDirectory),
        }
    }

    pub async fn unlink(&self) {
        let upath = self
            .upath
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if upath.is_some() && !self.invalidated() {
            for p in [&self.paths.info, &self.paths.state, &self.paths.data] {
                let _ = std::fs::remove_file(p);
            }
        }
    }

    /// Persist block state and release on-disk artifacts. Called by the
    /// registry when the last handle goes away.
    pub(crate) async fn close_storage(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut stream = self.stream.lock().await;
            *stream = None;
        }
        let mut guard = self.cache.lock().await;
        // Dropping the backing files at the end releases their locks even
        // if persisting the block state fails
        let Some(mut cache) = guard.take() else {
            return Ok(());
        };
        cache.block_cache.save_state(&mut cache.state_file).await?;
        cache.state_file.flush().await?;
        cache.block_cache.flush().await?;

        if !self.persistent && self.upath().is_some() && !self.invalidated() {
            let _ = std::fs::remove_file(&self.paths.state);
            let _ = std::fs::remove_file(&self.paths.data);
        }
        Ok(())
    }

    pub async fn freeze(&self) -> serde_json::Value {
        let guard = self.cache.lock().await;
        match guard.as_ref() {
            Some(cache) => serde_json::json!({
                "upath": self.upath(),
                "size": cache.block_cache.size(),
                "ro_uri": cache.info.ro_uri,
                "dirty": cache.dirty,
            }),
            None => serde_json::Value::Null,
        }
    }
}
