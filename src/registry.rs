//! Open-items registry: the process-wide map from upath to open inode,
//! with cap resolution, TTL freshness, subtree invalidation and cache
//! eviction.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::*;

use crate::error::Error;
use crate::framed::{FramedFile, Mode, DEFAULT_BLOCK_SIZE};
use crate::handle::{DirHandle, FileHandle};
use crate::info::{json_zlib_decode, NodeInfo, NodeKind};
use crate::inode::{Attr, DirInode, FileInode, FilePaths, Inode};
use crate::keys::{KeyMaterial, ROLE_DATA, ROLE_STATE};
use crate::remote::RemoteIo;
use crate::upath::{ubasename, udirname};
use crate::utils::{cache_score, unix_timestamp};

/// Bound on the directory-handle LRU.
const MAX_ITEM_CACHE: usize = 500;

/// Minimum seconds between eviction scans.
const SIZE_CHECK_INTERVAL: f64 = 60.0;

/// Non-cache files living in the cache directory: the key-derivation salt
/// and the durable inode table. Never invalidated, never evicted.
const PROTECTED_FILES: [&str; 2] = ["salt", "delta.db"];

struct DirCacheEntry {
    seq: u64,
    handle: Arc<DirHandle>,
}

impl PartialEq for DirCacheEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for DirCacheEntry {}
impl PartialOrd for DirCacheEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DirCacheEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

struct RegState {
    open_items: HashMap<String, Inode>,
    /// Recently opened directory handles, kept resident; min-heap on open
    /// order so the oldest is evicted first.
    item_cache: BinaryHeap<Reverse<DirCacheEntry>>,
    item_cache_seq: u64,
    last_size_check: f64,
}

pub struct CacheRegistry {
    cache_dir: PathBuf,
    keys: KeyMaterial,
    /// Target ceiling for the on-disk cache; 0 means unrestricted.
    cache_size_limit: u64,
    /// Keep data and state files across close.
    cache_data: bool,
    read_lifetime: f64,
    write_lifetime: f64,
    state: Mutex<RegState>,
}

impl CacheRegistry {
    pub async fn new(
        cache_dir: PathBuf,
        rootcap: &str,
        cache_size_limit: u64,
        cache_data: bool,
        read_lifetime: f64,
        write_lifetime: f64,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&cache_dir)?;
        let keys = KeyMaterial::load_or_create(&cache_dir, rootcap)?;
        let this = Self {
            cache_dir,
            keys,
            cache_size_limit,
            cache_data,
            read_lifetime,
            write_lifetime,
            state: Mutex::new(RegState {
                open_items: HashMap::new(),
                item_cache: BinaryHeap::new(),
                item_cache_seq: 0,
                last_size_check: 0.0,
            }),
        };
        this.restrict_size().await?;
        Ok(this)
    }

    pub fn read_lifetime(&self) -> f64 {
        self.read_lifetime
    }

    pub fn write_lifetime(&self) -> f64 {
        self.write_lifetime
    }

    fn file_paths(&self, upath: &str) -> FilePaths {
        FilePaths {
            info: self.keys.filename_and_key(&self.cache_dir, upath, None).0,
            state: self
                .keys
                .filename_and_key(&self.cache_dir, upath, Some(ROLE_STATE))
                .0,
            data: self
                .keys
                .filename_and_key(&self.cache_dir, upath, Some(ROLE_DATA))
                .0,
        }
    }

    fn node_filename(&self, upath: &str) -> PathBuf {
        self.keys.filename_and_key(&self.cache_dir, upath, None).0
    }

    /// The open inode for a upath, if any. Used by the coordination layer's
    /// resolution protocol.
    pub async fn get_open(&self, upath: &str) -> Option<Inode> {
        self.state.lock().await.open_items.get(upath).cloned()
    }

    // -- Opening and closing

    pub async fn open_file(
        &self,
        upath: &str,
        remote: &dyn RemoteIo,
        flags: i32,
        lifetime: Option<f64>,
    ) -> Result<Arc<FileHandle>, Error> {
        let mut st = self.state.lock().await;
        let acc = flags & libc::O_ACCMODE;
        let writeable = acc == libc::O_RDWR || acc == libc::O_WRONLY;
        let mut lifetime = lifetime;
        if writeable {
            // Drop the data cache before opening in write mode
            if !st.open_items.contains_key(upath) {
                self.invalidate_locked(&mut st, upath, false).await?;
            }
            // Limit e.g. the parent directory lookup lifetime
            lifetime = lifetime.or(Some(self.write_lifetime));
        }
        let lifetime = lifetime.unwrap_or(self.read_lifetime);

        let inode = self
            .get_file_inode_locked(
                &mut st,
                remote,
                upath,
                flags & libc::O_EXCL != 0,
                flags & libc::O_CREAT != 0,
                lifetime,
            )
            .await?;
        Ok(Arc::new(
            FileHandle::new(upath.to_owned(), inode, flags).await?,
        ))
    }

    pub async fn open_dir(
        &self,
        upath: &str,
        remote: &dyn RemoteIo,
        lifetime: Option<f64>,
    ) -> Result<Arc<DirHandle>, Error> {
        let mut st = self.state.lock().await;
        let lifetime = lifetime.unwrap_or(self.read_lifetime);
        self.open_dir_locked(&mut st, remote, upath, lifetime).await
    }

    pub async fn close_file(&self, handle: &Arc<FileHandle>) -> Result<(), Error> {
        let mut st = self.state.lock().await;
        self.close_file_locked(&mut st, handle).await
    }

    pub async fn close_dir(&self, handle: &Arc<DirHandle>) -> Result<(), Error> {
        let mut st = self.state.lock().await;
        self.close_dir_locked(&mut st, handle).await
    }

    async fn close_file_locked(
        &self,
        st: &mut RegState,
        handle: &Arc<FileHandle>,
    ) -> Result<(), Error> {
        let remaining = handle.close()?;
        if remaining == 0 {
            handle.inode().close_storage().await?;
            if let Some(Inode::File(open)) = st.open_items.get(&handle.upath) {
                if Arc::ptr_eq(open, handle.inode()) {
                    st.open_items.remove(&handle.upath);
                }
            }
            self.restrict_size_locked(st).await?;
        }
        Ok(())
    }

    async fn close_dir_locked(
        &self,
        st: &mut RegState,
        handle: &Arc<DirHandle>,
    ) -> Result<(), Error> {
        let remaining = handle.close()?;
        if remaining == 0 {
            if let Some(Inode::Dir(open)) = st.open_items.get(&handle.upath) {
                if Arc::ptr_eq(open, handle.inode()) {
                    st.open_items.remove(&handle.upath);
                }
            }
            self.restrict_size_locked(st).await?;
        }
        Ok(())
    }

    // -- Inode lookup and construction

    /// Resolve the capability of a upath: from a fresh open inode if
    /// possible, else through the parent directory chain. The root has no
    /// cap.
    fn lookup_cap<'a>(
        &'a self,
        st: &'a mut RegState,
        remote: &'a dyn RemoteIo,
        upath: &'a str,
        read_only: bool,
        lifetime: f64,
    ) -> BoxFuture<'a, Result<Option<String>, Error>> {
        Box::pin(async move {
            if let Some(inode) = st.open_items.get(upath) {
                if inode.is_fresh(lifetime).await {
                    // Shortcut
                    return Ok(match inode {
                        Inode::File(f) => {
                            let info = f.info().await;
                            if read_only {
                                info.ro_uri
                            } else {
                                info.rw_uri
                            }
                        }
                        Inode::Dir(d) => {
                            if read_only {
                                d.ro_cap().await
                            } else {
                                d.rw_cap().await
                            }
                        }
                    });
                }
            }
            if upath.is_empty() {
                // Root
                return Ok(None);
            }

            // Lookup from the parent
            let entry_name = ubasename(upath);
            let parent_upath = udirname(upath);
            let parent = self
                .open_dir_locked(st, remote, parent_upath, lifetime)
                .await?;
            let attr = parent.get_child_attr(entry_name).await;
            let result = attr.map(|attr| {
                if read_only {
                    attr.ro_uri
                } else {
                    attr.rw_uri
                }
            });
            self.close_dir_locked(st, &parent).await?;
            result
        })
    }

    async fn get_file_inode_locked(
        &self,
        st: &mut RegState,
        remote: &dyn RemoteIo,
        upath: &str,
        excl: bool,
        creat: bool,
        lifetime: f64,
    ) -> Result<Arc<FileInode>, Error> {
        if let Some(inode) = st.open_items.get(upath).cloned() {
            if inode.is_fresh(lifetime).await {
                if excl {
                    return Err(Error::AlreadyExists);
                }
                return inode.as_file().cloned();
            }
            self.invalidate_locked(st, upath, true).await?;
        }

        let cap = match self.lookup_cap(st, remote, upath, true, lifetime).await {
            Ok(cap) => cap,
            Err(Error::NotFound) if creat => None,
            Err(e) => return Err(e),
        };
        if excl && cap.is_some() {
            return Err(Error::AlreadyExists);
        }
        if !creat && cap.is_none() {
            return Err(Error::NotFound);
        }

        let inode = Arc::new(
            FileInode::open(
                upath.to_owned(),
                self.file_paths(upath),
                cap.as_deref(),
                remote,
                self.cache_data,
            )
            .await?,
        );
        st.open_items
            .insert(upath.to_owned(), Inode::File(inode.clone()));

        if cap.is_none() {
            // New file: add to the parent's cached children
            let parent = self
                .open_dir_locked(st, remote, udirname(upath), lifetime)
                .await?;
            let added = parent
                .inode()
                .cache_add_child(ubasename(upath), None, Some(0))
                .await;
            self.close_dir_locked(st, &parent).await?;
            added?;
        }
        Ok(inode)
    }

    fn open_dir_locked<'a>(
        &'a self,
        st: &'a mut RegState,
        remote: &'a dyn RemoteIo,
        upath: &'a str,
        lifetime: f64,
    ) -> BoxFuture<'a, Result<Arc<DirHandle>, Error>> {
        Box::pin(async move {
            let inode = self
                .get_dir_inode_locked(st, remote, upath, lifetime)
                .await?;
            Ok(Arc::new(DirHandle::new(upath.to_owned(), inode)))
        })
    }

    async fn get_dir_inode_locked(
        &self,
        st: &mut RegState,
        remote: &dyn RemoteIo,
        upath: &str,
        lifetime: f64,
    ) -> Result<Arc<DirInode>, Error> {
        if let Some(inode) = st.open_items.get(upath).cloned() {
            if inode.is_fresh(lifetime).await {
                return inode.as_dir().cloned();
            }
            self.invalidate_locked(st, upath, true).await?;
        }

        let cap = self
            .lookup_cap(st, remote, upath, false, lifetime)
            .await?;
        let inode = Arc::new(
            DirInode::open(
                self.node_filename(upath),
                upath.to_owned(),
                remote,
                cap.as_deref(),
            )
            .await?,
        );
        st.open_items
            .insert(upath.to_owned(), Inode::Dir(inode.clone()));

        // Keep the directory resident in the LRU of recent handles
        st.item_cache_seq += 1;
        let entry = DirCacheEntry {
            seq: st.item_cache_seq,
            handle: Arc::new(DirHandle::new(upath.to_owned(), inode.clone())),
        };
        if st.item_cache.len() < MAX_ITEM_CACHE {
            st.item_cache.push(Reverse(entry));
        } else if let Some(Reverse(oldest)) = st.item_cache.pop() {
            st.item_cache.push(Reverse(entry));
            self.close_dir_locked(st, &oldest.handle).await?;
        }

        Ok(inode)
    }

    // -- Composite operations

    /// Upload a dirty file and record the fresh capability in the parent's
    /// cached children. A failed upload shallowly invalidates the parent,
    /// since the file might not have been created remotely.
    pub async fn upload_file(
        &self,
        inode: &Arc<FileInode>,
        remote: &dyn RemoteIo,
    ) -> Result<(), Error> {
        let Some(upath) = inode.upath() else {
            return Ok(());
        };
        if !inode.dirty().await {
            return Ok(());
        }

        let parent_upath = udirname(&upath);
        let parent = self
            .open_dir(parent_upath, remote, Some(self.write_lifetime))
            .await?;
        let parent_cap = parent.inode().rw_cap().await;

        match inode.upload(remote, parent_cap.as_deref()).await {
            Err(e) => {
                // The file might not have been created: the parent's cached
                // listing can no longer be trusted
                self.invalidate(parent_upath, true).await?;
                self.close_dir(&parent).await?;
                Err(e)
            }
            Ok(cap) => {
                let size = inode.size().await;
                let added = {
                    let _st = self.state.lock().await;
                    parent
                        .inode()
                        .cache_add_child(ubasename(&upath), Some(&cap), Some(size))
                        .await
                };
                self.close_dir(&parent).await?;
                added
            }
        }
    }

    pub async fn unlink(
        &self,
        upath: &str,
        remote: &dyn RemoteIo,
        is_dir: bool,
    ) -> Result<(), Error> {
        if upath.is_empty() {
            return Err(Error::Denied);
        }
        let mut st = self.state.lock().await;

        // Unlink in cache
        if is_dir {
            let d = self
                .open_dir_locked(&mut st, remote, upath, self.write_lifetime)
                .await?;
            d.inode().unlink().await;
            self.close_dir_locked(&mut st, &d).await?;
        } else {
            let inode = self
                .get_file_inode_locked(&mut st, remote, upath, false, false, self.write_lifetime)
                .await?;
            let f = Arc::new(FileHandle::new(upath.to_owned(), inode, 0).await?);
            f.inode().unlink().await;
            self.close_file_locked(&mut st, &f).await?;
        }

        // Perform the remote unlink under the parent's write cap
        let parent = self
            .open_dir_locked(&mut st, remote, udirname(upath), self.write_lifetime)
            .await?;
        let result = async {
            let parent_cap = parent.inode().rw_cap().await.ok_or(Error::Denied)?;
            let upath_cap = format!("{}/{}", parent_cap, ubasename(upath));
            match remote.delete(&upath_cap, true).await {
                Ok(()) => Ok(()),
                Err(Error::NotFound) => Err(Error::NotFound),
                Err(e) => Err(Error::RemoteIo(format!("failed to unlink: {}", e))),
            }?;
            parent.inode().cache_remove_child(ubasename(upath)).await
        }
        .await;
        self.close_dir_locked(&mut st, &parent).await?;
        result
    }

    pub async fn mkdir(&self, upath: &str, remote: &dyn RemoteIo) -> Result<(), Error> {
        if upath.is_empty() {
            return Err(Error::AlreadyExists);
        }
        let mut st = self.state.lock().await;

        // Check that the parent exists
        let parent = self
            .open_dir_locked(&mut st, remote, udirname(upath), self.write_lifetime)
            .await?;
        let result = async {
            let parent_cap = parent.inode().rw_cap().await.ok_or(Error::Denied)?;

            // Check that the target does not exist
            match parent.get_child_attr(ubasename(upath)).await {
                Ok(_) => return Err(Error::AlreadyExists),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }

            self.invalidate_locked(&mut st, upath, false).await?;

            let upath_cap = format!("{}/{}", parent_cap, ubasename(upath));
            let cap = remote
                .mkdir(&upath_cap, true)
                .await
                .map_err(|e| Error::RemoteIo(format!("remote operation failed: {}", e)))?;

            parent
                .inode()
                .cache_add_child(ubasename(upath), Some(&cap), None)
                .await
        }
        .await;
        self.close_dir_locked(&mut st, &parent).await?;
        result
    }

    pub async fn get_attr(&self, upath: &str, remote: &dyn RemoteIo) -> Result<Attr, Error> {
        let mut attr = if upath.is_empty() {
            let dir = self.open_dir(upath, remote, None).await?;
            let attr = dir.get_attr().await;
            self.close_dir(&dir).await?;
            attr?
        } else {
            let dir = self.open_dir(udirname(upath), remote, None).await?;
            let result = match dir.get_child_attr(ubasename(upath)).await {
                Err(Error::NotFound) => {
                    // Possibly a new file that has not yet been uploaded
                    let st = self.state.lock().await;
                    match st.open_items.get(upath) {
                        Some(inode) => {
                            let mut attr = inode.get_attr().await;
                            let now = unix_timestamp();
                            attr.mtime.get_or_insert(now);
                            attr.ctime.get_or_insert(now);
                            Ok(attr)
                        }
                        None => Err(Error::NotFound),
                    }
                }
                other => other,
            };
            self.close_dir(&dir).await?;
            result?
        };

        // Live open state takes precedence over the parent's cached view
        let st = self.state.lock().await;
        if let Some(inode) = st.open_items.get(upath) {
            let live = inode.get_attr().await;
            attr.kind = live.kind;
            if let Some(size) = live.size {
                attr.size = Some(size);
            }
            let now = unix_timestamp();
            attr.mtime.get_or_insert(now);
            attr.ctime.get_or_insert(now);
        }
        Ok(attr)
    }

    // -- Invalidation

    pub async fn invalidate(&self, root_upath: &str, shallow: bool) -> Result<(), Error> {
        let mut st = self.state.lock().await;
        self.invalidate_locked(&mut st, root_upath, shallow).await
    }

    async fn invalidate_locked(
        &self,
        st: &mut RegState,
        root_upath: &str,
        shallow: bool,
    ) -> Result<(), Error> {
        let dead_files: Vec<String> = if root_upath.is_empty() && !shallow {
            for (_, inode) in st.open_items.drain() {
                inode.set_invalidated();
            }
            std::fs::read_dir(&self.cache_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        } else {
            let mut dead = Vec::new();
            for (fname, upath) in self.walk_cache_subtree(root_upath).await {
                if let Some(inode) = st.open_items.remove(&upath) {
                    inode.set_invalidated();
                }
                dead.push(fname);
                if shallow && upath != root_upath {
                    break;
                }
            }
            dead
        };

        for basename in dead_files {
            if PROTECTED_FILES.contains(&basename.as_str()) {
                continue;
            }
            let path = self.cache_dir.join(basename);
            if path.is_file() {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }

    /// Walk the cached directory tree from `root_upath`, returning the
    /// on-disk filename and upath of each reached cached entry.
    async fn walk_cache_subtree(&self, root_upath: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut stack = Vec::new();

        let root_fn = self.node_filename(root_upath);
        if root_fn.is_file() {
            stack.push((root_upath.to_owned(), root_fn));
        }

        while let Some((upath, fname)) = stack.pop() {
            if !fname.is_file() {
                continue;
            }
            let (kind, children) = match Self::read_cached_children(&fname).await {
                Some(parsed) => parsed,
                None => continue,
            };

            let basename = fname
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            out.push((basename, upath.clone()));
            if kind == NodeKind::File {
                // A file entry owns two more on-disk artifacts
                for role in [ROLE_STATE, ROLE_DATA] {
                    let (fn_role, _) =
                        self.keys.filename_and_key(&self.cache_dir, &upath, Some(role));
                    let basename = fn_role
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    out.push((basename, upath.clone()));
                }
            }

            for (name, kind) in children {
                let c_upath = if upath.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", upath, name)
                };
                match kind {
                    NodeKind::Dir => {
                        let c_fn = self.node_filename(&c_upath);
                        if c_fn.is_file() {
                            stack.push((c_upath, c_fn));
                        }
                    }
                    NodeKind::File => {
                        for role in [None, Some(ROLE_STATE), Some(ROLE_DATA)] {
                            let (c_fn, _) =
                                self.keys.filename_and_key(&self.cache_dir, &c_upath, role);
                            let basename = c_fn
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            out.push((basename, c_upath.clone()));
                        }
                    }
                }
            }
        }
        out
    }

    /// Kind and child names of a cached blob, `None` when it is unreadable.
    async fn read_cached_children(
        fname: &std::path::Path,
    ) -> Option<(NodeKind, Vec<(String, NodeKind)>)> {
        let mut f = FramedFile::open(fname, Mode::Read, DEFAULT_BLOCK_SIZE).await.ok()?;
        let buf = f.read_all().await.ok()?;
        match json_zlib_decode::<NodeInfo>(&buf).ok()? {
            NodeInfo::Dir(d) => Some((
                NodeKind::Dir,
                d.children
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.kind))
                    .collect(),
            )),
            NodeInfo::File(_) => Some((NodeKind::File, Vec::new())),
        }
    }

    // -- Eviction

    /// Throttled eviction scan; runs at most once per minute.
    pub async fn restrict_size(&self) -> Result<(), Error> {
        let mut st = self.state.lock().await;
        self.restrict_size_locked(&mut st).await
    }

    async fn restrict_size_locked(&self, st: &mut RegState) -> Result<(), Error> {
        let now = unix_timestamp();
        if now < st.last_size_check + SIZE_CHECK_INTERVAL {
            return Ok(());
        }
        st.last_size_check = now;
        self.restrict_size_now().await
    }

    /// Unthrottled eviction: keep cache files in decreasing score order
    /// until the cumulative size exceeds the limit, unlink the rest.
    pub async fn restrict_size_now(&self) -> Result<(), Error> {
        if self.cache_size_limit == 0 {
            return Ok(());
        }
        let now = unix_timestamp();

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if PROTECTED_FILES
                .iter()
                .any(|p| entry.file_name() == std::ffi::OsStr::new(p))
            {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .map(|m| now - m.as_secs_f64())
                .unwrap_or(0.0);
            entries.push((entry.path(), meta.len(), cache_score(meta.len(), age)));
        }
        entries.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut tot_size = 0u64;
        for (path, size, score) in entries {
            if tot_size + size > self.cache_size_limit {
                debug!(?path, size, score, "Evicting cache file");
                let _ = std::fs::remove_file(path);
            } else {
                tot_size += size;
            }
        }
        Ok(())
    }

    // -- Sync worker support

    /// Get-or-open an inode of a known kind, holding a reference for the
    /// sync worker. Pair with [`Self::release_inode`].
    pub async fn open_inode(
        &self,
        upath: &str,
        kind: NodeKind,
        remote: &dyn RemoteIo,
    ) -> Result<Inode, Error> {
        let mut st = self.state.lock().await;
        match kind {
            NodeKind::File => {
                let f = self
                    .get_file_inode_locked(&mut st, remote, upath, false, false, self.read_lifetime)
                    .await?;
                f.incref();
                Ok(Inode::File(f))
            }
            NodeKind::Dir => {
                let d = self
                    .get_dir_inode_locked(&mut st, remote, upath, self.read_lifetime)
                    .await?;
                d.incref();
                Ok(Inode::Dir(d))
            }
        }
    }

    pub async fn release_inode(&self, inode: &Inode) -> Result<(), Error> {
        let mut st = self.state.lock().await;
        if inode.decref() == 0 {
            if let Inode::File(f) = inode {
                f.close_storage().await?;
            }
            if let Some(upath) = inode.upath() {
                let same = match (st.open_items.get(&upath), inode) {
                    (Some(Inode::File(a)), Inode::File(b)) => Arc::ptr_eq(a, b),
                    (Some(Inode::Dir(a)), Inode::Dir(b)) => Arc::ptr_eq(a, b),
                    _ => false,
                };
                if same {
                    st.open_items.remove(&upath);
                }
            }
            self.restrict_size_locked(&mut st).await?;
        }
        Ok(())
    }
}
