//! Cached directory inodes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Mutex;

use super::Attr;
use crate::error::Error;
use crate::framed::{FramedFile, Mode, DEFAULT_BLOCK_SIZE};
use crate::info::{
    json_zlib_decode, json_zlib_encode, ChildEntry, ChildInfo, DirInfo, Metadata, NodeInfo,
    NodeKind, TahoeMeta,
};
use crate::remote::RemoteIo;
use crate::utils::{touch, unix_timestamp};

/// Logical directory on disk: a single cached blob of children and their
/// capabilities. There is a single `DirInode` instance per open upath.
pub struct DirInode {
    upath: std::sync::RwLock<Option<String>>,
    invalidated: AtomicBool,
    refcnt: AtomicUsize,
    filename: PathBuf,
    state: Mutex<DirInfo>,
}

impl DirInode {
    pub async fn open(
        filename: PathBuf,
        upath: String,
        remote: &dyn RemoteIo,
        dircap: Option<&str>,
    ) -> Result<Self, Error> {
        let info = match Self::try_reuse(&filename).await {
            Some(info) => {
                touch(&filename);
                info
            }
            None => {
                let fetched = match dircap {
                    Some(cap) => remote.get_info(cap, true).await,
                    None => remote.get_info(&upath, false).await,
                };
                let mut info = match fetched {
                    Ok(NodeInfo::Dir(info)) => info,
                    Ok(NodeInfo::File(_)) => return Err(Error::NotDirectory),
                    Err(Error::NotFound) => return Err(Error::NotFound),
                    Err(e) => {
                        return Err(Error::RemoteIo(format!(
                            "failed to retrieve information: {}",
                            e
                        )))
                    }
                };
                info.retrieved = Some(unix_timestamp());
                if let Err(e) = Self::persist(&filename, &info).await {
                    let _ = std::fs::remove_file(&filename);
                    return Err(e);
                }
                info
            }
        };

        Ok(Self {
            upath: std::sync::RwLock::new(Some(upath)),
            invalidated: AtomicBool::new(false),
            refcnt: AtomicUsize::new(0),
            filename,
            state: Mutex::new(info),
        })
    }

    async fn try_reuse(filename: &Path) -> Option<DirInfo> {
        let mut f = FramedFile::open(filename, Mode::Read, DEFAULT_BLOCK_SIZE)
            .await
            .ok()?;
        let buf = f.read_all().await.ok()?;
        match json_zlib_decode::<NodeInfo>(&buf).ok()? {
            NodeInfo::Dir(info) => Some(info),
            NodeInfo::File(_) => None,
        }
    }

    async fn persist(filename: &Path, info: &DirInfo) -> Result<(), Error> {
        let blob = json_zlib_encode(&NodeInfo::Dir(info.clone()))?;
        let mut f = FramedFile::open(filename, Mode::Create, DEFAULT_BLOCK_SIZE).await?;
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
        let retrieved = self.state.lock().await.retrieved.unwrap_or(0.0);
        retrieved + lifetime >= unix_timestamp()
    }

    pub async fn rw_cap(&self) -> Option<String> {
        self.state.lock().await.rw_uri.clone()
    }

    pub async fn ro_cap(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.ro_uri.clone().or_else(|| state.rw_uri.clone())
    }

    pub async fn listdir(&self) -> Vec<String> {
        self.state.lock().await.children.keys().cloned().collect()
    }

    pub async fn get_attr(&self) -> Attr {
        Attr {
            kind: NodeKind::Dir,
            ..Default::default()
        }
    }

    pub async fn get_child_attr(&self, childname: &str) -> Result<Attr, Error> {
        let state = self.state.lock().await;
        let entry = state.children.get(childname).ok_or(Error::NotFound)?;

        // tahoe.linkcrtime is absent for entries created by backup tools,
        // which carry explicit ctime/mtime instead.
        // TODO: should mtime prefer tahoe.linkmotime?
        let linkcrtime = entry
            .info
            .metadata
            .tahoe
            .as_ref()
            .and_then(|t| t.linkcrtime);
        let ctime = linkcrtime.or(entry.info.metadata.ctime);
        let mtime = linkcrtime.or(entry.info.metadata.mtime);

        Ok(Attr {
            kind: entry.kind,
            size: match entry.kind {
                NodeKind::File => entry.info.size,
                NodeKind::Dir => None,
            },
            ro_uri: entry.info.ro_uri.clone(),
            rw_uri: entry.info.rw_uri.clone(),
            ctime,
            mtime,
        })
    }

    /// Record a child in the cached blob and persist it. `cap` of `None`
    /// registers a new, not yet uploaded file.
    pub async fn cache_add_child(
        &self,
        basename: &str,
        cap: Option<&str>,
        size: Option<u64>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        let mut entry = match state.children.get(basename) {
            Some(entry) => entry.clone(),
            None => {
                let kind = match cap {
                    Some(cap) if cap.starts_with("URI:DIR") => NodeKind::Dir,
                    _ => NodeKind::File,
                };
                ChildEntry {
                    kind,
                    info: ChildInfo {
                        metadata: Metadata {
                            tahoe: Some(TahoeMeta {
                                linkcrtime: Some(unix_timestamp()),
                                linkmotime: None,
                            }),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                }
            }
        };

        match entry.kind {
            NodeKind::Dir => {
                entry.info.ro_uri = cap.map(str::to_owned);
                entry.info.rw_uri = cap.map(str::to_owned);
            }
            NodeKind::File => {
                entry.info.ro_uri = cap.map(str::to_owned);
                entry.info.size = size;
            }
        }

        state.children.insert(basename.to_owned(), entry);
        Self::persist(&self.filename, &state).await
    }

    pub async fn cache_remove_child(&self, basename: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.children.remove(basename).is_some() {
            Self::persist(&self.filename, &state).await?;
        }
        Ok(())
    }

    pub async fn unlink(&self) {
        let upath = self
            .upath
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if upath.is_some() && !self.invalidated() {
            let _ = std::fs::remove_file(&self.filename);
        }
    }

    /// Refresh the cached blob from the remote.
    pub(crate) async fn pull_downstream(&self, remote: &dyn RemoteIo) -> Result<(), Error> {
        let (cap, upath) = {
            let state = self.state.lock().await;
            (state.rw_uri.clone().or_else(|| state.ro_uri.clone()), self.upath())
        };
        let upath = upath.ok_or(Error::NotFound)?;
        let fetched = match &cap {
            Some(cap) => remote.get_info(cap, true).await?,
            None => remote.get_info(&upath, false).await?,
        };
        match fetched {
            NodeInfo::Dir(mut info) => {
                info.retrieved = Some(unix_timestamp());
                let mut state = self.state.lock().await;
                *state = info;
                Self::persist(&self.filename, &state).await
            }
            NodeInfo::File(_) => Err(Error::NotDirectory),
        }
    }

    pub async fn freeze(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        serde_json::json!({
            "upath": self.upath(),
            "children": state.children.keys().collect::<Vec<_>>(),
            "rw_uri": state.rw_uri,
        })
    }
}

impl std::fmt::Debug for DirInode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DirInode({:?})", self.upath())
    }
}
