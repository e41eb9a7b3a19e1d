//! In-memory remote gateway for exercising the cache core hermetically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use futures::TryStreamExt;

use truckeefs::error::Error;
use truckeefs::info::{
    ChildEntry, ChildInfo, DirInfo, FileInfo, Metadata, NodeInfo, NodeKind,
};
use truckeefs::remote::{ContentStream, RemoteIo, UploadBody};

pub const ROOT_CAP: &str = "URI:DIR2:root";

enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Child>),
}

#[derive(Clone)]
struct Child {
    cap: String,
    metadata: Metadata,
}

struct RemoteState {
    nodes: BTreeMap<String, Node>,
    next_cap: u64,
}

/// A remote store living in process memory, counting PUTs so sync tests
/// can assert on upload traffic.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    puts: AtomicUsize,
    puts_started: AtomicUsize,
    /// When set, every PUT holds at this gate before completing.
    put_gate: Mutex<Option<std::sync::Arc<tokio::sync::Semaphore>>>,
    /// Content streams deliver data in pieces of this many bytes.
    chunk: usize,
}

#[allow(dead_code)]
impl MemoryRemote {
    pub fn new(chunk: usize) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_CAP.to_owned(), Node::Dir(BTreeMap::new()));
        Self {
            state: Mutex::new(RemoteState { nodes, next_cap: 0 }),
            puts: AtomicUsize::new(0),
            puts_started: AtomicUsize::new(0),
            put_gate: Mutex::new(None),
            chunk,
        }
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn puts_started(&self) -> usize {
        self.puts_started.load(Ordering::SeqCst)
    }

    pub fn set_put_gate(&self, gate: std::sync::Arc<tokio::sync::Semaphore>) {
        *self.put_gate.lock().unwrap() = Some(gate);
    }

    /// Seed a file at a upath, creating intermediate directories.
    pub fn insert_file(&self, upath: &str, data: Vec<u8>) -> String {
        let mut state = self.state.lock().unwrap();
        let (dir_cap, name) = match upath.rsplit_once('/') {
            Some((parent, name)) => (Self::mkdirs(&mut state, parent), name.to_owned()),
            None => (ROOT_CAP.to_owned(), upath.to_owned()),
        };
        state.next_cap += 1;
        let cap = format!("URI:CHK:{}", state.next_cap);
        state.nodes.insert(cap.clone(), Node::File(data));
        if let Some(Node::Dir(children)) = state.nodes.get_mut(&dir_cap) {
            children.insert(
                name,
                Child {
                    cap: cap.clone(),
                    metadata: Metadata::default(),
                },
            );
        }
        cap
    }

    /// Override the remote-side metadata of a directory entry.
    pub fn set_child_metadata(&self, dir_upath: &str, name: &str, metadata: Metadata) {
        let mut state = self.state.lock().unwrap();
        let dir_cap = Self::walk(&state, dir_upath).expect("directory must exist");
        if let Some(Node::Dir(children)) = state.nodes.get_mut(&dir_cap) {
            if let Some(child) = children.get_mut(name) {
                child.metadata = metadata;
            }
        }
    }

    fn mkdirs(state: &mut RemoteState, upath: &str) -> String {
        let mut cap = ROOT_CAP.to_owned();
        if upath.is_empty() {
            return cap;
        }
        for segment in upath.split('/') {
            let existing = match state.nodes.get(&cap) {
                Some(Node::Dir(children)) => children.get(segment).map(|c| c.cap.clone()),
                _ => None,
            };
            cap = match existing {
                Some(cap) => cap,
                None => {
                    state.next_cap += 1;
                    let new_cap = format!("URI:DIR2:{}", state.next_cap);
                    state.nodes.insert(new_cap.clone(), Node::Dir(BTreeMap::new()));
                    if let Some(Node::Dir(children)) = state.nodes.get_mut(&cap) {
                        children.insert(
                            segment.to_owned(),
                            Child {
                                cap: new_cap.clone(),
                                metadata: Metadata::default(),
                            },
                        );
                    }
                    new_cap
                }
            };
        }
        cap
    }

    fn walk(state: &RemoteState, upath: &str) -> Result<String, Error> {
        let mut cap = ROOT_CAP.to_owned();
        if upath.is_empty() {
            return Ok(cap);
        }
        for segment in upath.split('/') {
            match state.nodes.get(&cap) {
                Some(Node::Dir(children)) => {
                    cap = children.get(segment).ok_or(Error::NotFound)?.cap.clone();
                }
                _ => return Err(Error::NotFound),
            }
        }
        Ok(cap)
    }

    /// `iscap` paths are `cap[/child...]`; plain paths are rooted upaths.
    fn resolve(state: &RemoteState, path: &str, iscap: bool) -> Result<String, Error> {
        if !iscap {
            return Self::walk(state, path);
        }
        let mut parts = path.split('/');
        let mut cap = parts.next().unwrap_or_default().to_owned();
        for segment in parts {
            match state.nodes.get(&cap) {
                Some(Node::Dir(children)) => {
                    cap = children.get(segment).ok_or(Error::NotFound)?.cap.clone();
                }
                _ => return Err(Error::NotFound),
            }
        }
        if !state.nodes.contains_key(&cap) {
            return Err(Error::NotFound);
        }
        Ok(cap)
    }

    /// Split an `iscap` path into the containing directory cap and the
    /// final name.
    fn resolve_parent(
        state: &RemoteState,
        path: &str,
        iscap: bool,
    ) -> Result<(String, String), Error> {
        let (parent, name) = path.rsplit_once('/').ok_or(Error::NotFound)?;
        Ok((Self::resolve(state, parent, iscap)?, name.to_owned()))
    }
}

#[async_trait::async_trait]
impl RemoteIo for MemoryRemote {
    async fn get_info(&self, path: &str, iscap: bool) -> Result<NodeInfo, Error> {
        let state = self.state.lock().unwrap();
        let cap = Self::resolve(&state, path, iscap)?;
        match state.nodes.get(&cap) {
            Some(Node::File(data)) => Ok(NodeInfo::File(FileInfo {
                size: data.len() as u64,
                ro_uri: Some(cap),
                rw_uri: None,
                retrieved: None,
            })),
            Some(Node::Dir(children)) => {
                let children = children
                    .iter()
                    .map(|(name, child)| {
                        let is_dir = child.cap.starts_with("URI:DIR");
                        let size = match state.nodes.get(&child.cap) {
                            Some(Node::File(data)) => Some(data.len() as u64),
                            _ => None,
                        };
                        (
                            name.clone(),
                            ChildEntry {
                                kind: if is_dir { NodeKind::Dir } else { NodeKind::File },
                                info: ChildInfo {
                                    ro_uri: Some(child.cap.clone()),
                                    rw_uri: is_dir.then(|| child.cap.clone()),
                                    size,
                                    metadata: child.metadata.clone(),
                                },
                            },
                        )
                    })
                    .collect();
                Ok(NodeInfo::Dir(DirInfo {
                    children,
                    ro_uri: Some(cap.clone()),
                    rw_uri: Some(cap),
                    retrieved: None,
                }))
            }
            None => Err(Error::NotFound),
        }
    }

    async fn get_content(
        &self,
        cap: &str,
        offset: u64,
    ) -> Result<Box<dyn ContentStream>, Error> {
        let state = self.state.lock().unwrap();
        match state.nodes.get(cap) {
            Some(Node::File(data)) => Ok(Box::new(MemoryContentStream {
                data: data.clone(),
                pos: (offset as usize).min(data.len()),
                chunk: self.chunk,
            })),
            _ => Err(Error::NotFound),
        }
    }

    async fn put_file(&self, path: &str, body: UploadBody, iscap: bool) -> Result<String, Error> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.put_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| Error::RemoteIo(e.to_string()))?
                .forget();
        }
        let chunks: Vec<Bytes> = body
            .stream
            .try_collect()
            .await
            .map_err(|e| Error::RemoteIo(e.to_string()))?;
        let data: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(data.len() as u64, body.len, "upload length mismatch");

        let mut state = self.state.lock().unwrap();
        let (dir_cap, name) = if iscap {
            Self::resolve_parent(&state, path, true)?
        } else {
            let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
            (Self::walk(&state, parent)?, name.to_owned())
        };

        state.next_cap += 1;
        let cap = format!("URI:CHK:{}", state.next_cap);
        state.nodes.insert(cap.clone(), Node::File(data));
        match state.nodes.get_mut(&dir_cap) {
            Some(Node::Dir(children)) => {
                children.insert(
                    name,
                    Child {
                        cap: cap.clone(),
                        metadata: Metadata::default(),
                    },
                );
            }
            _ => return Err(Error::NotFound),
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(cap)
    }

    async fn delete(&self, path: &str, iscap: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let (dir_cap, name) = if iscap {
            Self::resolve_parent(&state, path, true)?
        } else {
            let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
            (Self::walk(&state, parent)?, name.to_owned())
        };
        match state.nodes.get_mut(&dir_cap) {
            Some(Node::Dir(children)) => {
                let child = children.remove(&name).ok_or(Error::NotFound)?;
                state.nodes.remove(&child.cap);
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    async fn mkdir(&self, path: &str, iscap: bool) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        let (dir_cap, name) = if iscap {
            Self::resolve_parent(&state, path, true)?
        } else {
            let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
            (Self::walk(&state, parent)?, name.to_owned())
        };
        state.next_cap += 1;
        let cap = format!("URI:DIR2:{}", state.next_cap);
        state.nodes.insert(cap.clone(), Node::Dir(BTreeMap::new()));
        match state.nodes.get_mut(&dir_cap) {
            Some(Node::Dir(children)) => {
                children.insert(
                    name,
                    Child {
                        cap: cap.clone(),
                        metadata: Metadata::default(),
                    },
                );
            }
            _ => return Err(Error::NotFound),
        }
        Ok(cap)
    }

    async fn wait_until_write_allowed(&self) {}
}

struct MemoryContentStream {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

#[async_trait::async_trait]
impl ContentStream for MemoryContentStream {
    async fn read_chunk(&mut self) -> Result<Bytes, Error> {
        let end = (self.pos + self.chunk).min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(chunk)
    }
}
