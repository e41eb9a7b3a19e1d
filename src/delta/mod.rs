//! Cross-process coordination layer.
//!
//! Tracks what has changed locally relative to the remote state: a durable
//! inode identity table plus an ephemeral store of per-inode process states
//! and sync ownership. This layer is the authority on what the remote state
//! should become; conflicting remote mutation is not reconciled
//! (last-writer-wins).

mod inodes;
mod state;

pub use inodes::{InodeDb, InodeRow, ROOT_ID};
pub use state::{EphemeralStore, MemoryStore, Process, ProcessState, RedisStore};

use std::sync::Arc;

use tracing::*;

use crate::error::Error;
use crate::info::NodeKind;
use crate::inode::Inode;
use crate::registry::CacheRegistry;
use crate::remote::RemoteIo;
use crate::utils::exponential_sleep;

pub const KEY_SYNC_PID: &str = "sync_pid";
pub const KEY_SYNC_HOST: &str = "sync_host";
pub const KEY_SYNC_AGAIN: &str = "sync_again";
pub const KEY_LAST_WRITTEN: &str = "last_written";

/// Number of retries in state reconciliation waits.
const STATE_RETRIES: u32 = 15;

/// Result of the three-way inode resolution.
pub struct Resolution {
    /// The open in-process inode, when the registry had it.
    pub open: Option<Inode>,
    /// The durable identity, when known. `None` only on a registry hit,
    /// where the database lookup was cancelled.
    pub id: Option<i64>,
}

pub struct Delta {
    pub db: Arc<InodeDb>,
    store: Arc<dyn EphemeralStore>,
}

impl Delta {
    pub fn new(db: Arc<InodeDb>, store: Arc<dyn EphemeralStore>) -> Self {
        Self { db, store }
    }

    fn key(inode: i64, name: &str) -> String {
        format!("{}:{}", inode, name)
    }

    /// Value of an ephemeral key on an inode, or `None` when missing or on
    /// store error (errors are logged, not propagated, so a flaky store
    /// degrades to a cache miss).
    pub async fn get_value(&self, inode: i64, name: &str) -> Option<String> {
        match self.store.get(&Self::key(inode, name)).await {
            Ok(value) => value,
            Err(e) => {
                error!(inode, name, "Error getting ephemeral value: {}", e);
                None
            }
        }
    }

    /// Set an ephemeral key. With `expected`, the write is a compare-and-set
    /// and succeeds only when the stored value matched. Either way, the
    /// result is confirmed with a follow-up read: `true` means the store now
    /// holds `value`.
    pub async fn set_value(
        &self,
        inode: i64,
        name: &str,
        value: &str,
        expected: Option<&str>,
    ) -> bool {
        let key = Self::key(inode, name);
        let written = match expected {
            Some(expected) => self.store.set_if_equals(&key, expected, value).await,
            None => self.store.set(&key, value).await.map(|_| true),
        };
        match written {
            Ok(true) => self.get_value(inode, name).await.as_deref() == Some(value),
            Ok(false) => false,
            Err(e) => {
                error!(inode, name, value, "Error setting ephemeral value: {}", e);
                false
            }
        }
    }

    pub async fn get_state(&self, inode: i64, process: Process) -> Option<ProcessState> {
        let raw = self.get_value(inode, process.as_str()).await?;
        match raw.parse::<i64>().ok().map(ProcessState::try_from) {
            Some(Ok(state)) => Some(state),
            _ => {
                error!(inode, process = process.as_str(), %raw, "Invalid process state");
                None
            }
        }
    }

    /// Set the state of a process on an inode. Passing `expected` makes the
    /// transition conditional on the current state.
    pub async fn set_state(
        &self,
        inode: i64,
        process: Process,
        state: ProcessState,
        expected: Option<ProcessState>,
    ) -> bool {
        let value = (state as u8).to_string();
        let expected = expected.map(|s| (s as u8).to_string());
        self.set_value(inode, process.as_str(), &value, expected.as_deref())
            .await
    }

    /// Wait until a process reaches `state`, with exponential backoff.
    pub async fn wait_for_state(
        &self,
        inode: i64,
        process: Process,
        state: ProcessState,
    ) -> bool {
        for i in 0..STATE_RETRIES {
            if self.get_state(inode, process).await == Some(state) {
                return true;
            }
            exponential_sleep(i).await;
        }
        false
    }

    /// Whether this inode's process states exist in the store. All three
    /// missing means the inode has not been initialized (a single missing
    /// state might just be a store hiccup).
    pub async fn states_initialized(&self, inode: i64) -> bool {
        for p in [Process::Read, Process::Write, Process::Sync] {
            if self.get_state(inode, p).await.is_some() {
                return true;
            }
        }
        false
    }

    pub async fn init_states(&self, inode: i64) {
        for p in [Process::Read, Process::Write, Process::Sync] {
            self.set_state(inode, p, ProcessState::Idle, None).await;
        }
    }

    pub async fn init_ephemerals(&self, inode: i64) {
        self.set_value(inode, KEY_SYNC_PID, "", None).await;
        self.set_value(inode, KEY_SYNC_HOST, "", None).await;
        self.set_value(inode, KEY_SYNC_AGAIN, "false", None).await;
        self.set_value(inode, KEY_LAST_WRITTEN, "", None).await;
    }

    pub async fn sync_again(&self, inode: i64) -> bool {
        self.get_value(inode, KEY_SYNC_AGAIN).await.as_deref() == Some("true")
    }

    /// Resolve a upath three ways at once: the in-process registry, the
    /// durable identity table, and the remote authority. A registry hit
    /// short-circuits the database lookup; a database hit cancels the remote
    /// fetch; a remote hit without a database row creates the row. All three
    /// missing means the path does not exist.
    pub async fn resolve(
        &self,
        registry: &CacheRegistry,
        remote: Arc<dyn RemoteIo>,
        upath: &str,
    ) -> Result<Resolution, Error> {
        let db_task = tokio::task::spawn_blocking({
            let db = self.db.clone();
            let upath = upath.to_owned();
            move || db.resolve(&upath)
        });
        let remote_task = tokio::spawn({
            let remote = remote.clone();
            let upath = upath.to_owned();
            async move { remote.get_info(&upath, false).await }
        });

        if let Some(open) = registry.get_open(upath).await {
            debug!(upath, "Cache lookup succeeded; cancelling database lookup");
            db_task.abort();
            remote_task.abort();
            return Ok(Resolution {
                open: Some(open),
                id: None,
            });
        }

        if let Some(id) = db_task.await.unwrap_or(Ok(None)).map_err(Error::from)? {
            debug!(upath, id, "Database lookup succeeded; cancelling authority lookup");
            remote_task.abort();
            self.db.touch(id)?;
            return Ok(Resolution {
                open: None,
                id: Some(id),
            });
        }

        match remote_task.await.unwrap_or(Err(Error::NotFound)) {
            Ok(info) => {
                let kind = match info.kind() {
                    NodeKind::File => "filenode",
                    NodeKind::Dir => "dirnode",
                };
                let id = self.db.create_path(upath, kind)?;
                Ok(Resolution {
                    open: None,
                    id: Some(id),
                })
            }
            Err(_) => Err(Error::NotFound),
        }
    }

    /// Durable kind of an inode, for reconstructing the right inode type.
    pub fn kind_of(&self, row: &InodeRow) -> Result<NodeKind, Error> {
        match row.kind.as_str() {
            "filenode" | "file" => Ok(NodeKind::File),
            "dirnode" => Ok(NodeKind::Dir),
            _ => Err(Error::InvalidMetadata),
        }
    }
}
