//! Out-of-band sync workers.
//!
//! Syncs run in a separate OS process so they survive the request that
//! triggered them; all coordination goes through the durable and ephemeral
//! stores, never through in-process memory. Upstream pushes run at the
//! lowest scheduling priority; downstream pulls at normal priority.
//!
//! These workers run on demand. They do not poll the remote for changes,
//! so the remote cannot be used to synchronize data across regions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::*;

use crate::delta::{
    Delta, Process, ProcessState, KEY_LAST_WRITTEN, KEY_SYNC_AGAIN, KEY_SYNC_HOST, KEY_SYNC_PID,
};
use crate::error::{Error, StateError};
use crate::inode::Inode;
use crate::registry::CacheRegistry;
use crate::remote::RemoteIo;

/// Seconds the upstream worker waits for the spawner to record its pid.
const STARTUP_POLL_SECS: u64 = 300;

/// Everything a worker needs to act on an inode.
pub struct SyncContext {
    pub registry: Arc<CacheRegistry>,
    pub remote: Arc<dyn RemoteIo>,
    pub delta: Arc<Delta>,
}

/// How to start a `truckeefs-sync` child process: the binary and its
/// configuration arguments (mode and inode id are appended per spawn).
#[derive(Clone, Debug)]
pub struct WorkerSpawn {
    pub program: PathBuf,
    pub args: Vec<String>,
}

fn identity() -> (String, String) {
    (
        std::process::id().to_string(),
        gethostname::gethostname().to_string_lossy().into_owned(),
    )
}

async fn load_inode(ctx: &SyncContext, inode_id: i64) -> Result<Inode, Error> {
    let row = ctx.delta.db.get(inode_id)?;
    let kind = ctx.delta.kind_of(&row)?;
    let upath = ctx
        .delta
        .db
        .upath_of(inode_id)?
        .ok_or(Error::NotFound)?;
    let inode = ctx
        .registry
        .open_inode(&upath, kind, ctx.remote.as_ref())
        .await?;
    info!(inode_id, %upath, "Inode ready to sync");
    Ok(inode)
}

/// Release the ownership locks; the caller is expected to be the owner.
async fn complete_sync(ctx: &SyncContext, inode_id: i64, successful: bool) {
    let (pid, host) = identity();
    ctx.delta
        .set_value(inode_id, KEY_SYNC_PID, "", Some(&pid))
        .await;
    ctx.delta
        .set_value(inode_id, KEY_SYNC_HOST, "", Some(&host))
        .await;
    let state = if successful {
        ProcessState::Complete
    } else {
        ProcessState::Error
    };
    ctx.delta
        .set_state(inode_id, Process::Sync, state, None)
        .await;
    if successful {
        info!(inode_id, "Sync successful");
    } else {
        error!(inode_id, "Sync unsuccessful");
    }
}

/// Push an inode's dirty state to the remote.
///
/// Waits for the spawner to record this process as the sync owner, then
/// loops: push the frozen snapshot, and as long as `sync_again` indicates
/// writes arrived during the push, freeze and push once more. Any failure
/// releases the locks and propagates; there is no automatic retry — the
/// next mutation re-triggers a sync.
pub async fn upstream_sync_worker(
    ctx: &SyncContext,
    inode_id: i64,
    frozen: Option<serde_json::Value>,
) -> Result<(), Error> {
    let (pid, host) = identity();

    // Startup: wait until the spawner has recorded our ownership.
    for i in 0..STARTUP_POLL_SECS {
        let sync_pid = ctx.delta.get_value(inode_id, KEY_SYNC_PID).await;
        let sync_host = ctx.delta.get_value(inode_id, KEY_SYNC_HOST).await;
        let recorded = !sync_pid.as_deref().unwrap_or_default().is_empty()
            && !sync_host.as_deref().unwrap_or_default().is_empty();
        if !recorded {
            if i == STARTUP_POLL_SECS - 1 {
                error!(inode_id, "Sync process startup timed out");
                complete_sync(ctx, inode_id, false).await;
                return Err(StateError::StartupTimeout.into());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        } else if sync_pid.as_deref() != Some(pid.as_str())
            || sync_host.as_deref() != Some(host.as_str())
        {
            return Err(StateError::OwnershipConflict(format!(
                "sync already running as {}@{}",
                sync_pid.unwrap_or_default(),
                sync_host.unwrap_or_default()
            ))
            .into());
        } else {
            break;
        }
    }

    ctx.delta
        .set_state(inode_id, Process::Sync, ProcessState::Running, None)
        .await;
    match upstream_sync_loop(ctx, inode_id, frozen, &pid, &host).await {
        Ok(()) => {
            complete_sync(ctx, inode_id, true).await;
            Ok(())
        }
        Err(e) => {
            error!(inode_id, "Error syncing: {}", e);
            complete_sync(ctx, inode_id, false).await;
            Err(e)
        }
    }
}

async fn upstream_sync_loop(
    ctx: &SyncContext,
    inode_id: i64,
    mut frozen: Option<serde_json::Value>,
    pid: &str,
    host: &str,
) -> Result<(), Error> {
    loop {
        let inode = load_inode(ctx, inode_id).await?;
        let step = async {
            // Did the data change while we were syncing? Checking here,
            // rather than spawning a fresh process per change, coalesces
            // the follow-ups into one more pass.
            if frozen.is_none() {
                if !ctx.delta.sync_again(inode_id).await {
                    info!(inode_id, "Nothing further to sync");
                    return Ok(false);
                }
                frozen = Some(inode.freeze().await);
            }

            ctx.delta
                .set_value(inode_id, KEY_SYNC_AGAIN, "false", None)
                .await;
            // Refresh ownership; a failed swap means we were interrupted.
            if !ctx
                .delta
                .set_value(inode_id, KEY_SYNC_PID, pid, Some(pid))
                .await
                || !ctx
                    .delta
                    .set_value(inode_id, KEY_SYNC_HOST, host, Some(host))
                    .await
            {
                return Err(Error::State(StateError::OwnershipConflict(
                    "sync process was interrupted".into(),
                )));
            }

            inode.before_push_upstream().await?;
            inode.push_upstream(&ctx.registry, ctx.remote.as_ref()).await?;
            inode.after_push_upstream().await?;
            info!(inode_id, "Pushed upstream");
            frozen = None;
            Ok(true)
        }
        .await;
        ctx.registry.release_inode(&inode).await?;
        match step {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Pull the remote state of an inode into the local cache, refreshing its
/// `retrieved` timestamp on success.
pub async fn downstream_sync_worker(ctx: &SyncContext, inode_id: i64) -> Result<(), Error> {
    let inode = load_inode(ctx, inode_id).await?;
    let result = async {
        inode.before_pull_downstream().await?;
        inode.pull_downstream(ctx.remote.as_ref()).await?;
        inode.after_pull_downstream().await
    }
    .await;
    ctx.registry.release_inode(&inode).await?;
    match result {
        Ok(()) => {
            info!(inode_id, "Pulled downstream");
            Ok(())
        }
        Err(e) => {
            error!(inode_id, "Error syncing: {}", e);
            Err(e)
        }
    }
}

/// Hand a dirty inode to an out-of-band upstream worker.
///
/// If a live owner is already recorded, the write is coalesced by setting
/// `sync_again`; the running worker picks it up in its loop. Otherwise a
/// child process is spawned, and its `(pid, host)` recorded from-empty so
/// the child's startup poll can confirm ownership.
pub async fn schedule_upstream_sync(
    ctx: &SyncContext,
    spawn: &WorkerSpawn,
    inode_id: i64,
    frozen: serde_json::Value,
) -> Result<(), Error> {
    let sync_pid = ctx.delta.get_value(inode_id, KEY_SYNC_PID).await;
    let sync_host = ctx.delta.get_value(inode_id, KEY_SYNC_HOST).await;
    if sync_pid.is_none() && sync_host.is_none() {
        // Expired or never initialized; the from-empty swap below needs
        // the keys present
        ctx.delta.init_ephemerals(inode_id).await;
    }
    let sync_pid = sync_pid.unwrap_or_default();
    let sync_host = sync_host.unwrap_or_default();
    let (_, host) = identity();

    if !sync_pid.is_empty() && !sync_host.is_empty() {
        // A foreign host's worker is assumed alive until its TTL expires
        let mut alive = sync_host != host;
        if sync_host == host {
            if let Ok(pid) = sync_pid.parse::<i32>() {
                alive = unsafe { libc::kill(pid, 0) } == 0;
            }
        }
        if alive {
            info!(inode_id, %sync_pid, %sync_host, "Sync already running; coalescing");
            ctx.delta
                .set_value(inode_id, KEY_SYNC_AGAIN, "true", None)
                .await;
            return Ok(());
        }
    }

    let now = crate::utils::unix_timestamp().to_string();
    ctx.delta
        .set_value(inode_id, KEY_LAST_WRITTEN, &now, None)
        .await;

    let child = tokio::process::Command::new(&spawn.program)
        .args(&spawn.args)
        .arg("upstream")
        .arg("--inode-id")
        .arg(inode_id.to_string())
        .arg("--frozen")
        .arg(frozen.to_string())
        .spawn()?;
    let pid = child
        .id()
        .ok_or(Error::Invalid("sync worker exited prematurely"))?;

    // The child waits for these records before doing any work
    ctx.delta
        .set_value(inode_id, KEY_SYNC_PID, &pid.to_string(), Some(""))
        .await;
    ctx.delta
        .set_value(inode_id, KEY_SYNC_HOST, &host, Some(""))
        .await;
    info!(inode_id, pid, "Spawned upstream sync worker");
    Ok(())
}
