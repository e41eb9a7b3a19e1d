use std::process;

use clap::{Parser, Subcommand};
use tracing::*;

use truckeefs::sync::{downstream_sync_worker, upstream_sync_worker, SyncContext};
use truckeefs::{Options, TruckeeFs};

#[derive(Parser)]
#[clap(name = "truckeefs-sync")]
struct Flags {
    #[clap(flatten)]
    options: Options,
    #[clap(long, short)]
    debug: bool,
    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Push one inode's local changes to the remote, at low priority.
    Upstream {
        #[clap(long)]
        inode_id: i64,
        /// Frozen snapshot captured by the spawner, as JSON.
        #[clap(long)]
        frozen: Option<String>,
    },
    /// Refresh one inode's local cache from the remote.
    Downstream {
        #[clap(long)]
        inode_id: i64,
    },
}

async fn main_impl(args: Flags) -> anyhow::Result<()> {
    truckeefs::utils::setup_logger(args.debug)?;

    let fs = TruckeeFs::new(&args.options).await?;
    let ctx = SyncContext {
        registry: fs.registry.clone(),
        remote: fs.remote.clone(),
        delta: fs.delta.clone(),
    };

    match args.mode {
        Mode::Upstream { inode_id, frozen } => {
            // Background pushes must not compete with interactive work
            unsafe {
                libc::nice(19);
            }
            let frozen = frozen.as_deref().map(serde_json::from_str).transpose()?;
            info!(inode_id, "Starting upstream sync");
            upstream_sync_worker(&ctx, inode_id, frozen).await?;
        }
        Mode::Downstream { inode_id } => {
            info!(inode_id, "Starting downstream sync");
            downstream_sync_worker(&ctx, inode_id).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Flags::parse();
    if let Err(e) = main_impl(args).await {
        error!("{:?}", e);
        process::exit(1)
    }
}
