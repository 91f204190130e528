use std::sync::Arc;

use anyhow::Context;
use taskboard::{AppConfig, BoardRepo, CardRepo, CloudMirror, FsKv, HybridWorkspaces, ListRepo, SharedKv};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = AppConfig::from_env();
    info!("Bootstrapping taskboard (data dir {})", cfg.data_dir.display());

    let kv: SharedKv = Arc::new(FsKv::new(cfg.data_dir.clone()));
    let mirror = CloudMirror::from_config(cfg.cloud.as_ref());
    let mut hub = HybridWorkspaces::new(kv, mirror);

    if hub.mirror().is_enabled() {
        info!("Cloud reachable: {}", hub.is_cloud_available().await);
    }

    let ws = match hub.current_workspace() {
        Some(ws) => ws,
        None => hub.create_workspace("Personal", None).await.context("creating default workspace")?,
    };

    if let Err(e) = hub.open_workspace(&ws) {
        if !e.needs_reset() {
            return Err(e).context("opening workspace");
        }
        warn!("workspace {} unreadable ({e}); starting fresh", ws.id);
        hub.reset_workspace(&ws).context("resetting workspace")?;
    }
    let session = hub.session()?;

    println!("Workspace {} [{}] ({:?})", session.workspace().name, session.workspace().key, hub.link_state(&ws.id));
    for board in session.boards()? {
        println!("{} (#{})", board.name, board.id);
        for list in session.lists_by_board(board.id)? {
            println!("  {} [{}]", list.name, list.position);
            for card in session.cards_by_list(list.id)? {
                println!("    - {}", card.title);
            }
        }
    }

    if hub.mirror().is_enabled() {
        let synced = hub.sync_all_workspaces().await;
        info!("Synced {synced} workspace(s) to the cloud");
    }
    Ok(())
}
