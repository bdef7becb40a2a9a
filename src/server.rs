//! Top-level server wiring for the `serve` command: owns every long-lived
//! subsystem and drives them until shutdown.
//!
//! Mirrors the single `tauri::Builder` wiring pass a Tauri `lib.rs` does
//! (one place constructs every managed subsystem and hands it to the
//! runtime) — here that's a plain async function instead of a builder,
//! since there is no plugin/webview layer to register against.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use crate::config::Config;
use crate::error::Result;
use crate::ipc::{IpcServer, PushRouter};
use crate::persistence::Store;
use crate::process::ProcessSupervisor;
use crate::scheduler::{FrameScheduler, Renderer};
use crate::session::SessionManager;

/// Runs the server until SIGINT/SIGTERM, then shuts down cleanly (spec §6,
/// exit code `0`).
pub async fn run(config: Config) -> Result<()> {
    log::info!("starting prise server (pid {})", std::process::id());

    let store = Arc::new(Store::new(
        config.sessions_dir.clone(),
        config.lock_path.clone(),
        config.most_recent_pointer.clone(),
    )?);
    let session_manager = Arc::new(SessionManager::new(Arc::clone(&store)));
    session_manager.load_all()?;

    let scheduler = FrameScheduler::new(config.frame_interval_ms);
    let router = PushRouter::new(Arc::clone(&session_manager));
    let renderer: Arc<dyn Renderer> = router.clone();

    let (exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = ProcessSupervisor::new(Arc::clone(&scheduler), renderer, config.shell.clone(), exit_tx);
    router.bind_supervisor(Arc::clone(&supervisor));

    let ipc = Arc::new(IpcServer::new(
        config.socket_path.clone(),
        Arc::clone(&session_manager),
        Arc::clone(&supervisor),
        router,
    ));
    let listener = ipc.bind()?;
    log::info!("listening on {}", config.socket_path.display());

    let server_task = tokio::spawn(Arc::clone(&ipc).run(listener, exit_rx));
    let debounce_task = tokio::spawn(debounce_flush_loop(Arc::clone(&session_manager)));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, exiting");

    server_task.abort();
    debounce_task.abort();
    session_manager.flush_debounced().await?;
    Ok(())
}

/// Periodically flushes any session whose debounced `resize_split` write
/// (spec §4.4) has been dirty past its deadline.
async fn debounce_flush_loop(session_manager: Arc<SessionManager>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(crate::config::DEBOUNCE_MS));
    loop {
        ticker.tick().await;
        if let Err(e) = session_manager.flush_debounced().await {
            log::warn!("debounced persistence flush failed: {e}");
        }
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}
