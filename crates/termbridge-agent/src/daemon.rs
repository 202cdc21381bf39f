//! Supervisor: wires the link, dispatcher and heartbeat to one root
//! cancellation token and drives orderly shutdown.

use crate::config::Config;
use crate::link::CloudLink;
use crate::{dispatch, heartbeat};
use libtermbridge::{system, Messenger, SessionManager};
use std::sync::Arc;
use termbridge_protocol::AgentEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(cfg: Config, version: &str) -> anyhow::Result<()> {
    info!(
        version,
        machine_id = %cfg.machine_id,
        machine_name = %cfg.machine_name,
        server = %cfg.server_url,
        os = system::os_ident(),
        "termbridge agent starting"
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let (link, channels) = CloudLink::new(&cfg, version);
    let messenger: Arc<dyn Messenger> = link.clone();
    let manager = Arc::new(SessionManager::new(Arc::clone(&messenger)));

    let link_task = tokio::spawn(Arc::clone(&link).run(cancel.clone()));
    let dispatch_task = tokio::spawn(dispatch::run(
        channels.inbound,
        Arc::clone(&manager),
        Arc::clone(&messenger),
        cancel.clone(),
    ));
    let heartbeat_task = tokio::spawn(heartbeat::run(
        Arc::clone(&messenger),
        cfg.machine_id.clone(),
        Arc::clone(&manager),
        cancel.clone(),
    ));
    let resync_task = tokio::spawn(resync_loop(
        channels.opened,
        Arc::clone(&manager),
        messenger,
        cancel.clone(),
    ));

    cancel.cancelled().await;

    info!("shutdown signal received, stopping all sessions");
    let stopping = Arc::clone(&manager);
    // stop_all blocks for up to its grace period.
    let _ = tokio::task::spawn_blocking(move || stopping.stop_all()).await;

    // The link drains its queue and sends the close frame before exiting.
    let _ = link_task.await;
    let _ = dispatch_task.await;
    let _ = heartbeat_task.await;
    let _ = resync_task.await;

    info!("termbridge agent stopped");
    Ok(())
}

/// After every reconnect the server has no memory of this agent's state;
/// tell it which sessions are still alive.
async fn resync_loop(
    mut opened: mpsc::Receiver<()>,
    manager: Arc<SessionManager>,
    link: Arc<dyn Messenger>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = opened.recv() => {
                if signal.is_none() {
                    return;
                }
                let event = AgentEvent::Resync {
                    session_ids: manager.snapshot_ids(),
                };
                match serde_json::to_value(&event) {
                    Ok(value) => {
                        if let Err(err) = link.send_json(value) {
                            warn!(%err, "resync send failed");
                        }
                    }
                    Err(err) => warn!(%err, "resync encode failed"),
                }
            }
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    warn!(%err, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
        cancel.cancel();
    });
}
