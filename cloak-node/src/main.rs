//! Cloak node daemon: relay signaling, direct peer channels, durable chat
//! logs and parallel large-object transfer.

mod config;
mod cptp;
mod driver;
mod relay;
mod store;
mod transport;

use std::path::Path;

use anyhow::Context;
use cloak_core::identity::{PeerId, Profile};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use crate::driver::{Command, UiEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("cloak-node {VERSION}");
            return Ok(());
        }
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloak=info,warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let cfg = config::load();
    let (local_id, profile) = load_identity(&cfg.data_dir(), cfg.zero_trace).await?;
    info!(peer_id = %local_id, alias = %profile.alias, "starting cloak node");

    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("bind transport listener on port {}", cfg.listen_port))?;
    info!(addr = %listener.local_addr()?, relay = %cfg.relay_addr, "transport listening");

    let mut node = driver::spawn(cfg, local_id, profile, listener);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                let _ = node.commands.send(Command::Shutdown);
                break;
            }
            Some(event) = node.ui.recv() => log_event(event),
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    peer_id: PeerId,
    profile: Profile,
}

/// Load the persisted identity, or generate one. In no-trace mode the
/// identity is ephemeral and never written.
async fn load_identity(data_dir: &Path, zero_trace: bool) -> anyhow::Result<(PeerId, Profile)> {
    let path = data_dir.join("identity.json");
    if let Ok(bytes) = tokio::fs::read(&path).await {
        let stored: StoredIdentity =
            serde_json::from_slice(&bytes).context("parse identity file")?;
        return Ok((stored.peer_id, stored.profile));
    }
    let peer_id = PeerId::generate();
    let profile = Profile::new("anonymous");
    if !zero_trace {
        tokio::fs::create_dir_all(data_dir).await?;
        let stored = StoredIdentity {
            peer_id: peer_id.clone(),
            profile: profile.clone(),
        };
        tokio::fs::write(&path, serde_json::to_vec_pretty(&stored)?).await?;
        info!(path = %path.display(), "generated new identity");
    }
    Ok((peer_id, profile))
}

fn log_event(event: UiEvent) {
    match event {
        UiEvent::ChannelOpen { peer } => info!(%peer, "channel open"),
        UiEvent::ChannelClosed { peer } => info!(%peer, "channel closed"),
        UiEvent::PeerOffline { peer } => info!(%peer, "peer offline"),
        UiEvent::RelayClosed => warn!("relay connection closed"),
        UiEvent::RelayRejected { message } => warn!(%message, "relay rejected the session"),
        UiEvent::MessageReceived { peer, message } => {
            info!(%peer, timestamp = message.timestamp, "message received")
        }
        UiEvent::TransferStarted {
            peer,
            file_name,
            file_size,
            ..
        } => info!(%peer, %file_name, file_size, "incoming transfer"),
        UiEvent::TransferComplete { peer, path, .. } => {
            info!(%peer, path = %path.display(), "transfer complete")
        }
        UiEvent::TransferSent { peer, .. } => info!(%peer, "transfer sent"),
        UiEvent::TransferFailed { reason, .. } => warn!(%reason, "transfer failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
