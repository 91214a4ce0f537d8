//! Relay proxy between editor clients and a shared analysis backend.
//!
//! Every accepted client gets its own backend connection and its own private working copy of
//! the client's workspace. Messages are relayed with their original ids; `file://` locations are
//! rewritten between the client's root and the working copy.

mod provision;
mod session;
mod uri_map;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub use provision::{provision, ProvisionError, WorkingCopy};
pub use session::{relay_session, RelayOptions, SessionEnd};
pub use uri_map::UriMapper;

/// Bind the relay's client-facing listener.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind relay listener {addr}"))
}

/// Accept clients on `listener` until `shutdown_rx` turns `true`, relaying each one to a fresh
/// connection to `backend_addr`.
///
/// Sessions still running at shutdown are aborted; their working copies are removed on drop.
pub async fn serve_tcp(
    listener: TcpListener,
    backend_addr: String,
    options: RelayOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr().context("relay listener address")?;
    tracing::info!(
        target: "tessera.relay",
        listen = %local_addr,
        backend = %backend_addr,
        read_only = options.read_only,
        "relay listening"
    );

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            res = listener.accept() => {
                let (stream, peer_addr) = res.with_context(|| format!("accept tcp {local_addr}"))?;
                let backend_addr = backend_addr.clone();
                let options = options.clone();
                sessions.spawn(async move {
                    if let Err(err) = handle_new_connection(stream, peer_addr, &backend_addr, options).await {
                        tracing::warn!(
                            target: "tessera.relay",
                            peer = %peer_addr,
                            error = %format!("{err:#}"),
                            "failed to relay client connection"
                        );
                    }
                });
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::error!(target: "tessera.relay", error = %err, "relay session panicked");
                    }
                }
            }
        }
    }

    tracing::info!(target: "tessera.relay", sessions = sessions.len(), "relay shutting down");
    sessions.shutdown().await;
    Ok(())
}

async fn handle_new_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    backend_addr: &str,
    options: RelayOptions,
) -> Result<()> {
    let _ = client.set_nodelay(true);
    let backend = TcpStream::connect(backend_addr)
        .await
        .with_context(|| format!("connect to backend {backend_addr}"))?;
    let _ = backend.set_nodelay(true);

    tracing::info!(target: "tessera.relay", peer = %peer_addr, backend = %backend_addr, "relay session started");
    relay_session(client, backend, options).await;
    Ok(())
}
