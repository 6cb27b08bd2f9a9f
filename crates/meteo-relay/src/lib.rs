pub mod doctor;
mod receivers;

pub use meteo_proto::Shutdown;
pub use receivers::{BroadcastReport, ReceiverId, ReceiverSet, Registration};

use anyhow::{Context, Result};
use meteo_proto::{read_frame, read_full, shutdown_requested, Role, ROLE_LEN};
use serde::Deserialize;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::io::AsyncReadExt;
use tokio::net::{tcp::OwnedReadHalf, TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_RECEIVERS: usize = 128;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// e.g. "0.0.0.0:8889"
    pub listen: String,
    /// Receivers beyond this are closed right after the handshake. Default 128.
    pub max_receivers: Option<usize>,
}

pub struct RelayServer {
    listener: TcpListener,
    receivers: Arc<ReceiverSet>,
}

impl RelayServer {
    pub async fn bind(cfg: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.listen)
            .await
            .with_context(|| format!("bind relay listener {}", cfg.listen))?;
        let cap = cfg.max_receivers.unwrap_or(DEFAULT_MAX_RECEIVERS);
        Ok(Self { listener, receivers: Arc::new(ReceiverSet::new(cap)) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn receivers(&self) -> Arc<ReceiverSet> {
        self.receivers.clone()
    }

    /// Accept connections until `shutdown` flips. A non-transient accept error is fatal.
    pub async fn serve(self, mut shutdown: Shutdown) -> Result<()> {
        info!(
            "relay: listening on {} (max {} receivers)",
            self.local_addr()?,
            self.receivers.capacity()
        );
        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!("relay: connection from {}", peer);
                    let receivers = self.receivers.clone();
                    tokio::spawn(handle_connection(stream, peer, receivers, shutdown.clone()));
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("relay: transient accept error: {}", e);
                }
                Err(e) => return Err(e).context("relay: accept failed"),
            }
        }
        info!("relay: shutting down");
        Ok(())
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted)
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    receivers: Arc<ReceiverSet>,
    shutdown: Shutdown,
) {
    let mut tag = [0u8; ROLE_LEN];
    match read_full(&mut stream, &mut tag).await {
        Ok(ROLE_LEN) => {}
        Ok(n) => {
            warn!("relay: {} closed during handshake ({} role bytes)", peer, n);
            return;
        }
        Err(e) => {
            warn!("relay: {} role read failed: {}", peer, e);
            return;
        }
    }

    // No Accept/Reject reply is sent; an unknown role is simply closed.
    match Role::client_role(tag) {
        Some(Role::Sender) => {
            info!("relay: {} is a sender", peer);
            sender_loop(stream, peer, receivers, shutdown).await;
        }
        Some(Role::Receiver) => {
            let (read_half, write_half) = stream.into_split();
            let Some(reg) = receivers.add(peer, write_half).await else { return };
            receiver_keepalive(read_half, peer, reg, receivers, shutdown).await;
        }
        _ => warn!("relay: {} unknown role {:02x}{:02x}, closed", peer, tag[0], tag[1]),
    }
}

/// Frames are broadcast in arrival order; bad frames are dropped without closing.
async fn sender_loop(
    mut stream: TcpStream,
    peer: SocketAddr,
    receivers: Arc<ReceiverSet>,
    mut shutdown: Shutdown,
) {
    let mut relayed = 0u64;
    let mut dropped = 0u64;
    loop {
        let res = tokio::select! {
            res = read_frame(&mut stream) => res,
            _ = shutdown_requested(&mut shutdown) => break,
        };
        match res {
            Ok(Some(raw)) => {
                let report = receivers.broadcast(&raw.bytes).await;
                relayed += 1;
                debug!(
                    "relay: node {} {} -> {} receivers ({} evicted)",
                    raw.frame.node_id, raw.frame.kind().label(), report.delivered, report.evicted
                );
            }
            Ok(None) => {
                info!("relay: sender {} closed", peer);
                break;
            }
            Err(e) if e.is_fatal() => {
                warn!("relay: sender {} failed: {}", peer, e);
                break;
            }
            Err(e) => {
                dropped += 1;
                debug!("relay: dropped frame from {}: {}", peer, e);
            }
        }
    }
    info!("relay: sender {} done (relayed={}, dropped={})", peer, relayed, dropped);
}

/// Receivers only listen; anything they send is discarded. Exits on close, reset or
/// eviction from the set, releasing the socket.
async fn receiver_keepalive(
    mut read_half: OwnedReadHalf,
    peer: SocketAddr,
    mut reg: Registration,
    receivers: Arc<ReceiverSet>,
    mut shutdown: Shutdown,
) {
    let mut scratch = [0u8; 8];
    loop {
        let res = tokio::select! {
            res = read_half.read(&mut scratch) => res,
            _ = &mut reg.evicted => {
                debug!("relay: receiver {} evicted, closing", peer);
                return;
            }
            _ = shutdown_requested(&mut shutdown) => break,
        };
        match res {
            Ok(0) => {
                info!("relay: connection closed by receiver {}", peer);
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                info!("relay: receiver {} reset: {}", peer, e);
                break;
            }
        }
    }
    receivers.remove(reg.id).await;
}
