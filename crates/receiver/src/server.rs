//! TLS listener and connection admission.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use castellan_protocol::config::ReceiverConfig;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::connection;
use crate::device::{ConnId, Device};
use crate::manifest::Manifest;
use crate::relay::RelayClient;
use crate::tls;

/// TLS handshake timeout per connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// Bind the listener and start accepting cast connections.
pub async fn start(
    device: Arc<Device>,
    manifest: Arc<Manifest>,
    config: &ReceiverConfig,
    relay: Option<Arc<RelayClient>>,
) -> Result<Server> {
    let tls_config = tls::server_config(&manifest)?;
    let acceptor = tls::make_acceptor(tls_config);

    let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    let local_addr = listener.local_addr().context("listener has no address")?;
    tracing::info!(%local_addr, "listening for cast connections");

    let closed = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(accept_loop(
        device,
        listener,
        acceptor,
        manifest,
        config.client_prefix.clone(),
        relay,
        Arc::clone(&shutdown),
    ));

    Ok(Server {
        local_addr,
        closed,
        shutdown,
    })
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Close the listener. Connections already accepted keep running until
    /// their peers hang up.
    pub fn stop_listening(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
            tracing::info!("stopped listening");
        }
    }
}

async fn accept_loop(
    device: Arc<Device>,
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    manifest: Arc<Manifest>,
    client_prefix: Option<String>,
    relay: Option<Arc<RelayClient>>,
    shutdown: Arc<Notify>,
) {
    let mut next_client_id: ConnId = 0;
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("failed to accept connection: {e}");
                        continue;
                    }
                };

                if let Some(prefix) = &client_prefix {
                    if !peer.to_string().starts_with(prefix.as_str()) {
                        tracing::debug!(%peer, "ignoring connection outside client prefix");
                        continue;
                    }
                }

                let id = next_client_id;
                next_client_id += 1;
                tracing::info!(%peer, client = id, "accepted connection");

                let device = Arc::clone(&device);
                let manifest = Arc::clone(&manifest);
                let relay = relay.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        HANDSHAKE_TIMEOUT,
                        acceptor.accept(stream),
                    )
                    .await
                    {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer, "TLS handshake timed out");
                            return;
                        }
                    };
                    connection::spawn(device, tls_stream, id, manifest, relay);
                });
            }
        }
    }
    tracing::debug!("accept loop finished");
}
