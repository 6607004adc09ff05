mod advertise;
mod auth;
mod config;
mod connection;
mod decrypt;
mod device;
mod manifest;
mod media;
mod receiver;
mod relay;
mod server;
mod session;
mod stream;
mod tls;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;

use crate::device::Device;
use crate::manifest::Manifest;
use crate::media::{NullDecoder, VideoDecoder};
use crate::relay::RelayClient;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/castellan.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

/// Try the configured manifest sources in order: explicit file, day-keyed
/// directory, certificate service.
fn resolve_manifest(config: &castellan_protocol::config::ManifestConfig) -> Result<Manifest> {
    if let Some(path) = &config.path {
        tracing::info!("reading manifest from {path}");
        match Manifest::read(Path::new(path), config.fix_newlines) {
            Ok(manifest) => return Ok(manifest),
            Err(e) => tracing::warn!("failed to read manifest from {path}: {e}"),
        }
    }

    if let Some(dir) = &config.dir {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let path = manifest::cert_manifest_path(Path::new(dir), &now)
            .context("failed to build manifest path")?;
        tracing::info!("reading manifest from {}", path.display());
        match Manifest::read(&path, config.fix_newlines) {
            Ok(manifest) => return Ok(manifest),
            Err(e) => tracing::warn!("failed to read manifest from {}: {e}", path.display()),
        }
    }

    if let Some(url) = &config.service_url {
        // Downloading is delegated to an external fetcher; print the probe
        // URL it should use and the path to drop the result at.
        let salt = config.service_salt.as_deref().unwrap_or_default();
        tracing::info!(
            "manifest service configured; fetch {} and point manifest.path at the result",
            manifest::probe_url(url, salt)
        );
    }

    bail!("no certificate manifest could be loaded; set manifest.path or manifest.dir")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();
    let mut config = config::load_config(&config_path)?;
    if let Some(port) = port_override {
        config.receiver.port = port;
    }

    let manifest = Arc::new(resolve_manifest(&config.manifest)?);

    let decoder: Arc<dyn VideoDecoder> = Arc::new(NullDecoder);
    let (device, mut frames) = Device::new(
        &config.receiver.device_model,
        &config.receiver.friendly_name,
        decoder,
    );

    // Frame sink stand-in: a renderer would consume this channel.
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            tracing::info!(
                frame.frame_id,
                width = frame.width,
                height = frame.height,
                bytes = frame.rgba.len(),
                "frame ready for sink"
            );
        }
    });

    let relay = match &config.relay.host {
        Some(host) => {
            tracing::info!(%host, port = config.relay.port, "running in relay mode");
            Some(
                RelayClient::connect(host, config.relay.port, config.relay.auth_challenge)
                    .await
                    .context("failed to reach relay target")?,
            )
        }
        None => None,
    };

    let server = server::start(
        Arc::clone(&device),
        Arc::clone(&manifest),
        &config.receiver,
        relay,
    )
    .await?;

    let advertisement = if config.receiver.enable_mdns {
        match advertise::start(&device, server.port()) {
            Ok(advertisement) => Some(advertisement),
            Err(e) => {
                tracing::error!("failed to advertise receiver: {e:#}");
                None
            }
        }
    } else {
        None
    };

    tracing::info!("===========================================");
    tracing::info!("  {} ({})", device.friendly_name, device.device_model);
    tracing::info!("  Cast channel on {}", server.local_addr());
    tracing::info!("===========================================");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    if let Some(advertisement) = advertisement {
        advertisement.stop();
    }
    server.stop_listening();

    // Stop sessions so their sockets and tasks wind down before exit.
    for status in device.session_statuses().await {
        session::shutdown(&device, &status.session_id).await;
    }

    tracing::info!("receiver shut down cleanly");
    Ok(())
}
