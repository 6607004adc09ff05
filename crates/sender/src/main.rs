mod client;

use anyhow::{Context, Result, bail};
use castellan_protocol::messages::APP_CHROME_MIRRORING;
use tracing_subscriber::EnvFilter;

use crate::client::SenderClient;

struct Args {
    host: String,
    port: u16,
    app_id: String,
    auth_challenge: bool,
    offer: bool,
}

fn parse_args() -> Result<Args> {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        host: String::new(),
        port: 8009,
        app_id: APP_CHROME_MIRRORING.to_string(),
        auth_challenge: false,
        offer: true,
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--host" => {
                if i + 1 < argv.len() {
                    args.host = argv[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < argv.len() {
                    args.port = argv[i + 1].parse().context("invalid --port")?;
                    i += 1;
                }
            }
            "--app-id" => {
                if i + 1 < argv.len() {
                    args.app_id = argv[i + 1].clone();
                    i += 1;
                }
            }
            "--auth-challenge" => args.auth_challenge = true,
            "--no-offer" => args.offer = false,
            other => bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    if args.host.is_empty() {
        bail!("usage: castellan-sender --host <receiver> [--port 8009] [--app-id ID] [--auth-challenge] [--no-offer]");
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    let mut client = SenderClient::connect(&args.host, args.port).await?;

    if args.auth_challenge {
        client.send_auth_challenge()?;
        let reply = client.wait_for_auth_response().await?;
        match reply.response {
            Some(response) => tracing::info!(
                hash_algorithm = response.hash_algorithm.unwrap_or_default(),
                certificates = response.intermediate_certificate.len() + 1,
                "device auth response received"
            ),
            None => tracing::warn!("auth reply carried no response"),
        }
    }

    client.send_connect(castellan_protocol::channel::RECEIVER_ID)?;

    let status = client.request_status().await?;
    tracing::info!(
        applications = status.status.applications.len(),
        "receiver status"
    );

    let (session_id, transport_id) = client.launch(&args.app_id).await?;
    tracing::info!(%session_id, %transport_id, "application launched");

    if args.offer {
        let ssrc: u32 = rand::random::<u16>() as u32 + 1;
        let aes_key = hex::encode(rand::random::<[u8; 16]>());
        let aes_iv_mask = hex::encode(rand::random::<[u8; 16]>());
        let answer = client
            .offer_stream(&transport_id, ssrc, &aes_key, &aes_iv_mask)
            .await?;
        tracing::info!(
            udp_port = answer.udp_port,
            ssrcs = ?answer.ssrcs,
            "offer accepted"
        );
    }

    Ok(())
}
