//! Outbound client for relay mode.
//!
//! When a relay target is configured, every non-auth message from local
//! senders is proxied to another receiver over a single cast channel, and
//! everything the target says is fanned back out to the proxied
//! connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use castellan_protocol::channel::{
    AuthChallenge, CastMessage, DeviceAuthMessage, NS_DEVICE_AUTH, RECEIVER_ID, SENDER_ID,
};
use castellan_protocol::client;
use castellan_protocol::frame::CastChannel;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// Depth of the fan-out queue towards proxied connections.
const FANOUT_DEPTH: usize = 64;

pub struct RelayClient {
    outbound: tokio::sync::mpsc::UnboundedSender<CastMessage>,
    incoming: broadcast::Sender<CastMessage>,
}

impl RelayClient {
    /// Dial the relay target and start pumping its messages.
    pub async fn connect(host: &str, port: u16, auth_challenge: bool) -> Result<Arc<Self>> {
        let channel = client::dial(host, port)
            .await
            .with_context(|| format!("failed to connect to relay target {host}:{port}"))?;
        tracing::info!(host, port, "connected to relay target");
        Ok(Self::from_channel(channel, auth_challenge))
    }

    /// Wrap an established stream; used by tests to skip TLS.
    #[allow(dead_code)]
    pub fn from_stream<S>(stream: S, auth_challenge: bool) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_channel(CastChannel::spawn(stream), auth_challenge)
    }

    fn from_channel(mut channel: CastChannel, auth_challenge: bool) -> Arc<Self> {
        if auth_challenge {
            let challenge = DeviceAuthMessage {
                challenge: Some(AuthChallenge::default()),
                response: None,
                error: None,
            };
            let message = CastMessage::binary(
                NS_DEVICE_AUTH,
                SENDER_ID,
                RECEIVER_ID,
                challenge.encode_to_vec(),
            );
            if channel.send(message).is_err() {
                tracing::warn!("failed to queue auth challenge for relay target");
            }
        }

        let outbound = channel.sender();
        let (incoming_tx, _) = broadcast::channel(FANOUT_DEPTH);
        let fanout = incoming_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = channel.recv().await {
                // No subscribers yet is fine; those messages are lost the
                // same way they would be with no proxied connections.
                let _ = fanout.send(message);
            }
            tracing::info!("relay target closed the channel");
        });

        Arc::new(Self {
            outbound,
            incoming: incoming_tx,
        })
    }

    /// Queue a message for the relay target.
    pub fn send(&self, message: CastMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Subscribe to everything the relay target sends.
    pub fn subscribe(&self) -> broadcast::Receiver<CastMessage> {
        self.incoming.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use castellan_protocol::channel::NS_RECEIVER;

    use super::*;

    #[tokio::test]
    async fn proxies_messages_both_ways() {
        let (near, far) = tokio::io::duplex(4096);
        let relay = RelayClient::from_stream(near, false);
        let mut target = CastChannel::spawn(far);
        let mut incoming = relay.subscribe();

        assert!(relay.send(CastMessage::utf8(
            NS_RECEIVER,
            SENDER_ID,
            RECEIVER_ID,
            r#"{"type":"GET_STATUS","requestId":1}"#.to_string(),
        )));
        let at_target = tokio::time::timeout(Duration::from_secs(1), target.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_target.namespace, NS_RECEIVER);

        target
            .send(CastMessage::utf8(
                NS_RECEIVER,
                RECEIVER_ID,
                SENDER_ID,
                r#"{"type":"RECEIVER_STATUS"}"#.to_string(),
            ))
            .unwrap();
        let back = tokio::time::timeout(Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.source_id, RECEIVER_ID);
    }

    #[tokio::test]
    async fn sends_auth_challenge_on_connect() {
        let (near, far) = tokio::io::duplex(4096);
        let _relay = RelayClient::from_stream(near, true);
        let mut target = CastChannel::spawn(far);

        let challenge = tokio::time::timeout(Duration::from_secs(1), target.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(challenge.namespace, NS_DEVICE_AUTH);
        let decoded =
            DeviceAuthMessage::decode(challenge.payload_binary.unwrap().as_slice()).unwrap();
        assert!(decoded.challenge.is_some());
    }
}
