//! Per-connection dispatcher.
//!
//! Each accepted TLS stream gets a cast channel and a dispatch loop.
//! Device auth is answered locally; CONNECT records subscriptions on the
//! hub; everything else is routed to the transport named by its
//! destination id, or — in relay mode — proxied verbatim to the relay
//! target.

use std::sync::Arc;

use castellan_protocol::channel::{
    CastMessage, NS_CONNECTION, NS_DEVICE_AUTH, RECEIVER_ID, SENDER_ID,
};
use castellan_protocol::frame::CastChannel;
use castellan_protocol::messages::ConnectionMessage;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth;
use crate::device::{ConnId, Device};
use crate::manifest::Manifest;
use crate::receiver;
use crate::relay::RelayClient;

pub fn spawn<S>(
    device: Arc<Device>,
    stream: S,
    id: ConnId,
    manifest: Arc<Manifest>,
    relay: Option<Arc<RelayClient>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(run(device, stream, id, manifest, relay));
}

async fn run<S>(
    device: Arc<Device>,
    stream: S,
    id: ConnId,
    manifest: Arc<Manifest>,
    relay: Option<Arc<RelayClient>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut channel = CastChannel::spawn(stream);
    device.register_connection(id, channel.sender()).await;

    if relay.is_none() {
        // Normal mode: this connection talks to the local receiver.
        receiver::ensure_registered(&device).await;
        device.register_subscription(id, SENDER_ID, RECEIVER_ID).await;
    } else if let Some(relay) = relay.clone() {
        // Relay mode: pipe the target's responses back onto this
        // connection.
        let back = channel.sender();
        let mut incoming = relay.subscribe();
        tokio::spawn(async move {
            while let Ok(message) = incoming.recv().await {
                if back.send(message).is_err() {
                    break;
                }
            }
        });
    }

    let mut connected = false;
    while let Some(message) = channel.recv().await {
        tracing::debug!(conn = id, namespace = %message.namespace, "received message");

        if message.namespace == NS_DEVICE_AUTH {
            // Device auth is always answered locally, relay mode included.
            match auth::handle_challenge(&message, &manifest) {
                Ok(Some(reply)) => {
                    if channel.send(reply).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(conn = id, "dropping bad auth message: {e:#}"),
            }
            continue;
        }

        if let Some(relay) = relay.as_deref() {
            if !relay.send(message) {
                tracing::warn!(conn = id, "relay target is gone, dropping message");
            }
            continue;
        }

        if message.namespace == NS_CONNECTION {
            handle_connection_message(&device, id, &message, &mut connected).await;
            continue;
        }

        let destination = message.destination_id.clone();
        if !device.forward(message).await {
            tracing::warn!(
                conn = id,
                %destination,
                "no transport for destination, dropping message"
            );
        }
    }

    device.remove_connection(id).await;
    tracing::info!(conn = id, "connection closed");
}

async fn handle_connection_message(
    device: &Device,
    id: ConnId,
    message: &CastMessage,
    connected: &mut bool,
) {
    let Some(payload) = message.payload_utf8.as_deref() else {
        return;
    };
    match serde_json::from_str::<ConnectionMessage>(payload) {
        Ok(ConnectionMessage::Connect { conn_type }) => {
            if !*connected {
                *connected = true;
                tracing::info!(conn = id, "virtual connection established");
            }
            tracing::debug!(
                conn = id,
                ?conn_type,
                source = %message.source_id,
                destination = %message.destination_id,
                "connect"
            );
            device
                .register_subscription(id, &message.source_id, &message.destination_id)
                .await;
        }
        Ok(ConnectionMessage::Close) => {
            tracing::debug!(conn = id, "virtual connection close");
        }
        Err(e) => {
            tracing::warn!(conn = id, "failed to parse connection message: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use castellan_protocol::channel::{NS_HEARTBEAT, NS_RECEIVER, NS_WEBRTC};
    use castellan_protocol::messages::{ReceiverStatusMessage, WebRtcMessage};

    use crate::media::NullDecoder;

    use super::*;

    fn dummy_manifest() -> Arc<Manifest> {
        Arc::new(Manifest {
            peer_cert: String::new(),
            peer_key: String::new(),
            device_cert: String::new(),
            intermediate_ca: String::new(),
            signature: String::new(),
        })
    }

    async fn connected_sender() -> (Arc<Device>, CastChannel) {
        let (device, _frames) = Device::new("test", "Test", Arc::new(NullDecoder));
        let (near, far) = tokio::io::duplex(8192);
        spawn(Arc::clone(&device), near, 1, dummy_manifest(), None);
        let mut sender = CastChannel::spawn(far);
        sender
            .send(CastMessage::utf8(
                NS_CONNECTION,
                SENDER_ID,
                RECEIVER_ID,
                r#"{"type":"CONNECT","connType":0}"#.to_string(),
            ))
            .unwrap();
        (device, sender)
    }

    async fn recv(channel: &mut CastChannel) -> CastMessage {
        tokio::time::timeout(Duration::from_secs(2), channel.recv())
            .await
            .expect("timed out waiting for message")
            .unwrap()
    }

    #[tokio::test]
    async fn ping_pong_end_to_end() {
        let (_device, mut sender) = connected_sender().await;

        sender
            .send(CastMessage::utf8(
                NS_HEARTBEAT,
                SENDER_ID,
                RECEIVER_ID,
                r#"{"type":"PING"}"#.to_string(),
            ))
            .unwrap();

        let pong = recv(&mut sender).await;
        assert_eq!(pong.namespace, NS_HEARTBEAT);
        assert_eq!(pong.payload_utf8.as_deref(), Some(r#"{"type":"PONG"}"#));
        assert_eq!(pong.source_id, RECEIVER_ID);
        assert_eq!(pong.destination_id, SENDER_ID);
    }

    #[tokio::test]
    async fn launch_then_offer_against_session_transport() {
        let (_device, mut sender) = connected_sender().await;

        sender
            .send(CastMessage::utf8(
                NS_RECEIVER,
                SENDER_ID,
                RECEIVER_ID,
                r#"{"type":"LAUNCH","appId":"0F5096E8","requestId":1}"#.to_string(),
            ))
            .unwrap();

        let status = recv(&mut sender).await;
        let status: ReceiverStatusMessage =
            serde_json::from_str(status.payload_utf8.as_deref().unwrap()).unwrap();
        let transport_id = status.status.applications[0].transport_id.clone();
        assert_eq!(transport_id, "pid-1");

        // Connect to the session transport, then offer a stream.
        sender
            .send(CastMessage::utf8(
                NS_CONNECTION,
                SENDER_ID,
                &transport_id,
                r#"{"type":"CONNECT","connType":0}"#.to_string(),
            ))
            .unwrap();
        sender
            .send(CastMessage::utf8(
                NS_WEBRTC,
                SENDER_ID,
                &transport_id,
                r#"{"seqNum":7,"type":"OFFER","offer":{"castMode":"mirroring","receiverGetStatus":true,"supportedStreams":[{"type":"video_source","index":0,"ssrc":12345,"aesKey":"00112233445566778899aabbccddeeff","aesIvMask":"0f1e2d3c4b5a69788796a5b4c3d2e1f0"}]}}"#.to_string(),
            ))
            .unwrap();

        let answer = recv(&mut sender).await;
        assert_eq!(answer.namespace, NS_WEBRTC);
        assert_eq!(answer.source_id, transport_id);
        let parsed: WebRtcMessage =
            serde_json::from_str(answer.payload_utf8.as_deref().unwrap()).unwrap();
        match parsed {
            WebRtcMessage::Answer {
                seq_num,
                result,
                answer,
            } => {
                assert_eq!(seq_num, 7);
                assert_eq!(result, "ok");
                assert_eq!(answer.ssrcs, vec![12345]);
                assert_eq!(answer.send_indexes, vec![0]);
                assert!(answer.udp_port > 0);
            }
            other => panic!("expected ANSWER, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unroutable_message_is_dropped_quietly() {
        let (_device, mut sender) = connected_sender().await;

        sender
            .send(CastMessage::utf8(
                NS_WEBRTC,
                SENDER_ID,
                "pid-42",
                r#"{"seqNum":1,"type":"OFFER","offer":{}}"#.to_string(),
            ))
            .unwrap();

        // The connection stays healthy.
        sender
            .send(CastMessage::utf8(
                NS_HEARTBEAT,
                SENDER_ID,
                RECEIVER_ID,
                r#"{"type":"PING"}"#.to_string(),
            ))
            .unwrap();
        let pong = recv(&mut sender).await;
        assert_eq!(pong.payload_utf8.as_deref(), Some(r#"{"type":"PONG"}"#));
    }

    #[tokio::test]
    async fn relay_mode_proxies_instead_of_handling() {
        let (device, _frames) = Device::new("test", "Test", Arc::new(NullDecoder));

        let (relay_near, relay_far) = tokio::io::duplex(8192);
        let relay = RelayClient::from_stream(relay_near, false);
        let mut target = CastChannel::spawn(relay_far);

        let (near, far) = tokio::io::duplex(8192);
        spawn(Arc::clone(&device), near, 7, dummy_manifest(), Some(relay));
        let mut sender = CastChannel::spawn(far);

        // A receiver-namespace message is not handled locally; it shows up
        // at the relay target.
        sender
            .send(CastMessage::utf8(
                NS_RECEIVER,
                SENDER_ID,
                RECEIVER_ID,
                r#"{"type":"GET_STATUS","requestId":1}"#.to_string(),
            ))
            .unwrap();
        let proxied = recv(&mut target).await;
        assert_eq!(
            proxied.payload_utf8.as_deref(),
            Some(r#"{"type":"GET_STATUS","requestId":1}"#)
        );

        // And the target's reply lands back on the sender connection.
        target
            .send(CastMessage::utf8(
                NS_RECEIVER,
                RECEIVER_ID,
                SENDER_ID,
                r#"{"type":"RECEIVER_STATUS","requestId":1}"#.to_string(),
            ))
            .unwrap();
        let reply = recv(&mut sender).await;
        assert_eq!(
            reply.payload_utf8.as_deref(),
            Some(r#"{"type":"RECEIVER_STATUS","requestId":1}"#)
        );

        // No local receiver transport was registered for relay mode.
        assert!(!device.has_transport(RECEIVER_ID).await);
    }
}
