//! A launched application instance.
//!
//! Each session owns an anonymous UDP socket and two tasks: a transport
//! task draining cast messages addressed to its `pid-<n>` id, and a UDP
//! reader feeding the media streams. A WebRTC OFFER creates one `Stream`
//! per accepted `video_source` entry; the ANSWER carries the bound port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use castellan_protocol::channel::{CastMessage, NS_DEBUG, NS_MEDIA, NS_REMOTING, NS_WEBRTC};
use castellan_protocol::messages::{Answer, Offer, STREAM_TYPE_VIDEO, WebRtcMessage};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, mpsc};
use util::marshal::Unmarshal;
use uuid::Uuid;

use crate::decrypt::Decrypter;
use crate::device::{Device, SessionEntry, TransportHandle};
use crate::stream::{PAYLOAD_TYPE_RTCP, PAYLOAD_TYPE_VIDEO, Stream};

/// Namespaces every session transport declares.
fn session_namespaces() -> Vec<String> {
    vec![
        NS_DEBUG.to_string(),
        NS_MEDIA.to_string(),
        NS_REMOTING.to_string(),
        NS_WEBRTC.to_string(),
    ]
}

type StreamMap = Arc<Mutex<HashMap<u32, Stream>>>;

/// Launch an application session. Binds the UDP socket, registers the
/// transport and records the session on the device. Returns the new
/// transport id.
pub async fn launch(device: Arc<Device>, app_id: &str, display_name: &str) -> Result<String> {
    let transport_id = device.next_transport_id().await;
    let session_id = Uuid::new_v4().to_string();

    let socket = Arc::new(
        UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind session udp socket")?,
    );
    let udp_port = socket
        .local_addr()
        .context("session udp socket has no local address")?
        .port();

    let stop = Arc::new(Notify::new());
    let stopping = Arc::new(AtomicBool::new(false));
    let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));

    let (tx, rx) = mpsc::unbounded_channel();
    device
        .register_transport(TransportHandle {
            id: transport_id.clone(),
            namespaces: session_namespaces(),
            tx,
        })
        .await;

    tokio::spawn(transport_task(
        Arc::clone(&device),
        transport_id.clone(),
        udp_port,
        Arc::clone(&streams),
        rx,
        Arc::clone(&stop),
    ));
    tokio::spawn(udp_task(
        Arc::clone(&device),
        session_id.clone(),
        Arc::clone(&socket),
        streams,
        Arc::clone(&stop),
        Arc::clone(&stopping),
    ));

    device
        .insert_session(SessionEntry {
            app_id: app_id.to_string(),
            display_name: display_name.to_string(),
            session_id: session_id.clone(),
            status_text: display_name.to_string(),
            transport_id: transport_id.clone(),
            udp_port,
            namespaces: session_namespaces(),
            stop,
            stopping,
        })
        .await;

    tracing::info!(%session_id, %transport_id, app_id, udp_port, "session launched");
    Ok(transport_id)
}

/// Stop a session: signal its tasks, drop the transport registration and
/// remove it from the session map. Returns false for an unknown id.
pub async fn shutdown(device: &Arc<Device>, session_id: &str) -> bool {
    let Some(entry) = device.remove_session(session_id).await else {
        return false;
    };
    entry.stopping.store(true, Ordering::SeqCst);
    entry.stop.notify_waiters();
    device.deregister_transport(&entry.transport_id).await;
    tracing::info!(%session_id, transport_id = %entry.transport_id, "session stopped");
    true
}

async fn transport_task(
    device: Arc<Device>,
    transport_id: String,
    udp_port: u16,
    streams: StreamMap,
    mut rx: mpsc::UnboundedReceiver<CastMessage>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                handle_message(&device, &transport_id, udp_port, &streams, message).await;
            }
        }
    }
    tracing::debug!(%transport_id, "session transport task finished");
}

async fn handle_message(
    device: &Arc<Device>,
    transport_id: &str,
    udp_port: u16,
    streams: &StreamMap,
    message: CastMessage,
) {
    match message.namespace.as_str() {
        NS_WEBRTC => {
            let Some(payload) = message.payload_utf8.as_deref() else {
                tracing::warn!("webrtc message without utf8 payload");
                return;
            };
            match serde_json::from_str::<WebRtcMessage>(payload) {
                Ok(WebRtcMessage::Offer { seq_num, offer }) => {
                    handle_offer(
                        device,
                        transport_id,
                        udp_port,
                        streams,
                        seq_num,
                        offer,
                        &message.source_id,
                    )
                    .await;
                }
                Ok(other) => {
                    tracing::debug!(?other, "ignoring webrtc message");
                }
                Err(e) => {
                    tracing::warn!("failed to parse webrtc message: {e}");
                }
            }
        }
        other => {
            tracing::debug!(namespace = other, "unhandled session message");
        }
    }
}

async fn handle_offer(
    device: &Arc<Device>,
    transport_id: &str,
    udp_port: u16,
    streams: &StreamMap,
    seq_num: u32,
    offer: Offer,
    reply_to: &str,
) {
    let mut send_indexes = Vec::new();
    let mut ssrcs = Vec::new();

    {
        let mut streams = streams.lock().await;
        for stream in &offer.supported_streams {
            if stream.stream_type != STREAM_TYPE_VIDEO {
                tracing::debug!(
                    stream_type = %stream.stream_type,
                    index = stream.index,
                    "skipping unsupported stream"
                );
                continue;
            }

            let key = match hex::decode(&stream.aes_key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(index = stream.index, "bad aesKey in offer: {e}");
                    continue;
                }
            };
            let iv_mask = match hex::decode(&stream.aes_iv_mask) {
                Ok(iv) => iv,
                Err(e) => {
                    tracing::warn!(index = stream.index, "bad aesIvMask in offer: {e}");
                    continue;
                }
            };
            let decrypter = match Decrypter::new(&key, &iv_mask) {
                Ok(decrypter) => decrypter,
                Err(e) => {
                    tracing::warn!(index = stream.index, "cannot build decrypter: {e}");
                    continue;
                }
            };

            streams.insert(
                stream.ssrc,
                Stream::new(
                    stream.ssrc,
                    stream.ssrc + 1,
                    decrypter,
                    device.decoder(),
                    device.frames(),
                ),
            );
            send_indexes.push(stream.index);
            ssrcs.push(stream.ssrc);
            tracing::info!(ssrc = stream.ssrc, index = stream.index, "accepted video stream");
        }
    }

    let answer = WebRtcMessage::Answer {
        seq_num,
        result: "ok".to_string(),
        answer: Answer {
            cast_mode: offer.cast_mode.clone(),
            udp_port,
            send_indexes: send_indexes.clone(),
            ssrcs,
            receiver_rtcp_event_log: send_indexes,
            receiver_get_status: offer.receiver_get_status,
        },
    };
    let payload = match serde_json::to_string(&answer) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("failed to serialize answer: {e}");
            return;
        }
    };
    device
        .send_utf8(NS_WEBRTC, payload, transport_id, reply_to)
        .await;
}

async fn udp_task(
    device: Arc<Device>,
    session_id: String,
    socket: Arc<UdpSocket>,
    streams: StreamMap,
    stop: Arc<Notify>,
    stopping: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = stop.notified() => {
                tracing::debug!(%session_id, "udp reader stopping");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        dispatch_datagram(&buf[..len], peer, &socket, &streams).await;
                    }
                    Err(e) => {
                        if stopping.load(Ordering::SeqCst) {
                            tracing::debug!(%session_id, "udp reader stopping");
                        } else {
                            tracing::error!(%session_id, "error reading session socket: {e}");
                            // The session is unusable; tear it down and let
                            // status subscribers find out.
                            if shutdown(&device, &session_id).await {
                                crate::receiver::broadcast_status(&device, 0).await;
                            }
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Route one datagram by its payload type: 96 is cast video RTP, 72 is
/// compound RTCP. Anything else is logged and dropped.
async fn dispatch_datagram(
    data: &[u8],
    peer: SocketAddr,
    socket: &UdpSocket,
    streams: &StreamMap,
) {
    if data.len() < 2 {
        tracing::debug!("dropping runt datagram");
        return;
    }

    let payload_type = data[1] & 0x7f;
    match payload_type {
        PAYLOAD_TYPE_VIDEO => {
            let mut raw = data;
            let packet = match rtp::packet::Packet::unmarshal(&mut raw) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!("dropping unparseable rtp packet: {e}");
                    return;
                }
            };
            let mut streams = streams.lock().await;
            match streams.get_mut(&packet.header.ssrc) {
                Some(stream) => {
                    stream.enqueue_packet(packet);
                    stream.drain(socket, peer).await;
                }
                None => {
                    tracing::debug!(ssrc = packet.header.ssrc, "rtp for unknown ssrc");
                }
            }
        }
        PAYLOAD_TYPE_RTCP => {
            let mut streams = streams.lock().await;
            // RTCP does not name the media SSRC up front; every stream gets
            // a look and matches on its own sender report.
            for stream in streams.values_mut() {
                stream.handle_rtcp(data, socket, peer).await;
            }
        }
        other => {
            tracing::debug!(payload_type = other, "ignoring datagram");
        }
    }
}
