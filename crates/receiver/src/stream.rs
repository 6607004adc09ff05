//! Per-SSRC media stream: RTP reordering, frame assembly, decryption and
//! the RTCP feedback loop.
//!
//! Packets are buffered by sequence number and drained in strict order;
//! a frame is complete when the RTP marker bit is seen, at which point the
//! accumulated ciphertext is decrypted, handed to the video decoder, and
//! feedback (extended report + Cast PSFB) is sent back to the packet's
//! source address.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use castellan_protocol::feedback::{CastFeedback, ReceiverReferenceTime};
use rtcp::packet::Packet as RtcpPacket;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::marshal::Marshal;

use crate::decrypt::Decrypter;
use crate::media::{DecodedFrame, VideoDecoder};

/// UDP payload type carrying cast video RTP.
pub const PAYLOAD_TYPE_VIDEO: u8 = 96;
/// UDP payload type carrying compound RTCP.
pub const PAYLOAD_TYPE_RTCP: u8 = 72;

/// Constant playout delay reported in every Cast feedback message.
const PLAYOUT_DELAY_MS: u16 = 400;
/// Constant delay-since-last-SR reported in receiver reports.
const RECEPTION_REPORT_DELAY: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("rtp payload too short for cast packet header ({0} bytes)")]
    TruncatedHeader(usize),
}

/// Parsed Cast packet header at the front of each video RTP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PacketHeader {
    keyframe: bool,
    has_reference: bool,
    reference_id: Option<u8>,
    frame_id: u8,
    packet_id: u16,
    max_packet_id: u32,
    /// Offset of the ciphertext within the RTP payload.
    payload_offset: usize,
}

/// Extension type for adaptive latency control; parsed and ignored.
const EXTENSION_ADAPTIVE_LATENCY: u16 = 1;

fn parse_packet_header(payload: &[u8]) -> Result<PacketHeader, StreamError> {
    if payload.len() < 8 {
        return Err(StreamError::TruncatedHeader(payload.len()));
    }

    let flags = payload[0];
    let keyframe = flags & 0x80 != 0;
    let has_reference = flags & 0x40 != 0;
    let extension_count = (flags & 0x3f) as usize;
    let frame_id = payload[1];
    let packet_id = u16::from_be_bytes([payload[2], payload[3]]);
    let max_packet_id = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

    let mut offset = 8;
    let mut reference_id = None;
    if has_reference {
        let byte = *payload
            .get(offset)
            .ok_or(StreamError::TruncatedHeader(payload.len()))?;
        reference_id = Some(byte);
        offset += 1;
    }

    for _ in 0..extension_count {
        let type_and_size = payload
            .get(offset..offset + 2)
            .ok_or(StreamError::TruncatedHeader(payload.len()))?;
        let type_and_size = u16::from_be_bytes([type_and_size[0], type_and_size[1]]);
        let extension_type = type_and_size >> 10;
        let size = (type_and_size & 0x3ff) as usize;
        if extension_type == EXTENSION_ADAPTIVE_LATENCY {
            tracing::trace!("ignoring adaptive latency extension");
        } else {
            tracing::trace!(extension_type, size, "ignoring unknown extension");
        }
        offset += 2 + size;
        if offset > payload.len() {
            return Err(StreamError::TruncatedHeader(payload.len()));
        }
    }

    Ok(PacketHeader {
        keyframe,
        has_reference,
        reference_id,
        frame_id,
        packet_id,
        max_packet_id,
        payload_offset: offset,
    })
}

/// Widen the 8-bit header frame id against the running counter. Frame ids
/// only move forward.
fn extend_frame_id(current: u32, raw: u8) -> u32 {
    current.wrapping_add(raw.wrapping_sub(current as u8) as u32)
}

pub struct Stream {
    sender_ssrc: u32,
    receiver_ssrc: u32,
    decrypter: Decrypter,
    decoder: Arc<dyn VideoDecoder>,
    frames: mpsc::Sender<DecodedFrame>,
    /// Reorder buffer, keyed (and drained) by RTP sequence number.
    queue: BTreeMap<u16, rtp::packet::Packet>,
    /// Next sequence number to drain; `None` until the first drain, which
    /// starts from the smallest buffered sequence number.
    next_seq: Option<u16>,
    highest_seq: u32,
    /// Ciphertext accumulated for the frame in flight.
    buffer: Vec<u8>,
    /// Frame the decrypter is currently keyed for.
    current_frame_id: u32,
    /// Last fully received frame id, echoed in every PSFB.
    checkpoint_frame_id: u8,
    last_sender_ntp: u64,
    last_sender_rtp: u32,
}

impl Stream {
    pub fn new(
        sender_ssrc: u32,
        receiver_ssrc: u32,
        decrypter: Decrypter,
        decoder: Arc<dyn VideoDecoder>,
        frames: mpsc::Sender<DecodedFrame>,
    ) -> Self {
        Self {
            sender_ssrc,
            receiver_ssrc,
            decrypter,
            decoder,
            frames,
            queue: BTreeMap::new(),
            next_seq: None,
            highest_seq: 0,
            buffer: Vec::new(),
            current_frame_id: 0,
            checkpoint_frame_id: 0,
            last_sender_ntp: 0,
            last_sender_rtp: 0,
        }
    }

    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    /// Buffer an RTP packet for in-order draining.
    pub fn enqueue_packet(&mut self, packet: rtp::packet::Packet) {
        let seq = packet.header.sequence_number;
        self.highest_seq = self.highest_seq.max(seq as u32);
        self.queue.insert(seq, packet);
        tracing::trace!(sequence_number = seq, "enqueued packet");
    }

    /// Drain every packet that continues the in-order run. Gaps stay
    /// buffered until the missing packet arrives.
    pub async fn drain(&mut self, socket: &UdpSocket, peer: SocketAddr) {
        while let Some(packet) = self.next_packet() {
            self.handle_data_packet(packet, socket, peer).await;
        }
    }

    fn next_packet(&mut self) -> Option<rtp::packet::Packet> {
        let seq = match self.next_seq {
            Some(expected) => {
                if !self.queue.contains_key(&expected) {
                    return None;
                }
                expected
            }
            // First drain: start from the smallest buffered sequence number.
            None => *self.queue.keys().next()?,
        };
        let packet = self.queue.remove(&seq)?;
        self.next_seq = Some(seq.wrapping_add(1));
        Some(packet)
    }

    async fn handle_data_packet(
        &mut self,
        packet: rtp::packet::Packet,
        socket: &UdpSocket,
        peer: SocketAddr,
    ) {
        let payload = &packet.payload[..];
        let header = match parse_packet_header(payload) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!("dropping malformed video packet: {e}");
                return;
            }
        };

        tracing::trace!(
            keyframe = header.keyframe,
            frame_id = header.frame_id,
            packet_id = header.packet_id,
            max_packet_id = header.max_packet_id,
            reference_id = header.reference_id,
            "video packet"
        );

        let frame_id = extend_frame_id(self.current_frame_id, header.frame_id);
        if frame_id != self.current_frame_id {
            if !self.buffer.is_empty() {
                tracing::debug!(
                    bytes = self.buffer.len(),
                    frame_id = self.current_frame_id,
                    "discarding incomplete frame"
                );
                self.buffer.clear();
            }
            self.current_frame_id = frame_id;
            self.decrypter.reset(frame_id);
        }

        self.buffer
            .extend_from_slice(&payload[header.payload_offset..]);

        if packet.header.marker {
            self.complete_frame(header.frame_id, socket, peer).await;
        }
    }

    async fn complete_frame(&mut self, received_frame_id: u8, socket: &UdpSocket, peer: SocketAddr) {
        let mut plaintext = std::mem::take(&mut self.buffer);
        self.decrypter.decrypt(&mut plaintext);

        let frame_id = self.current_frame_id;
        match self.decoder.decode(frame_id, &plaintext) {
            Ok(frame) => {
                if self.frames.send(frame).await.is_err() {
                    tracing::debug!("frame sink is gone, dropping decoded frame");
                }
            }
            // A bad frame is dropped; the stream continues with the next.
            Err(e) => tracing::warn!(frame_id, "failed to decode frame: {e:#}"),
        }

        self.checkpoint_frame_id = received_frame_id;
        self.current_frame_id = self.current_frame_id.wrapping_add(1);
        self.decrypter.reset(self.current_frame_id);

        self.send_frame_feedback(socket, peer).await;
    }

    /// Emit the post-frame feedback: an extended report with the last
    /// sender NTP time, followed by the Cast PSFB.
    async fn send_frame_feedback(&self, socket: &UdpSocket, peer: SocketAddr) {
        let mut datagram = Vec::new();

        let reference_time = ReceiverReferenceTime {
            ssrc: self.receiver_ssrc,
            ntp_timestamp: self.last_sender_ntp,
        };
        match reference_time.marshal() {
            Ok(bytes) => datagram.extend_from_slice(&bytes),
            Err(e) => {
                tracing::warn!("failed to marshal extended report: {e}");
                return;
            }
        }

        let feedback = CastFeedback {
            receiver_ssrc: self.receiver_ssrc,
            sender_ssrc: self.sender_ssrc,
            checkpoint_frame_id: self.checkpoint_frame_id,
            loss_fields: 0,
            playout_delay_ms: PLAYOUT_DELAY_MS,
        };
        match feedback.marshal() {
            Ok(bytes) => datagram.extend_from_slice(&bytes),
            Err(e) => {
                tracing::warn!("failed to marshal cast feedback: {e}");
                return;
            }
        }

        if let Err(e) = socket.send_to(&datagram, peer).await {
            tracing::warn!("failed to send rtcp feedback: {e}");
        }
    }

    /// Handle a compound RTCP datagram from the sender.
    pub async fn handle_rtcp(&mut self, data: &[u8], socket: &UdpSocket, peer: SocketAddr) {
        let mut buf = data;
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!("dropping unparseable rtcp datagram: {e}");
                return;
            }
        };

        for packet in packets {
            if let Some(report) = packet.as_any().downcast_ref::<SenderReport>() {
                self.handle_sender_report(report, socket, peer).await;
            }
        }
    }

    async fn handle_sender_report(
        &mut self,
        report: &SenderReport,
        socket: &UdpSocket,
        peer: SocketAddr,
    ) {
        tracing::trace!(
            ssrc = report.ssrc,
            ntp_time = report.ntp_time,
            rtp_time = report.rtp_time,
            "sender report"
        );
        self.last_sender_ntp = report.ntp_time;
        self.last_sender_rtp = report.rtp_time;

        let mut datagram = Vec::new();

        let reference_time = ReceiverReferenceTime {
            ssrc: self.receiver_ssrc,
            ntp_timestamp: self.last_sender_ntp,
        };
        match reference_time.marshal() {
            Ok(bytes) => datagram.extend_from_slice(&bytes),
            Err(e) => {
                tracing::warn!("failed to marshal extended report: {e}");
                return;
            }
        }

        let receiver_report = ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![ReceptionReport {
                ssrc: self.sender_ssrc,
                last_sender_report: self.last_sender_rtp,
                last_sequence_number: self.highest_seq,
                delay: RECEPTION_REPORT_DELAY,
                ..Default::default()
            }],
            ..Default::default()
        };
        match receiver_report.marshal() {
            Ok(bytes) => datagram.extend_from_slice(&bytes),
            Err(e) => {
                tracing::warn!("failed to marshal receiver report: {e}");
                return;
            }
        }

        if let Err(e) = socket.send_to(&datagram, peer).await {
            tracing::warn!("failed to send receiver report: {e}");
        }
    }
}
