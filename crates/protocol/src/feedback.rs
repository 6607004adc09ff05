//! Cast payload-specific feedback (PSFB) RTCP packet.
//!
//! Reuses RTCP packet type 206 with format 15 (the REMB encoding):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       SSRC of Receiver                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        SSRC of Sender                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Unique identifier 'C' 'A' 'S' 'T'               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | CkPt Frame ID | # Loss Fields | Current Playout Delay (msec)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `loss_fields` is always zero here; the on-wire layout for loss records
//! is reserved.

use bytes::Bytes;
use rtcp::header::{FORMAT_REMB, HEADER_LENGTH, Header, PacketType};
use util::marshal::{Marshal, Unmarshal};

const IDENTIFIER: &[u8; 4] = b"CAST";
const BODY_LENGTH: usize = 16;
const PACKET_LENGTH: usize = HEADER_LENGTH + BODY_LENGTH;

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("packet too short: {0} bytes (need {PACKET_LENGTH})")]
    TooShort(usize),
    #[error("not a cast feedback packet (type {packet_type}, format {format})")]
    WrongType { packet_type: u8, format: u8 },
    #[error("missing CAST identifier")]
    BadIdentifier,
    #[error("rtcp header: {0}")]
    Header(String),
}

/// The Cast feedback message emitted after every completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastFeedback {
    pub receiver_ssrc: u32,
    pub sender_ssrc: u32,
    pub checkpoint_frame_id: u8,
    pub loss_fields: u8,
    pub playout_delay_ms: u16,
}

impl CastFeedback {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_REMB,
            packet_type: PacketType::PayloadSpecificFeedback,
            // Length in 32-bit words, minus the header word.
            length: (PACKET_LENGTH / 4 - 1) as u16,
        }
    }

    pub fn marshal(&self) -> Result<Bytes, FeedbackError> {
        let mut raw = vec![0u8; PACKET_LENGTH];

        let header_bytes = self
            .header()
            .marshal()
            .map_err(|e| FeedbackError::Header(e.to_string()))?;
        raw[..HEADER_LENGTH].copy_from_slice(&header_bytes);

        let body = &mut raw[HEADER_LENGTH..];
        body[0..4].copy_from_slice(&self.receiver_ssrc.to_be_bytes());
        body[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        body[8..12].copy_from_slice(IDENTIFIER);
        body[12] = self.checkpoint_frame_id;
        body[13] = self.loss_fields;
        body[14..16].copy_from_slice(&self.playout_delay_ms.to_be_bytes());

        Ok(Bytes::from(raw))
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self, FeedbackError> {
        if raw.len() < PACKET_LENGTH {
            return Err(FeedbackError::TooShort(raw.len()));
        }

        let mut buf = raw;
        let header =
            Header::unmarshal(&mut buf).map_err(|e| FeedbackError::Header(e.to_string()))?;
        if header.packet_type != PacketType::PayloadSpecificFeedback
            || header.count != FORMAT_REMB
        {
            return Err(FeedbackError::WrongType {
                packet_type: header.packet_type as u8,
                format: header.count,
            });
        }

        let body = &raw[HEADER_LENGTH..];
        if &body[8..12] != IDENTIFIER {
            return Err(FeedbackError::BadIdentifier);
        }

        Ok(Self {
            receiver_ssrc: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            sender_ssrc: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            checkpoint_frame_id: body[12],
            loss_fields: body[13],
            playout_delay_ms: u16::from_be_bytes([body[14], body[15]]),
        })
    }
}

/// Extended report (RTCP type 207) carrying a single receiver-reference-time
/// block with the last NTP timestamp observed from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReferenceTime {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
}

const RRT_BLOCK_TYPE: u8 = 4;
const RRT_PACKET_LENGTH: usize = HEADER_LENGTH + 4 + 4 + 8;

impl ReceiverReferenceTime {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: 0,
            packet_type: PacketType::ExtendedReport,
            length: (RRT_PACKET_LENGTH / 4 - 1) as u16,
        }
    }

    pub fn marshal(&self) -> Result<Bytes, FeedbackError> {
        let mut raw = vec![0u8; RRT_PACKET_LENGTH];

        let header_bytes = self
            .header()
            .marshal()
            .map_err(|e| FeedbackError::Header(e.to_string()))?;
        raw[..HEADER_LENGTH].copy_from_slice(&header_bytes);

        let body = &mut raw[HEADER_LENGTH..];
        body[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        // Block header: type, reserved, length in words.
        body[4] = RRT_BLOCK_TYPE;
        body[5] = 0;
        body[6..8].copy_from_slice(&2u16.to_be_bytes());
        body[8..16].copy_from_slice(&self.ntp_timestamp.to_be_bytes());

        Ok(Bytes::from(raw))
    }
}
