//! Contracts for the external media collaborators: the VP8 decoder and the
//! frame sink. The receiver core hands every completed frame to a
//! `VideoDecoder` and pushes the decoded image onto the device's frame
//! channel; rendering happens elsewhere.

use anyhow::Result;

/// A decoded RGBA image ready for display.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_id: u32,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Decodes one compressed video frame into an RGBA image.
pub trait VideoDecoder: Send + Sync {
    fn decode(&self, frame_id: u32, data: &[u8]) -> Result<DecodedFrame>;
}

/// Decoder used when no real codec is wired in; it produces empty frames so
/// the rest of the pipeline (feedback, frame ids, the sink channel) still
/// runs.
pub struct NullDecoder;

impl VideoDecoder for NullDecoder {
    fn decode(&self, frame_id: u32, _data: &[u8]) -> Result<DecodedFrame> {
        Ok(DecodedFrame {
            frame_id,
            width: 0,
            height: 0,
            rgba: Vec::new(),
        })
    }
}
