//! Length-prefixed framing for the Cast channel.
//!
//! Each frame on the wire:
//! ```text
//! [0..4]  payload length (u32, big-endian)
//! [4..]   protobuf-serialized CastMessage
//! ```
//!
//! A frame may arrive split across any number of reads; both the length
//! prefix and the body are read with `read_exact`.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::channel::{CastMessage, MAX_MESSAGE_SIZE};

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Depth of the inbound message queue. Senders that outrun the dispatcher
/// block only their own connection.
const INBOUND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_MESSAGE_SIZE}-byte channel limit")]
    Oversized(usize),
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one framed CastMessage from the stream.
///
/// Returns `Ok(None)` when the message body cannot be decoded; a malformed
/// protobuf is dropped without tearing the connection down.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<CastMessage>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::Oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    match CastMessage::decode(body.as_slice()) {
        Ok(message) => Ok(Some(message)),
        Err(e) => {
            tracing::warn!("dropping undecodable cast message: {e}");
            Ok(None)
        }
    }
}

/// Write one framed CastMessage to the stream.
pub async fn write_message<W>(writer: &mut W, message: &CastMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode_to_vec();
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::Oversized(body.len()));
    }

    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// A Cast channel over a bidirectional byte stream.
///
/// Owns a reader task that delivers decoded messages on a bounded queue and
/// a writer task fed by `send`. Dropping the channel (or the peer closing
/// the stream) stops both tasks.
pub struct CastChannel {
    incoming: mpsc::Receiver<CastMessage>,
    outbound: mpsc::UnboundedSender<CastMessage>,
}

impl CastChannel {
    pub fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (incoming_tx, incoming_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(reader, incoming_tx));
        tokio::spawn(write_loop(writer, outbound_rx));

        Self {
            incoming: incoming_rx,
            outbound: outbound_tx,
        }
    }

    /// Queue a message for transmission.
    pub fn send(&self, message: CastMessage) -> Result<(), FrameError> {
        self.outbound.send(message).map_err(|_| FrameError::Closed)
    }

    /// A cloneable handle for queueing outbound messages.
    pub fn sender(&self) -> mpsc::UnboundedSender<CastMessage> {
        self.outbound.clone()
    }

    /// Receive the next decoded message; `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<CastMessage> {
        self.incoming.recv().await
    }
}

async fn read_loop<R>(mut reader: R, incoming: mpsc::Sender<CastMessage>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => {
                if incoming.send(message).await.is_err() {
                    // Consumer is gone; nothing left to deliver to.
                    return;
                }
            }
            Ok(None) => continue,
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("cast channel closed by peer");
                return;
            }
            Err(e) => {
                tracing::warn!("cast channel read failed: {e}");
                return;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<CastMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::warn!("cast channel write failed: {e}");
            return;
        }
    }
}
