//! Frame assembly and message encoding/decoding.
//!
//! A message travels as a run of logical frames, each encoded as
//! `[more: u8][len: u32 BE][payload]`; the run ends at the first frame
//! with `more == 0`. The message-level layout is
//! `[identity frames...] <IDS|MSG> signature header parent-header
//! metadata content`.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::message::{Message, Payload};
use crate::signer::MessageSigner;

/// Sentinel payload separating identity frames from the signed body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Upper bound on a single frame payload.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("message is missing the identity delimiter")]
    MissingDelimiter,
    #[error("message truncated: expected {expected} frames after the delimiter, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("payload frame is not a JSON object")]
    NotAnObject,
    #[error("message signature verification failed")]
    BadSignature,
    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
}

/// Incremental frame parser.
///
/// Bytes are fed in as they arrive off the socket; complete frame runs
/// come out. Partial input is retained across calls, which keeps socket
/// reads cancellation-safe.
#[derive(Default)]
pub struct FrameAssembler {
    buf: BytesMut,
    frames: Vec<Bytes>,
}

impl FrameAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame run, if one is buffered.
    ///
    /// # Errors
    /// Returns an error when a frame header advertises an oversized
    /// payload; the assembler should be discarded afterwards.
    pub fn next_message(&mut self) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        loop {
            if self.buf.len() < 5 {
                return Ok(None);
            }
            let more = self.buf[0] != 0;
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            if len > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge(len));
            }
            if self.buf.len() < 5 + len {
                return Ok(None);
            }
            let _ = self.buf.split_to(5);
            let payload = self.buf.split_to(len).freeze();
            self.frames.push(payload);
            if !more {
                return Ok(Some(std::mem::take(&mut self.frames)));
            }
        }
    }
}

/// Write one frame run to the socket as a single logical send.
///
/// # Errors
/// Returns an error if the underlying write fails.
pub async fn write_frames<W>(writer: &mut W, frames: &[Bytes]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    for (index, frame) in frames.iter().enumerate() {
        let more = u8::from(index + 1 < frames.len());
        out.extend_from_slice(&[more]);
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn parse_payload(frame: &Bytes) -> Result<Payload, ProtocolError> {
    match serde_json::from_slice::<serde_json::Value>(frame)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Decode a message from a complete frame run.
///
/// Identity frames before the delimiter are consumed, retaining only
/// the first. Signature verification is fail-closed: a message whose
/// signature does not verify is rejected.
///
/// # Errors
/// Returns an error for a malformed frame run, invalid payload JSON,
/// or a failed signature check. Callers log and drop the message.
pub fn decode_message(
    frames: &[Bytes],
    signer: &dyn MessageSigner,
) -> Result<Message, ProtocolError> {
    let mut identity: Option<Bytes> = None;
    let mut iter = frames.iter();
    loop {
        let frame = iter.next().ok_or(ProtocolError::MissingDelimiter)?;
        if frame.as_ref() == DELIMITER {
            break;
        }
        if identity.is_none() {
            identity = Some(frame.clone());
        }
    }

    let rest: Vec<&Bytes> = iter.collect();
    if rest.len() != 5 {
        return Err(ProtocolError::Truncated {
            expected: 5,
            actual: rest.len(),
        });
    }
    let signature = std::str::from_utf8(rest[0]).unwrap_or("");
    let payloads: [&[u8]; 4] = [rest[1], rest[2], rest[3], rest[4]];
    if !signer.verify(&payloads, signature) {
        return Err(ProtocolError::BadSignature);
    }

    Ok(Message::from_parts(
        identity,
        parse_payload(rest[1])?,
        parse_payload(rest[2])?,
        parse_payload(rest[3])?,
        parse_payload(rest[4])?,
    ))
}

/// Encode a message into its frame run, recomputing the signature over
/// the four payload documents.
#[must_use]
pub fn encode_message(message: &Message, signer: &dyn MessageSigner) -> Vec<Bytes> {
    let header = serde_json::to_vec(&message.header).unwrap_or_else(|_| b"{}".to_vec());
    let parent = serde_json::to_vec(&message.parent_header).unwrap_or_else(|_| b"{}".to_vec());
    let metadata = serde_json::to_vec(&message.metadata).unwrap_or_else(|_| b"{}".to_vec());
    let content = serde_json::to_vec(&message.content).unwrap_or_else(|_| b"{}".to_vec());

    let signature = signer.sign(&[&header, &parent, &metadata, &content]);

    let mut frames = Vec::with_capacity(7);
    if let Some(identity) = &message.identity {
        frames.push(identity.clone());
    }
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature.into_bytes()));
    frames.push(Bytes::from(header));
    frames.push(Bytes::from(parent));
    frames.push(Bytes::from(metadata));
    frames.push(Bytes::from(content));
    frames
}
