//! # Framed envelope transport.
//!
//! Each frame is a 4-byte little-endian length followed by that many bytes of
//! a `bincode`-serialized [`Envelope`]. Framing is delegated to
//! [`LengthDelimitedCodec`]; this module only fixes its parameters and adds the
//! envelope (de)serialization on top.
//!
//! ```text
//! ┌────────────┬───────────────────────────────┐
//! │ u32 LE len │ bincode(Envelope) (len bytes) │
//! └────────────┴───────────────────────────────┘
//! ```
//!
//! ## Rules
//! - Frames larger than [`MAX_FRAME_BYTES`] are rejected on both sides.
//! - `FrameReader::next` is cancel-safe (partial frames stay buffered).
//! - A frame that fails to decode is reported but does not poison the stream.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::ProtocolError;

use super::message::{Envelope, MessageStatus, Payload};

/// Largest accepted frame body.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Length-delimited codec with the worker framing parameters.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Serializes an envelope into a frame body.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(envelope, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Deserializes a frame body into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, ProtocolError> {
    let (envelope, _) =
        bincode::serde::decode_from_slice::<Envelope, _>(body, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(envelope)
}

/// Writing half: assigns transaction ids and writes frames.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    next_id: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, frame_codec()),
            next_id: 1,
        }
    }

    /// Sends one envelope and returns its transaction id.
    pub async fn send(
        &mut self,
        status: MessageStatus,
        payload: Payload,
    ) -> Result<u64, ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send_envelope(&Envelope {
            id,
            status,
            payload,
        })
        .await?;
        Ok(id)
    }

    /// Sends an envelope as-is (the id is not rewritten).
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let body = encode_envelope(envelope)?;
        self.inner.send(Bytes::from(body)).await?;
        Ok(())
    }

    /// Flushes and shuts the underlying writer down (closes the pipe).
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Reading half.
pub struct FrameReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, frame_codec()),
        }
    }

    /// Next envelope; `None` once the peer closed its end.
    pub async fn next(&mut self) -> Option<Result<Envelope, ProtocolError>> {
        let frame = self.inner.next().await?;
        Some(match frame {
            Ok(body) => decode_envelope(&body),
            Err(e) => Err(ProtocolError::Io(e)),
        })
    }
}
