//! Envelope framing over TCP using tokio-util's LengthDelimitedCodec
//!
//! Each frame is a 4-byte big-endian length followed by one JSON envelope.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use parkmesh_core::{Envelope, ProtocolResult};

use crate::error::{TransportError, TransportResult};

fn codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_size)
        .new_codec()
}

/// Framed writer half of a peer connection
pub struct FrameSink {
    inner: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    max_frame_size: usize,
}

impl FrameSink {
    pub fn new(half: OwnedWriteHalf, max_frame_size: usize) -> Self {
        Self {
            inner: FramedWrite::new(half, codec(max_frame_size)),
            max_frame_size,
        }
    }

    /// Send one pre-encoded frame
    pub async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        self.inner.send(frame).await?;
        Ok(())
    }
}

/// Framed reader half of a peer connection
pub struct FrameStream {
    inner: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
}

impl FrameStream {
    pub fn new(half: OwnedReadHalf, max_frame_size: usize) -> Self {
        Self {
            inner: FramedRead::new(half, codec(max_frame_size)),
        }
    }

    /// Receive the next frame, or `None` once the peer closed the stream
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> TransportResult<Option<BytesMut>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }
}

/// Split a connected stream into framed halves
pub fn split(stream: TcpStream, max_frame_size: usize) -> (FrameStream, FrameSink) {
    let (read, write) = stream.into_split();
    (
        FrameStream::new(read, max_frame_size),
        FrameSink::new(write, max_frame_size),
    )
}

/// Encode an envelope once so it can be fanned out to many links
pub fn encode(envelope: &Envelope) -> TransportResult<Bytes> {
    Ok(Bytes::from(envelope.to_json()?))
}

pub fn decode(frame: &[u8]) -> ProtocolResult<Envelope> {
    Envelope::from_json(frame)
}
