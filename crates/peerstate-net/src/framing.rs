//! Message framing for network transport
//!
//! Provides length-prefixed framing plus async helpers to move single
//! frames over any tokio stream.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("Empty frame")]
    Empty,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("Unexpected frame: expected {expected:?}, got {got:?}")]
    UnexpectedType { expected: FrameType, got: FrameType },
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Identity exchange
    Hello = 2,
    HelloAck = 3,
    /// Membership
    Join = 10,
    JoinAck = 11,
    Leave = 12,
    LeaveAck = 13,
    /// Signed state push
    PushState = 20,
    PushResult = 21,
    /// Full state pull
    FullStateRequest = 30,
    FullStateResponse = 31,
    /// Content fetch
    BlockRequest = 40,
    BlockResponse = 41,
    LinksRequest = 42,
    LinksResponse = 43,
    /// Request failed on the remote side
    Error = 255,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::Hello),
            3 => Ok(Self::HelloAck),
            10 => Ok(Self::Join),
            11 => Ok(Self::JoinAck),
            12 => Ok(Self::Leave),
            13 => Ok(Self::LeaveAck),
            20 => Ok(Self::PushState),
            21 => Ok(Self::PushResult),
            30 => Ok(Self::FullStateRequest),
            31 => Ok(Self::FullStateResponse),
            40 => Ok(Self::BlockRequest),
            41 => Ok(Self::BlockResponse),
            42 => Ok(Self::LinksRequest),
            43 => Ok(Self::LinksResponse),
            255 => Ok(Self::Error),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(FrameError::Empty);
        }
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read frame type
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length == 0 {
        return Err(FrameError::Empty);
    }
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut buf = BytesMut::with_capacity(4 + length);
    buf.put_slice(&header);
    buf.resize(4 + length, 0);
    reader.read_exact(&mut buf[4..]).await?;

    FrameCodec::new().decode(&mut buf)
}
