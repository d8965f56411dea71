//! Multiplex frame: channel framing over one physical stream

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on one frame (id + type + body). Larger frames drop the stream.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// A u64 never needs more than 10 LEB128 bytes
const MAX_VARINT_LEN: usize = 10;

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Varint longer than {MAX_VARINT_LEN} bytes")]
    VarintOverflow,

    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(u64),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Truncated frame")]
    Truncated,
}

/// Frame type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Binds a channel name to the sender's channel id (0x00)
    Start = 0x00,
    /// Channel payload (0x01)
    Data = 0x01,
    /// Sender will write no more (0x02)
    End = 0x02,
    /// Full teardown (0x03)
    Destroy = 0x03,
}

impl FrameType {
    /// Convert from u8 to FrameType
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(FrameType::Start),
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::End),
            0x03 => Ok(FrameType::Destroy),
            other => Err(FrameError::InvalidFrameType(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// One multiplex frame. `channel_id` is always the *sender's* local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub channel_id: u64,
    pub frame_type: FrameType,
    pub body: Bytes,
}

impl MuxFrame {
    pub fn start(channel_id: u64, name: &str) -> Self {
        Self {
            channel_id,
            frame_type: FrameType::Start,
            body: Bytes::copy_from_slice(name.as_bytes()),
        }
    }

    pub fn data(channel_id: u64, body: Bytes) -> Self {
        Self {
            channel_id,
            frame_type: FrameType::Data,
            body,
        }
    }

    pub fn end(channel_id: u64) -> Self {
        Self {
            channel_id,
            frame_type: FrameType::End,
            body: Bytes::new(),
        }
    }

    pub fn destroy(channel_id: u64) -> Self {
        Self {
            channel_id,
            frame_type: FrameType::Destroy,
            body: Bytes::new(),
        }
    }
}

/// Append `value` as an unsigned LEB128 varint
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read a varint from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes it used.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, FrameError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(FrameError::VarintOverflow);
        }
        let low = (*byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(FrameError::VarintOverflow);
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(FrameError::VarintOverflow);
    }
    Ok(None)
}

/// Codec for `[varint len][varint channel id][u8 type][body]`, where `len`
/// covers everything after itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MuxFrame>, FrameError> {
        let Some((len, prefix)) = decode_varint(src)? else {
            return Ok(None);
        };
        if len > MAX_FRAME_SIZE as u64 {
            return Err(FrameError::FrameTooLarge(len));
        }

        let total = prefix + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        let mut frame = src.split_to(len as usize);

        let Some((channel_id, id_len)) = decode_varint(&frame)? else {
            return Err(FrameError::Truncated);
        };
        frame.advance(id_len);
        if frame.is_empty() {
            return Err(FrameError::Truncated);
        }
        let frame_type = FrameType::from_u8(frame[0])?;
        frame.advance(1);

        Ok(Some(MuxFrame {
            channel_id,
            frame_type,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<MuxFrame> for MuxCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let mut id = BytesMut::with_capacity(MAX_VARINT_LEN);
        encode_varint(frame.channel_id, &mut id);

        let len = id.len() + 1 + frame.body.len();
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(len as u64));
        }

        dst.reserve(MAX_VARINT_LEN + len);
        encode_varint(len as u64, dst);
        dst.extend_from_slice(&id);
        dst.put_u8(frame.frame_type.as_u8());
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}
