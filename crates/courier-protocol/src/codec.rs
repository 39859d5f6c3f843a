//! Length-delimited frame codec for peer TCP streams.
//!
//! Wire format: 8-byte little-endian length prefix + payload. The decoder
//! yields payloads with the prefix stripped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, DEFAULT_MAX_FRAME_BYTES, LENGTH_PREFIX_SIZE};

/// Where the reader is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for the 8 length bytes.
    AwaitingSize,
    /// Length consumed, waiting for this many payload bytes.
    AwaitingBody(usize),
}

/// Codec for framing payloads over a byte stream.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            state: ReadState::AwaitingSize,
            max_frame_bytes,
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// Length prefix for a payload of `len` bytes.
pub fn frame_header(len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    (len as u64).to_le_bytes()
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ReadState::AwaitingSize => {
                    if src.len() < LENGTH_PREFIX_SIZE {
                        src.reserve(LENGTH_PREFIX_SIZE - src.len());
                        return Ok(None);
                    }

                    let length = src.get_u64_le();
                    if length > self.max_frame_bytes as u64 {
                        return Err(ProtocolError::FrameTooLarge {
                            size: length,
                            max: self.max_frame_bytes,
                        });
                    }
                    self.state = ReadState::AwaitingBody(length as usize);
                }
                ReadState::AwaitingBody(length) => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }

                    self.state = ReadState::AwaitingSize;
                    return Ok(Some(src.split_to(length).freeze()));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => match self.state {
                ReadState::AwaitingSize if buf.is_empty() => Ok(None),
                ReadState::AwaitingSize => Err(ProtocolError::Truncated {
                    buffered: buf.len(),
                    expected: LENGTH_PREFIX_SIZE,
                }),
                ReadState::AwaitingBody(expected) => Err(ProtocolError::Truncated {
                    buffered: buf.len(),
                    expected,
                }),
            },
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len() as u64,
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u64_le(item.len() as u64);
        dst.extend_from_slice(&item);

        Ok(())
    }
}
