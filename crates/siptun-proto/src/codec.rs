//! Codec for encoding/decoding link messages

use crate::messages::LinkMessage;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link message codec
///
/// Format: `[length: u32 big endian][payload: bincode serialized message]`
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCodec;

impl LinkCodec {
    const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self
    }
}

impl Encoder<LinkMessage> for LinkCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: LinkMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&msg)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for LinkCodec {
    type Item = LinkMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < Self::HEADER_SIZE + length {
            src.reserve(Self::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let msg_bytes = src.split_to(length);
        let msg = bincode::deserialize(&msg_bytes)?;
        Ok(Some(msg))
    }
}
