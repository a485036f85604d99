//! Length-prefixed framing over a streaming byte transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use snafu::{ensure, ResultExt, Snafu};
use tokio_util::codec::{Decoder, Encoder};

/// Default per-frame size limit.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Framing failures. All of these are fatal for the session that hit them.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum FrameError {
    #[snafu(display("zero-length frame on the wire"))]
    ZeroLength,

    #[snafu(display("frame of {} bytes exceeds the {} byte limit", length, max))]
    TooLarge { length: usize, max: usize },

    #[snafu(display("malformed {} message: {}", type_name, source))]
    Malformed {
        type_name: &'static str,
        source: prost::DecodeError,
    },

    #[snafu(context(false), display("transport error: {}", source))]
    Io { source: std::io::Error },
}

/// Codec for `uint32 big-endian length | payload` frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Codec with a custom frame limit.
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut length = [0u8; 4];
        length.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length) as usize;
        ensure!(length != 0, ZeroLengthSnafu);
        ensure!(
            length <= self.max_frame,
            TooLargeSnafu {
                length,
                max: self.max_frame
            }
        );
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        ensure!(!item.is_empty(), ZeroLengthSnafu);
        ensure!(
            item.len() <= self.max_frame,
            TooLargeSnafu {
                length: item.len(),
                max: self.max_frame
            }
        );
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Serialize a message into a frame payload.
pub fn encode_message<M: Message>(msg: &M) -> Bytes {
    Bytes::from(msg.encode_to_vec())
}

/// Deserialize a frame payload into a typed message.
pub fn decode_message<M: Message + Default>(payload: &[u8]) -> Result<M, FrameError> {
    M::decode(payload).context(MalformedSnafu {
        type_name: std::any::type_name::<M>(),
    })
}
