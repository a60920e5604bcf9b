// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire format of a frame:
//!
//! ```text
//! +----------------------+----------------------+------------------------+
//! | payload length (u32) | msg id (u32)         | payload (length bytes) |
//! | big endian           | big endian           |                        |
//! +----------------------+----------------------+------------------------+
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Message;
use crate::{AppError, AppResult};

/// length (4 bytes) + msg id (4 bytes)
pub const HEADER_LEN: usize = 8;

/// A frame layout: a fixed size header announcing the payload length, then the payload.
///
/// `DataPack` is the default. Another layout can be installed per server or client with
/// `set_data_pack`, both sides of a connection must agree on it.
pub trait PacketCodec: Send + Sync + fmt::Debug + 'static {
    fn head_len(&self) -> usize;

    /// Serializes header and payload into one contiguous buffer.
    fn encode(&self, msg: &Message) -> AppResult<Bytes>;

    /// Parses `head_len` bytes into a message carrying msg id and payload length, with
    /// an empty payload. Oversized lengths must be rejected here.
    fn decode_header(&self, header: &[u8]) -> AppResult<Message>;
}

/// Splits a byte stream into messages with any `PacketCodec`.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    codec: Arc<dyn PacketCodec>,
}

impl PacketDecoder {
    pub fn new(codec: Arc<dyn PacketCodec>) -> PacketDecoder {
        PacketDecoder { codec }
    }
}

impl Decoder for PacketDecoder {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Message>> {
        decode_frame(self.codec.as_ref(), src)
    }
}

fn decode_frame(codec: &dyn PacketCodec, src: &mut BytesMut) -> AppResult<Option<Message>> {
    let head_len = codec.head_len();
    if src.len() < head_len {
        return Ok(None);
    }
    // validate the header before waiting for the body, an oversized length is
    // rejected without buffering a single payload byte
    let mut msg = codec.decode_header(&src[..head_len])?;
    let frame_len = head_len + msg.data_len() as usize;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    src.advance(head_len);
    let payload = src.split_to(msg.data_len() as usize).freeze();
    msg.set_data(payload);
    Ok(Some(msg))
}

/// Packs and unpacks frames. `max_packet_size` of 0 disables the size check.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPack {
    max_packet_size: u32,
}

impl DataPack {
    pub fn new(max_packet_size: u32) -> DataPack {
        DataPack { max_packet_size }
    }

    pub fn head_len(&self) -> usize {
        HEADER_LEN
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// Serializes header and payload into one contiguous buffer.
    pub fn encode(&self, msg: &Message) -> AppResult<Bytes> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + msg.data().len());
        Self::write_frame(msg, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Reads only the header. The returned message carries the announced length and an
    /// empty payload; the caller reads the payload once it knows how many bytes to expect.
    pub fn decode_header(&self, header: &[u8]) -> AppResult<Message> {
        if header.len() < HEADER_LEN {
            return Err(AppError::MalformedProtocol(format!(
                "frame header needs {} bytes, got {}",
                HEADER_LEN,
                header.len()
            )));
        }
        let mut header = &header[..HEADER_LEN];
        let length = header.get_u32();
        let msg_id = header.get_u32();

        if self.max_packet_size > 0 && length > self.max_packet_size {
            return Err(AppError::PacketTooLarge {
                length,
                max: self.max_packet_size,
            });
        }

        let mut msg = Message::new(msg_id, Bytes::new());
        msg.set_data_len(length);
        Ok(msg)
    }

    fn write_frame(msg: &Message, dst: &mut BytesMut) -> AppResult<()> {
        let length = u32::try_from(msg.data().len()).map_err(|_| {
            AppError::MalformedProtocol(format!(
                "payload of {} bytes does not fit a frame",
                msg.data().len()
            ))
        })?;
        dst.reserve(HEADER_LEN + msg.data().len());
        dst.put_u32(length);
        dst.put_u32(msg.msg_id());
        dst.put_slice(msg.data());
        Ok(())
    }
}

impl PacketCodec for DataPack {
    fn head_len(&self) -> usize {
        HEADER_LEN
    }

    fn encode(&self, msg: &Message) -> AppResult<Bytes> {
        DataPack::encode(self, msg)
    }

    fn decode_header(&self, header: &[u8]) -> AppResult<Message> {
        DataPack::decode_header(self, header)
    }
}

impl Decoder for DataPack {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Message>> {
        decode_frame(&*self, src)
    }
}

impl Encoder<Message> for DataPack {
    type Error = AppError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> AppResult<()> {
        Self::write_frame(&msg, dst)
    }
}
