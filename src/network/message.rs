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

use std::sync::Arc;

use bytes::Bytes;

use super::Connection;

/// One decoded unit of communication.
///
/// `length` mirrors `data.len()`; it only differs transiently while a frame is being
/// decoded and the header has been read but the payload has not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    msg_id: u32,
    length: u32,
    data: Bytes,
}

impl Message {
    /// Payloads longer than `u32::MAX` are accepted here but rejected by the codec.
    pub fn new(msg_id: u32, data: impl Into<Bytes>) -> Message {
        let data = data.into();
        let length = payload_len(&data);
        Message {
            msg_id,
            length,
            data,
        }
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn data_len(&self) -> u32 {
        self.length
    }

    pub fn set_msg_id(&mut self, msg_id: u32) {
        self.msg_id = msg_id;
    }

    /// Replaces the payload and recomputes the length.
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        self.length = payload_len(&data);
        self.data = data;
    }

    /// Sets the announced length without a payload, for `PacketCodec::decode_header`.
    pub fn set_data_len(&mut self, length: u32) {
        self.length = length;
    }
}

fn payload_len(data: &Bytes) -> u32 {
    u32::try_from(data.len()).unwrap_or(u32::MAX)
}

/// A message bound to the connection it arrived on, alive for one handler invocation.
#[derive(Debug, Clone)]
pub struct Request {
    connection: Arc<Connection>,
    message: Message,
}

impl Request {
    pub fn new(connection: Arc<Connection>, message: Message) -> Request {
        Request {
            connection,
            message,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn msg_id(&self) -> u32 {
        self.message.msg_id()
    }

    pub fn data(&self) -> &Bytes {
        self.message.data()
    }
}
