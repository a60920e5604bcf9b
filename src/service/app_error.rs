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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// network errors, fatal to the connection they occur on
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("tls error: {0}")]
    TlsError(String),

    /// protocol errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("packet of length {length} exceeds max packet size {max}")]
    PacketTooLarge { length: u32, max: u32 },

    /// dispatch errors
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("handler for msg id {0} registered twice")]
    DuplicateRoute(u32),
}

impl AppError {
    /// Errors that end a connection without being retried.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            AppError::MalformedProtocol(_) | AppError::PacketTooLarge { .. }
        )
    }
}
