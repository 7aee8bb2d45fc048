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

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIo(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// marker error: not enough buffered bytes to decode, wait for more I/O
    #[error("need more bytes")]
    NeedRecv,

    /// wire protocol errors, always fatal for the connection
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("packet too large: {0}")]
    PacketTooLarge(String),

    #[error("send buffer full: {0}")]
    SendBufferFull(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// rpc level errors, surfaced to the caller, connection stays alive
    #[error("rpc call failed with code {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("rpc call timed out: {0}")]
    CallTimeout(String),
}

impl EngineError {
    /// `NeedRecv` is a wait signal, never a failure.
    pub fn is_need_recv(&self) -> bool {
        matches!(self, EngineError::NeedRecv)
    }

    /// Protocol violations and transport errors tear the connection down,
    /// rpc level errors do not.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(
            self,
            EngineError::NeedRecv
                | EngineError::Rpc { .. }
                | EngineError::CallTimeout(_)
        )
    }
}
