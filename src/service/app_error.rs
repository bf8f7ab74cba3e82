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

use std::fmt;
use std::time::Duration;

pub type NetResult<T> = Result<T, NetError>;

/// Numeric error codes shared with the rest of the storage service.
///
/// The first six values are part of the service-wide error table and must not move.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    Event = 1,
    InvalidParam = 2,
    InvalidCall = 3,
    ThrowException = 4,
    NoMemory = 5,
    NotFound = 6,
    Timeout = 7,
    ConnectionClosed = 8,
    ProtocolViolation = 9,
    Io = 10,
    Fatal = 11,
}

impl ErrorCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// double start, stop when stopped, call from an io thread ...
    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("handle {0} not found")]
    NotFound(u64),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection {0} closed")]
    ConnectionClosed(u64),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("handler rejected message: {0}")]
    Handler(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// a collaborator (callback, allocator) panicked or failed in a foreign way
    #[error("collaborator fault: {0}")]
    Collaborator(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl NetError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NetError::InvalidParam(_) => ErrorCode::InvalidParam,
            NetError::InvalidCall(_) => ErrorCode::InvalidCall,
            NetError::NotFound(_) => ErrorCode::NotFound,
            NetError::NoMemory(_) => ErrorCode::NoMemory,
            NetError::Timeout(_) => ErrorCode::Timeout,
            NetError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            NetError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            NetError::Handler(_) => ErrorCode::InvalidCall,
            NetError::Io(_) => ErrorCode::Io,
            NetError::Config(_) | NetError::Collaborator(_) => ErrorCode::ThrowException,
            NetError::Fatal(_) => ErrorCode::Fatal,
        }
    }

    /// Turns the payload of a caught panic into a collaborator fault.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> NetError {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic with unknown payload".to_string()
        };
        NetError::Collaborator(message)
    }
}
