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

/// Coarse classification used when a connection fails.
///
/// Transport and protocol failures take the same cleanup path; they are kept
/// apart because a protocol failure means an incompatible or hostile peer,
/// not a network blip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transport,
    Protocol,
    Resource,
    Local,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// transport errors
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    /// protocol errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    #[error("peer rejected: {0}")]
    PeerRejected(String),

    /// resource errors
    #[error("reactor closed")]
    ReactorClosed,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl AppError {
    pub fn class(&self) -> FailureClass {
        match self {
            AppError::IoError(_) | AppError::DetailedIoError(_) | AppError::ConnectionClosed => {
                FailureClass::Transport
            }
            AppError::MalformedProtocol(_)
            | AppError::UnsupportedVersion(_)
            | AppError::MessageTooLarge(_)
            | AppError::PeerRejected(_) => FailureClass::Protocol,
            AppError::ReactorClosed | AppError::ResourceExhausted(_) => FailureClass::Resource,
            AppError::IllegalStateError(_)
            | AppError::InvalidValue(_)
            | AppError::InvalidAddress(_)
            | AppError::ConfigFileError(_) => FailureClass::Local,
        }
    }

    pub fn is_protocol(&self) -> bool {
        self.class() == FailureClass::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_failure_class() {
        let err: AppError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err.class(), FailureClass::Transport);
        assert!(AppError::UnsupportedVersion(7).is_protocol());
        assert!(AppError::MessageTooLarge("big".into()).is_protocol());
        assert_eq!(AppError::ReactorClosed.class(), FailureClass::Resource);
        assert!(!AppError::ConnectionClosed.is_protocol());
    }
}
