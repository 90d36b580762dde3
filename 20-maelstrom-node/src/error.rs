use std::io;

use thiserror::Error;

use crate::message::{ErrorCode, MessageId, NodeId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("rpc to {dest} timed out after {attempts} attempt(s) (last msg_id {msg_id})")]
    RpcTimeout {
        dest: NodeId,
        msg_id: MessageId,
        attempts: u32,
    },

    #[error("{dest} replied with error {code}: {text}")]
    Remote {
        dest: NodeId,
        code: u32,
        text: String,
    },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("server was already started")]
    AlreadyStarted,

    #[error("server has not been started")]
    NotStarted,
}

impl Error {
    /// Error code reported to a peer whose request failed with this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Malformed(_) => ErrorCode::MalformedRequest,
            Error::RpcTimeout { .. } => ErrorCode::Timeout,
            Error::Remote { code, .. } => ErrorCode::from_code(*code).unwrap_or(ErrorCode::Crash),
            Error::Cancelled => ErrorCode::TemporarilyUnavailable,
            Error::Encode(_) | Error::Transport(_) | Error::AlreadyStarted | Error::NotStarted => {
                ErrorCode::Crash
            }
        }
    }

    /// Whether another attempt of the same rpc could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RpcTimeout { .. } | Error::Remote { .. })
    }
}
