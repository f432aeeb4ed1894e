//! Node error types.

use relay_core::{CryptoError, FrameDecodeError, FrameEncodeError, ResultCode, TransferError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Relay answered the handshake with a non-success code, or a routing invariant failed.
    #[error("rejected: {0}")]
    Rejected(ResultCode),

    #[error("timed out during {phase}")]
    Timeout { phase: &'static str },

    /// No announced endpoint of a transfer sender accepted a connection.
    #[error("none of {attempted} transfer endpoints reachable")]
    Unreachable { attempted: usize },

    #[error("session closed")]
    Closed,

    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("frame decode error: {0}")]
    Decode(#[from] FrameDecodeError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub fn timeout(phase: &'static str) -> Self {
        Self::Timeout { phase }
    }

    /// Result code carried by this error, if it is one of the protocol's closed set.
    pub fn code(&self) -> Option<ResultCode> {
        match self {
            Self::Rejected(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<ResultCode> for NodeError {
    fn from(code: ResultCode) -> Self {
        Self::Rejected(code)
    }
}
