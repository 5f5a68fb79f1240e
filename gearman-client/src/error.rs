//! Client error types.

use crate::connection::ConnectionId;
use gearman_protocol::{Command, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error("timeout reached")]
    Timeout,

    #[error("no active file descriptors")]
    NoActiveFds,

    #[error("corruption during echo")]
    EchoCorruption,

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("unexpected {got} reply, expected {expected}")]
    UnexpectedReply { expected: Command, got: Command },

    #[error("server error: {code} - {message}")]
    Server { code: String, message: String },
}

impl ClientError {
    /// Returns whether the affected connection is unusable after this error.
    ///
    /// [`Timeout`](ClientError::Timeout) and [`NoActiveFds`](ClientError::NoActiveFds)
    /// leave connection state untouched; I/O failures and a lost peer do not.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::ConnectionLost)
    }
}

/// Outcome of a non-blocking send or flush.
///
/// `Pending` is a control-flow signal, not a failure: the operation would
/// have suspended, and the caller should retry once the engine reports the
/// connection ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Progress {
    /// The operation ran to completion.
    Complete,
    /// The operation made partial progress and wants another turn.
    Pending,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        matches!(self, Progress::Complete)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Progress::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ClientError::ConnectionLost.is_fatal_for_connection());
        assert!(
            ClientError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
                .is_fatal_for_connection()
        );

        assert!(!ClientError::Timeout.is_fatal_for_connection());
        assert!(!ClientError::NoActiveFds.is_fatal_for_connection());
        assert!(!ClientError::EchoCorruption.is_fatal_for_connection());
    }

    #[test]
    fn test_progress_accessors() {
        assert!(Progress::Complete.is_complete());
        assert!(!Progress::Complete.is_pending());
        assert!(Progress::Pending.is_pending());
    }
}
