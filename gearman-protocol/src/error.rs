//! Protocol error types.

use thiserror::Error;

/// Violations detected while building or parsing packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected \\0REQ or \\0RES, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unknown command code: {0}")]
    UnknownCommand(u32),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u32 },

    #[error("{command} takes {expected} arguments, got {given}")]
    ArgumentCount {
        command: &'static str,
        expected: usize,
        given: usize,
    },

    #[error("{command} argument {index} may not contain NUL")]
    EmbeddedNul { command: &'static str, index: usize },

    #[error("malformed payload for {command}")]
    MalformedPayload { command: &'static str },
}
