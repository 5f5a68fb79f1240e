//! # gearman-protocol
//!
//! Wire protocol implementation for the Gearman job-server protocol.
//!
//! This crate provides:
//! - Binary packet framing (magic, command code, big-endian payload length)
//! - The command table with per-command argument layouts
//! - Incremental, boundary-safe packet decoding
//! - Protocol error types
//!
//! The crate is pure: it operates on byte buffers only and performs no I/O.

pub mod codec;
pub mod command;
pub mod error;
pub mod packet;

pub use codec::Decoder;
pub use command::Command;
pub use error::ProtocolError;
pub use packet::{Magic, Packet, PACKET_HEADER_SIZE};

/// Default TCP port for a Gearman job server.
pub const DEFAULT_PORT: u16 = 4730;

/// Maximum packet payload size (64 MiB).
///
/// Enforced symmetrically: packets this large cannot be built, and a frame
/// header declaring more than this is rejected as a protocol violation.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;
