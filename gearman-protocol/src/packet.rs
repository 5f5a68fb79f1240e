//! Binary packet format.
//!
//! Packet layout (12-byte header + payload):
//!
//! ```text
//! +--------+---------+-------------+
//! | magic  | command | payload_len |
//! | 4 bytes| 4 bytes |   4 bytes   |
//! +--------+---------+-------------+
//! | payload (payload_len bytes)    |
//! +--------------------------------+
//! ```
//!
//! Command and payload length are big-endian. The payload holds the command's
//! fixed arguments separated by NUL bytes; the last argument (a workload for
//! commands that carry one) runs to the end of the frame with no terminator.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed packet header in bytes (4+4+4 = 12).
pub const PACKET_HEADER_SIZE: usize = 12;

/// Magic bytes opening a request frame: `\0REQ`.
pub const MAGIC_REQUEST: [u8; 4] = *b"\0REQ";

/// Magic bytes opening a response frame: `\0RES`.
pub const MAGIC_RESPONSE: [u8; 4] = *b"\0RES";

/// Frame direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            Magic::Request => &MAGIC_REQUEST,
            Magic::Response => &MAGIC_RESPONSE,
        }
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self, ProtocolError> {
        if bytes == MAGIC_REQUEST {
            Ok(Magic::Request)
        } else if bytes == MAGIC_RESPONSE {
            Ok(Magic::Response)
        } else {
            Err(ProtocolError::InvalidMagic(bytes))
        }
    }
}

/// A parsed protocol packet.
///
/// The arguments are cheap sub-slices of one shared payload allocation;
/// dropping the packet releases the payload once the last view goes away.
#[derive(Debug, Clone)]
pub struct Packet {
    magic: Magic,
    command: Command,
    args: Vec<Bytes>,
}

impl Packet {
    /// Builds a packet from its arguments, validating the layout against the
    /// command table.
    ///
    /// `args` must contain the command's fixed arguments, plus the workload
    /// as the final entry for commands that carry one. Every argument except
    /// the last must be free of NUL bytes.
    pub fn with_args(magic: Magic, command: Command, args: &[&[u8]]) -> Result<Self, ProtocolError> {
        let expected = command.arg_count() + usize::from(command.has_workload());
        if args.len() != expected {
            return Err(ProtocolError::ArgumentCount {
                command: command.name(),
                expected,
                given: args.len(),
            });
        }

        for (index, arg) in args.iter().enumerate() {
            if index + 1 < args.len() && arg.contains(&0) {
                return Err(ProtocolError::EmbeddedNul {
                    command: command.name(),
                    index,
                });
            }
        }

        let separators = args.len().saturating_sub(1);
        let size = args.iter().map(|arg| arg.len()).sum::<usize>() + separators;
        if size > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: size as u64,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut data = BytesMut::with_capacity(size);
        for (index, arg) in args.iter().enumerate() {
            if index > 0 {
                data.put_u8(0);
            }
            data.put_slice(arg);
        }
        let data = data.freeze();

        let mut views = Vec::with_capacity(args.len());
        let mut offset = 0;
        for arg in args {
            views.push(data.slice(offset..offset + arg.len()));
            offset += arg.len() + 1;
        }

        Ok(Self {
            magic,
            command,
            args: views,
        })
    }

    /// Encodes the packet into bytes ready to be written to the wire.
    pub fn encode(&self) -> BytesMut {
        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload_len);

        buf.put_slice(self.magic.as_bytes());
        buf.put_u32(self.command.code());
        buf.put_u32(payload_len as u32);

        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                buf.put_u8(0);
            }
            buf.put_slice(arg);
        }

        buf
    }

    /// Decodes one packet from the front of a buffer.
    ///
    /// Returns `Ok(Some(packet))` if a complete frame was decoded,
    /// `Ok(None)` if more bytes are needed, or `Err` on a protocol
    /// violation. Bytes past the declared frame length are left in the
    /// buffer; they belong to the next frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming
        let magic_bytes: [u8; 4] = buf[0..4].try_into().unwrap();
        let magic = Magic::from_bytes(magic_bytes)?;

        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let command = Command::from_code(code)?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: u64::from(payload_len),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let payload_len = payload_len as usize;
        if buf.len() < PACKET_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(PACKET_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();
        let args = split_payload(command, payload)?;

        Ok(Some(Self {
            magic,
            command,
            args,
        }))
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// All arguments, the workload included.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|arg| arg.as_ref())
    }

    /// The trailing workload, for commands that carry one.
    pub fn workload(&self) -> Option<&[u8]> {
        if self.command.has_workload() {
            self.args.last().map(|arg| arg.as_ref())
        } else {
            None
        }
    }

    /// Total payload size on the wire (arguments plus separators).
    pub fn payload_len(&self) -> usize {
        let separators = self.args.len().saturating_sub(1);
        self.args.iter().map(|arg| arg.len()).sum::<usize>() + separators
    }
}

/// Splits a raw payload into arguments using the command's layout.
fn split_payload(command: Command, payload: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let total = command.arg_count() + usize::from(command.has_workload());
    if total == 0 {
        if !payload.is_empty() {
            return Err(ProtocolError::MalformedPayload {
                command: command.name(),
            });
        }
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(total);
    let mut rest = payload;
    for _ in 0..total - 1 {
        let pos = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::MalformedPayload {
                command: command.name(),
            })?;
        args.push(rest.slice(..pos));
        rest = rest.slice(pos + 1..);
    }
    args.push(rest);

    Ok(args)
}
