//! Incremental packet decoding.

use crate::error::ProtocolError;
use crate::packet::Packet;
use bytes::BytesMut;

/// Decodes packets from a byte stream, tolerating arbitrary read boundaries.
///
/// Feed socket reads in with [`extend`](Decoder::extend) and pull complete
/// packets out with [`decode_packet`](Decoder::decode_packet). Bytes past the
/// current frame stay buffered for the next one.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next packet from the buffer.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        Packet::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer, discarding any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
