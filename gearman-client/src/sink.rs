//! Pluggable engine hooks.
//!
//! Each hook is a single-method trait; implementors carry whatever state
//! they need. All hooks are optional. Without a [`LogSink`] the engine keeps
//! errors in its last-error buffer and prints log lines to stdout; without a
//! [`PayloadAllocator`] receive buffers come from the global allocator.

use crate::connection::ConnectionId;
use crate::poll::PollEvents;
use bytes::BytesMut;

/// Log verbosity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbose {
    Fatal,
    Error,
    Info,
    Debug,
    Crazy,
}

impl Verbose {
    pub fn name(&self) -> &'static str {
        match self {
            Verbose::Fatal => "FATAL",
            Verbose::Error => "ERROR",
            Verbose::Info => "INFO",
            Verbose::Debug => "DEBUG",
            Verbose::Crazy => "CRAZY",
        }
    }
}

/// Receives engine log lines instead of the default stdout/last-error path.
pub trait LogSink {
    fn log(&self, verbose: Verbose, message: &str);
}

/// Observes connection interest changes, so an external event loop can
/// mirror the engine's registrations.
pub trait EventWatch {
    fn watch(&self, connection: ConnectionId, events: PollEvents);
}

/// Supplies receive-payload buffers.
pub trait PayloadAllocator {
    fn allocate(&self, len: usize) -> BytesMut;
}
