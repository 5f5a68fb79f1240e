//! # gearman-client
//!
//! Client-side runtime for the Gearman job-server protocol.
//!
//! This crate provides:
//! - Non-blocking TCP connections with per-connection send/receive state
//! - A `poll(2)`-driven multiplex engine with blocking and non-blocking modes
//! - Synchronous helpers: echo, job submission, status polling
//! - An installable log/event-watch/allocator hook surface
//!
//! # Blocking and non-blocking modes
//!
//! The mode is per-engine. In blocking mode (the default) send, receive, and
//! flush drive the socket to completion. With
//! [`EngineOption::NonBlocking`] set they return
//! [`Progress::Pending`]/`Ok(None)` instead of suspending, and the caller
//! makes progress by calling [`Engine::wait`] and pulling ready connections
//! from [`Engine::ready`]. Only `wait` ever suspends the thread.
//!
//! # Example
//!
//! ```no_run
//! use gearman_client::Client;
//!
//! # fn main() -> Result<(), gearman_client::ClientError> {
//! let mut client = Client::new("localhost", gearman_protocol::DEFAULT_PORT);
//! client.echo(b"hello")?;
//!
//! let job = client.submit_job_background("reverse", "", b"workload")?;
//! loop {
//!     let status = client.job_status(&job)?;
//!     if !status.known {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod engine;
pub mod error;
pub mod poll;
pub mod sink;

pub use client::{Client, JobHandle, JobStatus};
pub use connection::{Connection, ConnectionId, READ_BUFFER_SIZE};
pub use engine::{Engine, EngineOption, MAX_ERROR_SIZE};
pub use error::{ClientError, Progress};
pub use poll::PollEvents;
pub use sink::{EventWatch, LogSink, PayloadAllocator, Verbose};
