//! High-level client API.
//!
//! [`Client`] wraps an engine with a single job-server connection and drives
//! the synchronous request/response flows: echo, job submission (foreground,
//! background, and scheduled-after-epoch), and status polling.

use crate::connection::ConnectionId;
use crate::engine::Engine;
use crate::error::ClientError;
use gearman_protocol::{Command, Magic, Packet, ProtocolError};
use std::fmt;

/// Opaque identifier the server assigns to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side view of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    /// The server recognizes the handle.
    pub known: bool,
    /// A worker currently holds the job.
    pub running: bool,
    /// Worker-reported progress; zero before the first status update.
    pub numerator: u32,
    pub denominator: u32,
}

/// Synchronous client for one job server.
pub struct Client {
    engine: Engine,
    conn: ConnectionId,
}

impl Client {
    /// Creates a client for the given server. The TCP connection is
    /// established lazily on the first request.
    pub fn new(host: &str, port: u16) -> Self {
        let mut engine = Engine::new();
        let conn = engine.add_connection(host, port);
        Self { engine, conn }
    }

    /// Bounds every blocking operation to `timeout_ms` milliseconds;
    /// negative waits indefinitely.
    pub fn set_timeout(&mut self, timeout_ms: i32) {
        self.engine.set_timeout(timeout_ms);
    }

    /// The underlying engine, for callers that need direct packet I/O.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// The most recent error message, if any operation failed.
    pub fn last_error(&self) -> &str {
        self.engine.last_error()
    }

    /// Round-trips `workload` through the server and verifies the reply.
    pub fn echo(&mut self, workload: &[u8]) -> Result<(), ClientError> {
        self.engine.echo(workload)
    }

    /// Submits a job and waits for its handle.
    pub fn submit_job(
        &mut self,
        function: &str,
        unique: &str,
        workload: &[u8],
    ) -> Result<JobHandle, ClientError> {
        let packet = Packet::with_args(
            Magic::Request,
            Command::SubmitJob,
            &[function.as_bytes(), unique.as_bytes(), workload],
        )?;
        self.submit(&packet)
    }

    /// Submits a background job: the server queues it and the client is not
    /// told about completion. Poll [`job_status`](Client::job_status) with
    /// the returned handle instead.
    pub fn submit_job_background(
        &mut self,
        function: &str,
        unique: &str,
        workload: &[u8],
    ) -> Result<JobHandle, ClientError> {
        let packet = Packet::with_args(
            Magic::Request,
            Command::SubmitJobBg,
            &[function.as_bytes(), unique.as_bytes(), workload],
        )?;
        self.submit(&packet)
    }

    /// Submits a background job to run no earlier than the given Unix
    /// timestamp (seconds).
    pub fn submit_job_epoch(
        &mut self,
        function: &str,
        unique: &str,
        workload: &[u8],
        epoch_secs: u64,
    ) -> Result<JobHandle, ClientError> {
        let epoch = epoch_secs.to_string();
        let packet = Packet::with_args(
            Magic::Request,
            Command::SubmitJobEpoch,
            &[function.as_bytes(), unique.as_bytes(), epoch.as_bytes(), workload],
        )?;
        self.submit(&packet)
    }

    fn submit(&mut self, packet: &Packet) -> Result<JobHandle, ClientError> {
        let reply = self.engine.request(self.conn, packet)?;
        match reply.command() {
            Command::JobCreated => {
                let handle = reply.arg(0).unwrap_or(&[]);
                Ok(JobHandle(String::from_utf8_lossy(handle).into_owned()))
            }
            Command::Error => Err(server_error(&reply)),
            got => Err(ClientError::UnexpectedReply {
                expected: Command::JobCreated,
                got,
            }),
        }
    }

    /// Asks the server for the current status of a job.
    pub fn job_status(&mut self, handle: &JobHandle) -> Result<JobStatus, ClientError> {
        let packet = Packet::with_args(Magic::Request, Command::GetStatus, &[handle.as_bytes()])?;
        let reply = self.engine.request(self.conn, &packet)?;
        match reply.command() {
            Command::StatusRes => Ok(JobStatus {
                known: parse_flag(&reply, 1)?,
                running: parse_flag(&reply, 2)?,
                numerator: parse_counter(&reply, 3)?,
                denominator: parse_counter(&reply, 4)?,
            }),
            Command::Error => Err(server_error(&reply)),
            got => Err(ClientError::UnexpectedReply {
                expected: Command::StatusRes,
                got,
            }),
        }
    }
}

fn server_error(reply: &Packet) -> ClientError {
    let code = String::from_utf8_lossy(reply.arg(0).unwrap_or(&[])).into_owned();
    let message = String::from_utf8_lossy(reply.arg(1).unwrap_or(&[])).into_owned();
    ClientError::Server { code, message }
}

fn malformed(reply: &Packet) -> ClientError {
    ClientError::Protocol(ProtocolError::MalformedPayload {
        command: reply.command().name(),
    })
}

/// Boolean status fields come across as ASCII `"0"` or `"1"`.
fn parse_flag(reply: &Packet, index: usize) -> Result<bool, ClientError> {
    match reply.arg(index) {
        Some(b"0") => Ok(false),
        Some(b"1") => Ok(true),
        _ => Err(malformed(reply)),
    }
}

fn parse_counter(reply: &Packet, index: usize) -> Result<u32, ClientError> {
    let bytes = reply.arg(index).ok_or_else(|| malformed(reply))?;
    let text = std::str::from_utf8(bytes).map_err(|_| malformed(reply))?;
    text.parse::<u32>().map_err(|_| malformed(reply))
}
