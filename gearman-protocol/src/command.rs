//! The Gearman command table.
//!
//! Every packet carries one command code. The payload layout is fixed per
//! command: a number of NUL-separated arguments, optionally followed by an
//! opaque workload that runs to the end of the frame. The decoder needs this
//! table to split a payload back into arguments.

use crate::error::ProtocolError;
use std::fmt;

struct CommandInfo {
    code: u32,
    name: &'static str,
    args: usize,
    workload: bool,
}

/// Command codes of the binary Gearman protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    CanDo,
    CantDo,
    ResetAbilities,
    PreSleep,
    Noop,
    SubmitJob,
    JobCreated,
    GrabJob,
    NoJob,
    JobAssign,
    WorkStatus,
    WorkComplete,
    WorkFail,
    GetStatus,
    EchoReq,
    EchoRes,
    SubmitJobBg,
    Error,
    StatusRes,
    SubmitJobHigh,
    SetClientId,
    CanDoTimeout,
    AllYours,
    WorkException,
    OptionReq,
    OptionRes,
    WorkData,
    WorkWarning,
    GrabJobUniq,
    JobAssignUniq,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
    SubmitJobSched,
    SubmitJobEpoch,
}

impl Command {
    fn info(&self) -> CommandInfo {
        macro_rules! info {
            ($code:expr, $name:expr, $args:expr, $workload:expr) => {
                CommandInfo {
                    code: $code,
                    name: $name,
                    args: $args,
                    workload: $workload,
                }
            };
        }

        match self {
            Command::CanDo => info!(1, "CAN_DO", 1, false),
            Command::CantDo => info!(2, "CANT_DO", 1, false),
            Command::ResetAbilities => info!(3, "RESET_ABILITIES", 0, false),
            Command::PreSleep => info!(4, "PRE_SLEEP", 0, false),
            Command::Noop => info!(6, "NOOP", 0, false),
            Command::SubmitJob => info!(7, "SUBMIT_JOB", 2, true),
            Command::JobCreated => info!(8, "JOB_CREATED", 1, false),
            Command::GrabJob => info!(9, "GRAB_JOB", 0, false),
            Command::NoJob => info!(10, "NO_JOB", 0, false),
            Command::JobAssign => info!(11, "JOB_ASSIGN", 2, true),
            Command::WorkStatus => info!(12, "WORK_STATUS", 3, false),
            Command::WorkComplete => info!(13, "WORK_COMPLETE", 1, true),
            Command::WorkFail => info!(14, "WORK_FAIL", 1, false),
            Command::GetStatus => info!(15, "GET_STATUS", 1, false),
            Command::EchoReq => info!(16, "ECHO_REQ", 0, true),
            Command::EchoRes => info!(17, "ECHO_RES", 0, true),
            Command::SubmitJobBg => info!(18, "SUBMIT_JOB_BG", 2, true),
            Command::Error => info!(19, "ERROR", 2, false),
            Command::StatusRes => info!(20, "STATUS_RES", 5, false),
            Command::SubmitJobHigh => info!(21, "SUBMIT_JOB_HIGH", 2, true),
            Command::SetClientId => info!(22, "SET_CLIENT_ID", 1, false),
            Command::CanDoTimeout => info!(23, "CAN_DO_TIMEOUT", 2, false),
            Command::AllYours => info!(24, "ALL_YOURS", 0, false),
            Command::WorkException => info!(25, "WORK_EXCEPTION", 1, true),
            Command::OptionReq => info!(26, "OPTION_REQ", 1, false),
            Command::OptionRes => info!(27, "OPTION_RES", 1, false),
            Command::WorkData => info!(28, "WORK_DATA", 1, true),
            Command::WorkWarning => info!(29, "WORK_WARNING", 1, true),
            Command::GrabJobUniq => info!(30, "GRAB_JOB_UNIQ", 0, false),
            Command::JobAssignUniq => info!(31, "JOB_ASSIGN_UNIQ", 3, true),
            Command::SubmitJobHighBg => info!(32, "SUBMIT_JOB_HIGH_BG", 2, true),
            Command::SubmitJobLow => info!(33, "SUBMIT_JOB_LOW", 2, true),
            Command::SubmitJobLowBg => info!(34, "SUBMIT_JOB_LOW_BG", 2, true),
            Command::SubmitJobSched => info!(35, "SUBMIT_JOB_SCHED", 7, true),
            Command::SubmitJobEpoch => info!(36, "SUBMIT_JOB_EPOCH", 3, true),
        }
    }

    /// Looks up a command by its wire code.
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        const ALL: &[Command] = &[
            Command::CanDo,
            Command::CantDo,
            Command::ResetAbilities,
            Command::PreSleep,
            Command::Noop,
            Command::SubmitJob,
            Command::JobCreated,
            Command::GrabJob,
            Command::NoJob,
            Command::JobAssign,
            Command::WorkStatus,
            Command::WorkComplete,
            Command::WorkFail,
            Command::GetStatus,
            Command::EchoReq,
            Command::EchoRes,
            Command::SubmitJobBg,
            Command::Error,
            Command::StatusRes,
            Command::SubmitJobHigh,
            Command::SetClientId,
            Command::CanDoTimeout,
            Command::AllYours,
            Command::WorkException,
            Command::OptionReq,
            Command::OptionRes,
            Command::WorkData,
            Command::WorkWarning,
            Command::GrabJobUniq,
            Command::JobAssignUniq,
            Command::SubmitJobHighBg,
            Command::SubmitJobLow,
            Command::SubmitJobLowBg,
            Command::SubmitJobSched,
            Command::SubmitJobEpoch,
        ];

        ALL.iter()
            .find(|command| command.info().code == code)
            .copied()
            .ok_or(ProtocolError::UnknownCommand(code))
    }

    /// Returns the wire code of this command.
    pub fn code(&self) -> u32 {
        self.info().code
    }

    /// Returns the protocol name of this command (e.g. `"SUBMIT_JOB"`).
    pub fn name(&self) -> &'static str {
        self.info().name
    }

    /// Returns the number of fixed, NUL-separated arguments.
    pub fn arg_count(&self) -> usize {
        self.info().args
    }

    /// Returns whether a trailing opaque workload follows the fixed arguments.
    pub fn has_workload(&self) -> bool {
        self.info().workload
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
