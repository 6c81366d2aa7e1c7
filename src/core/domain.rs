use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::toolchain::Language;

pub type SubmissionId = Uuid;

/// Limits fixed when a submission is accepted. Never renegotiated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub time: Duration,
    pub memory_bytes: u64,
    pub cpu_millis: u64,
    pub pids: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub id: SubmissionId,
    pub accepted_at: DateTime<Utc>,
    pub language: Language,
    /// Main source first, then any extra files in name order.
    pub files: Vec<SourceFile>,
    pub stdin: Option<String>,
    pub limits: ExecutionLimits,
}

impl Submission {
    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|file| file.name.clone()).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputCaps {
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub data: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// What a phase observed, before any interpretation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOutcome {
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// `None` when the process was killed by us or never reported one.
    pub exit_code: Option<i64>,
    pub duration: Duration,
    pub timed_out: bool,
    pub resource_exceeded: bool,
    /// Set when the container engine failed underneath the phase.
    pub engine_fault: Option<String>,
}

impl RawOutcome {
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn engine_fault(msg: impl Into<String>) -> Self {
        Self {
            engine_fault: Some(msg.into()),
            ..Self::default()
        }
    }
}

/// Stage a submission was in when its outcome was decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Provisioning,
    Building,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    BuildError,
    TimedOut,
    ResourceExceeded,
    InternalError,
}

/// Terminal record for a submission. Produced exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub submission_id: SubmissionId,
    pub status: ExecutionStatus,
    pub outcome: RawOutcome,
    /// Provisioning to finalization, cleanup included.
    pub wall_time: Duration,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Wall clock of the phase that decided the outcome.
    pub fn duration(&self) -> Duration {
        self.outcome.duration
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmissionState {
    Queued { position: usize },
    Provisioning,
    Building,
    Running,
    Finalizing,
    Done(ExecutionResult),
}
