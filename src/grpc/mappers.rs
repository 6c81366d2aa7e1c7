use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tonic::Status;
use uuid::Uuid;

use crate::core::{
    domain::{self, ExecutionStatus, SubmissionId, SubmissionState},
    service::{self, HealthReport, SubmitError},
    toolchain::{Language, Toolchain},
};
use crate::grpc::models::{self, Empty, submission_update};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid submission id {id:?}: {source}")]
    InvalidId {
        id: String,
        #[source]
        source: uuid::Error,
    },
    #[error("Submission {submission_id} failed internally: {msg}")]
    Internal {
        submission_id: SubmissionId,
        msg: String,
    },
}

impl From<ConversionError> for Status {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::InvalidId { .. } => Status::invalid_argument(err.to_string()),
            ConversionError::Internal { .. } => Status::internal(err.to_string()),
        }
    }
}

impl From<SubmitError> for Status {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::UnsupportedLanguage(_) | SubmitError::InvalidRequest(_) => {
                Status::invalid_argument(err.to_string())
            }
            SubmitError::Overloaded(_) => Status::resource_exhausted(err.to_string()),
            SubmitError::ShuttingDown => Status::unavailable(err.to_string()),
        }
    }
}

impl From<models::SubmitRequest> for service::SubmitRequest {
    fn from(req: models::SubmitRequest) -> Self {
        Self {
            language: req.language,
            source: req.source,
            stdin: req.stdin,
            time_limit_ms: req.time_limit_ms,
            memory_limit_bytes: req.memory_limit_bytes,
            files: req.files.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

impl TryFrom<models::CancelRequest> for SubmissionId {
    type Error = ConversionError;

    fn try_from(req: models::CancelRequest) -> Result<Self, ConversionError> {
        Uuid::parse_str(req.submission_id.trim()).map_err(|source| ConversionError::InvalidId {
            id: req.submission_id,
            source,
        })
    }
}

impl From<ExecutionStatus> for models::ResultStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => models::ResultStatus::Success,
            ExecutionStatus::RuntimeError => models::ResultStatus::RuntimeError,
            ExecutionStatus::BuildError => models::ResultStatus::BuildError,
            ExecutionStatus::TimedOut => models::ResultStatus::TimedOut,
            ExecutionStatus::ResourceExceeded => models::ResultStatus::ResourceExceeded,
            ExecutionStatus::InternalError => models::ResultStatus::InternalError,
        }
    }
}

impl From<domain::ExecutionResult> for models::ExecutionResult {
    fn from(result: domain::ExecutionResult) -> Self {
        Self {
            submission_id: result.submission_id.to_string(),
            status: models::ResultStatus::from(result.status) as i32,
            stdout: result.outcome.stdout.to_string_lossy(),
            stdout_truncated: result.outcome.stdout.truncated,
            stderr: result.outcome.stderr.to_string_lossy(),
            stderr_truncated: result.outcome.stderr.truncated,
            exit_code: result.outcome.exit_code,
            duration_ms: result.duration().as_millis() as u64,
            wall_time_ms: result.wall_time.as_millis() as u64,
            finished_at: Some(models::chrono_to_prost(result.finished_at)),
        }
    }
}

/// Internal errors leave the stream as a failed call, not as a result.
impl TryFrom<(SubmissionId, SubmissionState)> for models::SubmissionUpdate {
    type Error = ConversionError;

    fn try_from((id, state): (SubmissionId, SubmissionState)) -> Result<Self, ConversionError> {
        let state = match state {
            SubmissionState::Queued { position } => {
                submission_update::State::Queued(models::Queued {
                    position: u32::try_from(position).unwrap_or(u32::MAX),
                })
            }
            SubmissionState::Provisioning => submission_update::State::Provisioning(Empty {}),
            SubmissionState::Building => submission_update::State::Building(Empty {}),
            SubmissionState::Running => submission_update::State::Running(Empty {}),
            SubmissionState::Finalizing => submission_update::State::Finalizing(Empty {}),
            SubmissionState::Done(result) if result.status == ExecutionStatus::InternalError => {
                return Err(ConversionError::Internal {
                    submission_id: id,
                    msg: result
                        .outcome
                        .engine_fault
                        .unwrap_or_else(|| "unknown failure".to_string()),
                });
            }
            SubmissionState::Done(result) => submission_update::State::Done(result.into()),
        };

        Ok(Self {
            submission_id: id.to_string(),
            at: Some(models::chrono_to_prost(Utc::now())),
            state: Some(state),
        })
    }
}

impl From<HealthReport> for models::HealthResponse {
    fn from(report: HealthReport) -> Self {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        Self {
            engine_reachable: report.engine.is_ok(),
            engine_error: report.engine.err().map(|err| err.to_string()),
            running: count(report.running),
            queued: count(report.queued),
            max_concurrent: count(report.max_concurrent),
            max_queue_depth: count(report.max_queue_depth),
            containers_provisioned: report.containers.provisioned,
            containers_released: report.containers.released,
            containers_leaked: report.containers.leaked,
        }
    }
}

impl From<(Language, Arc<Toolchain>)> for models::LanguageInfo {
    fn from((language, toolchain): (Language, Arc<Toolchain>)) -> Self {
        Self {
            id: language.id().to_string(),
            aliases: language.aliases().iter().map(|a| a.to_string()).collect(),
            image: toolchain.image.clone(),
            compiled: toolchain.is_compiled(),
        }
    }
}
