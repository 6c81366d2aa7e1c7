//! Execution Orchestrator.
//!
//! Drives one admitted submission through
//! `Provisioning -> (Building ->) Running -> Finalizing` and always produces
//! exactly one [`ExecutionResult`]. The container lease is released before the
//! result is handed back.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    constants::{CONTAINER_LABEL, CONTAINER_NAME_PREFIX, KEEPALIVE_SLACK_SECS, SCRATCH_DIR},
    core::{
        classifier::classify,
        domain::{
            ExecutionResult, OutputCaps, Phase, RawOutcome, Submission, SubmissionId,
            SubmissionState,
        },
        lifecycle::{ContainerLease, LifecycleManager},
        pipeline::{
            compiling::{self, BuildOutcome},
            running::{self, run_budget},
        },
        toolchain::Toolchain,
        traits::engine::{ContainerSpec, EngineError},
    },
};

#[derive(Clone, Debug)]
pub struct ExecutionPolicy {
    pub build_time_limit: Duration,
    pub min_run_allowance: Duration,
    pub output: OutputCaps,
    /// Provisioning is the only stage ever retried.
    pub provision_attempts: u32,
    pub scratch_size_bytes: u64,
    pub sandbox_user: Option<String>,
}

/// Progress notifications for one submission. Intermediate states are
/// dropped when the receiver lags or is gone; they never hold up execution.
#[derive(Clone, Debug)]
pub struct StateSender {
    submission_id: SubmissionId,
    tx: mpsc::Sender<SubmissionState>,
}

impl StateSender {
    pub fn new(submission_id: SubmissionId, tx: mpsc::Sender<SubmissionState>) -> Self {
        Self { submission_id, tx }
    }

    pub fn send(&self, state: SubmissionState) {
        if let Err(err) = self.tx.try_send(state) {
            tracing::debug!(submission_id = %self.submission_id, "State update dropped: {}", err);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Orchestrator {
    lifecycle: LifecycleManager,
    policy: ExecutionPolicy,
}

impl Orchestrator {
    pub fn new(lifecycle: LifecycleManager, policy: ExecutionPolicy) -> Self {
        Self { lifecycle, policy }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    #[tracing::instrument(
        skip_all,
        fields(submission_id = %submission.id, language = %submission.language)
    )]
    pub async fn execute(
        &self,
        submission: &Submission,
        toolchain: &Toolchain,
        cancel: &CancellationToken,
        updates: &StateSender,
    ) -> ExecutionResult {
        let started = Instant::now();
        tracing::debug!(
            waited_ms = (Utc::now() - submission.accepted_at).num_milliseconds(),
            "Starting submission"
        );

        updates.send(SubmissionState::Provisioning);
        let (phase, outcome) = match self.provision(submission, toolchain, cancel).await {
            Ok(mut lease) => {
                let decided = self
                    .run_phases(&lease, submission, toolchain, cancel, updates)
                    .await;
                updates.send(SubmissionState::Finalizing);
                if let Err(err) = lease.release().await {
                    tracing::error!(error = %err, "Failed to release container");
                }
                decided
            }
            Err(outcome) => {
                updates.send(SubmissionState::Finalizing);
                (Phase::Provisioning, outcome)
            }
        };

        let status = classify(phase, &outcome);
        tracing::info!(
            ?status,
            ?phase,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            "Submission finished"
        );

        ExecutionResult {
            submission_id: submission.id,
            status,
            outcome,
            wall_time: started.elapsed(),
            finished_at: Utc::now(),
        }
    }

    /// Provisions a container with the sources and stdin staged. On failure
    /// returns the outcome to report instead.
    ///
    /// Cancellation is only observed between engine calls: an interrupted
    /// `create_container` would lose the id of a container that exists.
    async fn provision(
        &self,
        submission: &Submission,
        toolchain: &Toolchain,
        cancel: &CancellationToken,
    ) -> Result<ContainerLease, RawOutcome> {
        let attempts = self.policy.provision_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(RawOutcome::timed_out());
            }

            let spec = self.container_spec(submission, toolchain, attempt);
            match self.try_provision(&spec, submission).await {
                Ok(mut lease) if cancel.is_cancelled() => {
                    tracing::info!(container = %lease.id(), "Cancelled while provisioning");
                    if let Err(err) = lease.release().await {
                        tracing::error!(error = %err, "Failed to release container");
                    }
                    return Err(RawOutcome::timed_out());
                }
                Ok(lease) => return Ok(lease),
                Err(err) => {
                    tracing::warn!(attempt, attempts, error = %err, "Provisioning failed");
                    last_err = Some(err);
                }
            }
        }

        let msg = last_err.map(|err| err.to_string()).unwrap_or_default();
        Err(RawOutcome::engine_fault(msg))
    }

    async fn try_provision(
        &self,
        spec: &ContainerSpec,
        submission: &Submission,
    ) -> Result<ContainerLease, EngineError> {
        let mut lease = self.lifecycle.provision(spec).await?;

        let sources = submission
            .files
            .iter()
            .map(|file| (format!("{SCRATCH_DIR}/{}", file.name), file.contents.as_str()));
        let stdin = submission
            .stdin
            .as_deref()
            .map(|payload| (running::stdin_path(), payload));

        for (path, contents) in sources.chain(stdin) {
            if let Err(err) = lease.write_file(&path, contents).await {
                if let Err(release_err) = lease.release().await {
                    tracing::error!(error = %release_err, "Failed to release container");
                }
                return Err(err);
            }
        }

        Ok(lease)
    }

    async fn run_phases(
        &self,
        lease: &ContainerLease,
        submission: &Submission,
        toolchain: &Toolchain,
        cancel: &CancellationToken,
        updates: &StateSender,
    ) -> (Phase, RawOutcome) {
        if cancel.is_cancelled() {
            return (Phase::Provisioning, RawOutcome::timed_out());
        }

        let mut build_elapsed = Duration::ZERO;
        if toolchain.is_compiled() {
            updates.send(SubmissionState::Building);
            let built = compiling::build(
                lease,
                toolchain,
                &submission.file_names(),
                self.policy.build_time_limit,
                self.policy.output,
                cancel,
            )
            .await;
            match built {
                BuildOutcome::Failed(outcome) => return (Phase::Building, outcome),
                built => build_elapsed = built.elapsed(),
            }
        }

        updates.send(SubmissionState::Running);
        let budget = run_budget(
            submission.limits.time,
            build_elapsed,
            self.policy.min_run_allowance,
        );
        let outcome = running::run(
            lease,
            toolchain,
            submission,
            budget,
            self.policy.output,
            cancel,
        )
        .await;
        (Phase::Running, outcome)
    }

    fn container_spec(
        &self,
        submission: &Submission,
        toolchain: &Toolchain,
        attempt: u32,
    ) -> ContainerSpec {
        let keepalive = submission.limits.time
            + self.policy.build_time_limit
            + Duration::from_secs(KEEPALIVE_SLACK_SECS);

        ContainerSpec {
            name: format!("{CONTAINER_NAME_PREFIX}-{}-{attempt}", submission.id),
            image: toolchain.image.clone(),
            labels: HashMap::from([(CONTAINER_LABEL.to_string(), submission.id.to_string())]),
            env: toolchain.env_pairs(),
            user: self.policy.sandbox_user.clone(),
            working_dir: SCRATCH_DIR.to_string(),
            memory_bytes: submission.limits.memory_bytes,
            cpu_millis: submission.limits.cpu_millis,
            pids_limit: submission.limits.pids,
            scratch_dir: SCRATCH_DIR.to_string(),
            scratch_size_bytes: self.policy.scratch_size_bytes,
            keepalive,
        }
    }
}
