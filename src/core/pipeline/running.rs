use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    constants::{SCRATCH_DIR, STDIN_FILE},
    core::{
        domain::{OutputCaps, RawOutcome, Submission},
        lifecycle::ContainerLease,
        pipeline::phase::{PhaseCommand, run_phase},
        toolchain::Toolchain,
    },
};

/// Time left for the run phase: the submission's limit minus what the build
/// used, but never less than `min_allowance`.
pub fn run_budget(total: Duration, build_elapsed: Duration, min_allowance: Duration) -> Duration {
    total.saturating_sub(build_elapsed).max(min_allowance)
}

/// Where the submission's stdin payload is staged during provisioning.
pub fn stdin_path() -> String {
    format!("{SCRATCH_DIR}/{STDIN_FILE}")
}

#[tracing::instrument(skip_all, fields(container = %lease.id(), submission_id = %submission.id))]
pub async fn run(
    lease: &ContainerLease,
    toolchain: &Toolchain,
    submission: &Submission,
    budget: Duration,
    caps: OutputCaps,
    cancel: &CancellationToken,
) -> RawOutcome {
    let command = toolchain.run_command(&submission.file_names());
    let stdin_path = stdin_path();
    tracing::debug!("Running: {:?}", command);

    run_phase(
        lease,
        PhaseCommand {
            command,
            env: toolchain.env_pairs(),
            stdin: submission.stdin.as_ref().map(|_| stdin_path.as_str()),
            budget,
            caps,
        },
        cancel,
    )
    .await
}
