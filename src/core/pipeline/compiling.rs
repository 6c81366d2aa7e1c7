use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{OutputCaps, RawOutcome},
    lifecycle::ContainerLease,
    pipeline::phase::{PhaseCommand, run_phase},
    toolchain::Toolchain,
};

#[derive(Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The toolchain has no build step.
    Skipped,
    Built { elapsed: Duration },
    /// Anything but a clean exit. The outcome decides how it is classified.
    Failed(RawOutcome),
}

impl BuildOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            BuildOutcome::Skipped => Duration::ZERO,
            BuildOutcome::Built { elapsed } => *elapsed,
            BuildOutcome::Failed(outcome) => outcome.duration,
        }
    }
}

/// Runs the toolchain's build command against the staged sources, bounded by
/// its own time limit.
#[tracing::instrument(skip_all, fields(container = %lease.id()))]
pub async fn build(
    lease: &ContainerLease,
    toolchain: &Toolchain,
    sources: &[String],
    time_limit: Duration,
    caps: OutputCaps,
    cancel: &CancellationToken,
) -> BuildOutcome {
    let Some(command) = toolchain.build_command(sources) else {
        return BuildOutcome::Skipped;
    };
    tracing::debug!("Building: {:?}", command);

    let outcome = run_phase(
        lease,
        PhaseCommand {
            command,
            env: toolchain.env_pairs(),
            stdin: None,
            budget: time_limit,
            caps,
        },
        cancel,
    )
    .await;

    let clean = outcome.exit_code == Some(0)
        && !outcome.timed_out
        && !outcome.resource_exceeded
        && outcome.engine_fault.is_none();
    if clean {
        tracing::debug!(elapsed_ms = outcome.duration.as_millis() as u64, "Build succeeded");
        BuildOutcome::Built {
            elapsed: outcome.duration,
        }
    } else {
        tracing::debug!("Build failed: {:?}", outcome.exit_code);
        BuildOutcome::Failed(outcome)
    }
}
