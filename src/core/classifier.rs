use crate::core::domain::{ExecutionStatus, Phase, RawOutcome};

/// Maps what a phase observed to the status reported to the caller.
///
/// Precedence: timeout, then orchestration faults, then resource violations,
/// then the exit status. A timed out submission stays `TimedOut` no matter
/// what it printed or how it exited.
pub fn classify(phase: Phase, outcome: &RawOutcome) -> ExecutionStatus {
    if outcome.timed_out {
        return ExecutionStatus::TimedOut;
    }
    if phase == Phase::Provisioning || outcome.engine_fault.is_some() {
        return ExecutionStatus::InternalError;
    }
    if outcome.resource_exceeded {
        return ExecutionStatus::ResourceExceeded;
    }

    match (phase, outcome.exit_code) {
        (Phase::Building, _) => ExecutionStatus::BuildError,
        (_, Some(0)) => ExecutionStatus::Success,
        _ => ExecutionStatus::RuntimeError,
    }
}
