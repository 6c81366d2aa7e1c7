use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{
    collector::OutputCollector,
    domain::{OutputCaps, RawOutcome},
    lifecycle::ContainerLease,
};

/// Exit status of a process killed with SIGKILL.
const SIGKILL_EXIT: i64 = 128 + 9;

/// One command to run inside a leased container under a watchdog.
#[derive(Debug)]
pub struct PhaseCommand<'a> {
    pub command: Vec<String>,
    pub env: Vec<String>,
    /// Staged file to redirect into the command's stdin.
    pub stdin: Option<&'a str>,
    pub budget: Duration,
    pub caps: OutputCaps,
}

enum Interrupt {
    Deadline,
    Cancelled,
}

/// Runs the command and gathers everything it printed.
///
/// The watchdog is armed once the command has started. When it fires, or
/// `cancel` does, the container is killed and the outcome is marked timed
/// out with whatever output had arrived so far.
#[tracing::instrument(
    skip_all,
    fields(container = %lease.id(), budget_ms = phase.budget.as_millis() as u64)
)]
pub async fn run_phase(
    lease: &ContainerLease,
    phase: PhaseCommand<'_>,
    cancel: &CancellationToken,
) -> RawOutcome {
    let PhaseCommand {
        command,
        env,
        stdin,
        budget,
        caps,
    } = phase;

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        stream = lease.run(command, env, stdin) => Some(stream),
    };
    let mut stream = match started {
        None => return RawOutcome::timed_out(),
        Some(Ok(stream)) => stream,
        Some(Err(err)) => {
            tracing::warn!(error = %err, "Failed to start command");
            return RawOutcome::engine_fault(err.to_string());
        }
    };

    let started_at = Instant::now();
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);

    let mut collector = OutputCollector::new(caps);
    let mut interrupted = None;
    let mut exit_code = None;
    let mut engine_fault = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interrupted = Some(Interrupt::Cancelled);
                break;
            }
            _ = &mut deadline => {
                interrupted = Some(Interrupt::Deadline);
                break;
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    if let Some(code) = collector.observe(event) {
                        exit_code = code;
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "Output stream failed");
                    engine_fault = Some(err.to_string());
                    break;
                }
                None => {
                    engine_fault = Some("output stream ended without an exit status".to_string());
                    break;
                }
            },
        }
    }
    let duration = started_at.elapsed();
    drop(stream);

    if let Some(interrupt) = interrupted {
        match interrupt {
            Interrupt::Deadline => tracing::info!("Time limit exceeded, terminating"),
            Interrupt::Cancelled => tracing::info!("Cancelled, terminating"),
        }
        if let Err(err) = lease.terminate().await {
            tracing::warn!(error = %err, "Failed to terminate container");
        }
        let (stdout, stderr) = collector.finish();
        return RawOutcome {
            stdout,
            stderr,
            exit_code: None,
            duration,
            timed_out: true,
            ..RawOutcome::default()
        };
    }

    let resource_exceeded = engine_fault.is_none()
        && exit_code != Some(0)
        && out_of_memory(lease, exit_code).await;

    let (stdout, stderr) = collector.finish();
    RawOutcome {
        stdout,
        stderr,
        exit_code,
        duration,
        timed_out: false,
        resource_exceeded,
        engine_fault,
    }
}

/// The engine's OOM flag, or a SIGKILL nobody on our side sent.
async fn out_of_memory(lease: &ContainerLease, exit_code: Option<i64>) -> bool {
    match lease.status().await {
        Ok(status) if status.oom_killed => true,
        Ok(_) => exit_code == Some(SIGKILL_EXIT) && !lease.was_terminated(),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to inspect container");
            exit_code == Some(SIGKILL_EXIT) && !lease.was_terminated()
        }
    }
}
