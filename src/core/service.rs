use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::{Config, ConfigError},
    constants::{CONTAINER_LABEL, HEALTH_PING_TIMEOUT_SECS, MIN_MEMORY_BYTES, UPDATES_BUFFER},
    core::{
        admission::{AdmissionController, Overloaded, Ticket},
        classifier::classify,
        domain::{
            ExecutionLimits, ExecutionResult, ExecutionStatus, Phase, RawOutcome, SourceFile,
            Submission, SubmissionId, SubmissionState,
        },
        lifecycle::{LifecycleManager, LifecycleSnapshot},
        orchestrator::{Orchestrator, StateSender},
        toolchain::{Language, LookupError, Toolchain, ToolchainRegistry},
        traits::engine::{ContainerEngine, EngineError},
    },
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub language: String,
    pub source: String,
    pub stdin: Option<String>,
    pub time_limit_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    /// Extra files written next to the main source, by name.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Overloaded(#[from] Overloaded),
    #[error("Service is shutting down")]
    ShuttingDown,
}

impl From<LookupError> for SubmitError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::UnsupportedLanguage(id) => SubmitError::UnsupportedLanguage(id),
        }
    }
}

fn invalid(msg: impl Into<String>) -> SubmitError {
    SubmitError::InvalidRequest(msg.into())
}

/// Server-side bounds applied to every request.
#[derive(Clone, Debug)]
pub struct LimitsPolicy {
    pub default_time: Duration,
    pub max_time: Duration,
    pub default_memory_bytes: u64,
    pub max_memory_bytes: u64,
    pub cpu_millis: u64,
    pub pids: u32,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub max_extra_files: usize,
}

impl LimitsPolicy {
    /// Validates the request and fixes the limits it will run under.
    /// Requested limits above the server maxima are clamped, not rejected.
    pub fn accept(
        &self,
        request: &SubmitRequest,
        main_source: &str,
    ) -> Result<(ExecutionLimits, Vec<SourceFile>), SubmitError> {
        let time = match request.time_limit_ms {
            Some(0) => return Err(invalid("time limit must be positive")),
            Some(ms) => Duration::from_millis(ms).min(self.max_time),
            None => self.default_time,
        };
        let memory_bytes = match request.memory_limit_bytes {
            Some(bytes) if bytes < MIN_MEMORY_BYTES => {
                return Err(invalid(format!(
                    "memory limit must be at least {MIN_MEMORY_BYTES} bytes"
                )));
            }
            Some(bytes) => bytes.min(self.max_memory_bytes),
            None => self.default_memory_bytes,
        };

        check_text("source", &request.source, self.max_source_bytes)?;
        if let Some(stdin) = &request.stdin {
            check_text("stdin", stdin, self.max_stdin_bytes)?;
        }
        if request.files.len() > self.max_extra_files {
            return Err(invalid(format!(
                "at most {} extra files are allowed",
                self.max_extra_files
            )));
        }

        let mut files = vec![SourceFile {
            name: main_source.to_string(),
            contents: request.source.clone(),
        }];
        for (name, contents) in &request.files {
            check_file_name(name, main_source)?;
            check_text(name, contents, self.max_source_bytes)?;
            files.push(SourceFile {
                name: name.clone(),
                contents: contents.clone(),
            });
        }

        let limits = ExecutionLimits {
            time,
            memory_bytes,
            cpu_millis: self.cpu_millis,
            pids: self.pids,
        };
        Ok((limits, files))
    }
}

fn check_text(what: &str, text: &str, max_bytes: usize) -> Result<(), SubmitError> {
    if text.len() > max_bytes {
        return Err(invalid(format!("{what} exceeds {max_bytes} bytes")));
    }
    if text.contains('\0') {
        return Err(invalid(format!("{what} contains NUL bytes")));
    }
    Ok(())
}

fn check_file_name(name: &str, main_source: &str) -> Result<(), SubmitError> {
    let valid = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.starts_with('.')
        && !name.contains('\0');
    if !valid {
        return Err(invalid(format!("invalid file name {name:?}")));
    }
    if name == main_source {
        return Err(invalid(format!("{name:?} clashes with the main source file")));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Immediate,
    Queued { position: usize },
}

/// Caller's side of an accepted submission.
#[derive(Debug)]
pub struct SubmissionHandle {
    pub id: SubmissionId,
    pub admission: Admission,
    /// State transitions, ending with `Done`.
    pub updates: mpsc::Receiver<SubmissionState>,
    result: oneshot::Receiver<ExecutionResult>,
}

impl SubmissionHandle {
    /// Waits for the final result without following the updates.
    pub async fn result(self) -> ExecutionResult {
        let id = self.id;
        self.result.await.unwrap_or_else(|_| {
            tracing::error!(submission_id = %id, "Submission task ended without a result");
            ExecutionResult {
                submission_id: id,
                status: ExecutionStatus::InternalError,
                outcome: RawOutcome::engine_fault("submission task ended without a result"),
                wall_time: Duration::ZERO,
                finished_at: Utc::now(),
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub engine: Result<(), EngineError>,
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
    pub containers: LifecycleSnapshot,
}

/// Entry point for submissions: validation, admission and one task per
/// accepted submission.
#[derive(Clone, Debug)]
pub struct ExecutionService {
    registry: Arc<ToolchainRegistry>,
    admission: AdmissionController,
    orchestrator: Arc<Orchestrator>,
    limits: LimitsPolicy,
    inflight: Arc<DashMap<SubmissionId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl ExecutionService {
    pub fn new(
        registry: ToolchainRegistry,
        admission: AdmissionController,
        orchestrator: Orchestrator,
        limits: LimitsPolicy,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            admission,
            orchestrator: Arc::new(orchestrator),
            limits,
            inflight: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(
        config: &Config,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self, ConfigError> {
        let registry = ToolchainRegistry::new(&config.toolchains)?;
        let lifecycle = LifecycleManager::new(
            engine,
            config.cleanup_policy(),
            config.engine.pull_missing_images,
        );
        Ok(Self::new(
            registry,
            AdmissionController::new(
                config.admission.max_concurrent,
                config.admission.max_queue_depth,
            ),
            Orchestrator::new(lifecycle, config.execution_policy()),
            config.limits_policy(),
        ))
    }

    /// Validates and admits a submission, then executes it in the background.
    /// Rejections happen here; once a handle is returned exactly one
    /// `ExecutionResult` follows.
    #[tracing::instrument(skip_all, fields(language = %request.language))]
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmissionHandle, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let (language, toolchain) = self.registry.lookup(&request.language)?;
        let (limits, files) = self.limits.accept(&request, &toolchain.source_file)?;
        let ticket = self.admission.try_admit().inspect_err(|err| {
            tracing::warn!("Submission rejected: {}", err);
        })?;

        let submission = Submission {
            id: Uuid::new_v4(),
            accepted_at: Utc::now(),
            language,
            files,
            stdin: request.stdin,
            limits,
        };
        let id = submission.id;
        let cancel = self.shutdown.child_token();
        let inflight = InflightEntry::register(&self.inflight, id, cancel.clone());

        let (updates_tx, updates) = mpsc::channel(UPDATES_BUFFER);
        let (result_tx, result) = oneshot::channel();
        let admission = match &ticket {
            Ticket::Admitted(_) => Admission::Immediate,
            Ticket::Queued(queued) => {
                let position = queued.position();
                let _ = updates_tx.try_send(SubmissionState::Queued { position });
                Admission::Queued { position }
            }
        };
        tracing::info!(submission_id = %id, ?admission, "Submission accepted");

        let task = SubmissionTask {
            submission,
            toolchain,
            orchestrator: self.orchestrator.clone(),
            inflight,
            cancel,
            updates: updates_tx,
        };
        tokio::spawn(async move {
            let result = task.run(ticket).await;
            let _ = result_tx.send(result);
        });

        Ok(SubmissionHandle {
            id,
            admission,
            updates,
            result,
        })
    }

    /// Cancels a queued or running submission. Returns false when it is not
    /// (or no longer) in flight.
    pub fn cancel(&self, id: SubmissionId) -> bool {
        match self.inflight.get(&id) {
            Some(token) => {
                tracing::info!(submission_id = %id, "Cancelling submission");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let ping = self.orchestrator.lifecycle().engine().ping();
        let timeout = Duration::from_secs(HEALTH_PING_TIMEOUT_SECS);
        let engine = match tokio::time::timeout(timeout, ping).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Unreachable {
                operation: "ping",
                msg: "timed out".to_string(),
            }),
        };

        HealthReport {
            engine,
            running: self.admission.running(),
            queued: self.admission.queued(),
            max_concurrent: self.admission.max_concurrent(),
            max_queue_depth: self.admission.max_queue_depth(),
            containers: self.orchestrator.lifecycle().snapshot(),
        }
    }

    pub fn languages(&self) -> Vec<(Language, Arc<Toolchain>)> {
        self.registry.languages()
    }

    pub async fn sweep_orphans(&self) -> Result<usize, EngineError> {
        self.orchestrator
            .lifecycle()
            .sweep_orphans(CONTAINER_LABEL)
            .await
    }

    /// Stops admitting, cancels everything in flight and waits up to `grace`
    /// for those submissions to release their containers.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let wait = async {
            while !self.inflight.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        match tokio::time::timeout(grace, wait).await {
            Ok(()) => tracing::info!("All submissions finished"),
            Err(_) => tracing::warn!(
                remaining = self.inflight.len(),
                "Shutdown grace period elapsed with submissions in flight"
            ),
        }
    }
}

/// Registration in the in-flight map, removed when dropped so that a task
/// that dies still leaves the map.
struct InflightEntry {
    id: SubmissionId,
    inflight: Arc<DashMap<SubmissionId, CancellationToken>>,
}

impl InflightEntry {
    fn register(
        inflight: &Arc<DashMap<SubmissionId, CancellationToken>>,
        id: SubmissionId,
        cancel: CancellationToken,
    ) -> Self {
        inflight.insert(id, cancel);
        Self {
            id,
            inflight: inflight.clone(),
        }
    }
}

impl Drop for InflightEntry {
    fn drop(&mut self) {
        self.inflight.remove(&self.id);
    }
}

struct SubmissionTask {
    submission: Submission,
    toolchain: Arc<Toolchain>,
    orchestrator: Arc<Orchestrator>,
    inflight: InflightEntry,
    cancel: CancellationToken,
    updates: mpsc::Sender<SubmissionState>,
}

impl SubmissionTask {
    async fn run(self, ticket: Ticket) -> ExecutionResult {
        let id = self.submission.id;
        let slot = match ticket {
            Ticket::Admitted(slot) => Some(slot),
            Ticket::Queued(queued) => queued.wait(&self.cancel).await,
        };

        let result = match &slot {
            Some(_) => {
                let sender = StateSender::new(id, self.updates.clone());
                self.orchestrator
                    .execute(&self.submission, &self.toolchain, &self.cancel, &sender)
                    .await
            }
            None => {
                tracing::info!(submission_id = %id, "Cancelled while queued");
                let outcome = RawOutcome::timed_out();
                ExecutionResult {
                    submission_id: id,
                    status: classify(Phase::Provisioning, &outcome),
                    outcome,
                    wall_time: Duration::ZERO,
                    finished_at: Utc::now(),
                }
            }
        };

        drop(self.inflight);
        let _ = self
            .updates
            .send(SubmissionState::Done(result.clone()))
            .await;
        drop(slot);
        result
    }
}
