use std::collections::HashMap;
use std::time::Duration;

use futures::stream::BoxStream;

/// Everything the engine needs to create one sandbox container. The isolation
/// profile itself (no network, read-only root, no capabilities) is not
/// negotiable and is applied by the engine implementation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub working_dir: String,
    pub memory_bytes: u64,
    pub cpu_millis: u64,
    pub pids_limit: u32,
    pub scratch_dir: String,
    pub scratch_size_bytes: u64,
    /// Lifetime of the idle process that keeps the container up between
    /// commands.
    pub keepalive: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
}

impl ExecRequest {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// Output of a command as it arrives. `Exited` is always the last item of a
/// stream that was not cut short.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(Option<i64>),
}

pub type ExecStream = BoxStream<'static, Result<ExecEvent, EngineError>>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub oom_killed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Container engine unreachable during {operation}: {msg}")]
    Unreachable { operation: &'static str, msg: String },
    #[error("Not found during {operation}: {msg}")]
    NotFound { operation: &'static str, msg: String },
    #[error("Container engine rejected {operation}: {msg}")]
    Rejected { operation: &'static str, msg: String },
}

/// The container daemon connection. Injected into the lifecycle manager so
/// tests can substitute it; implementations must tolerate concurrent calls
/// from many submissions.
///
/// `kill_container` on a stopped container and `remove_container` on a
/// missing one succeed.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ContainerEngine: std::fmt::Debug + Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecStream, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, EngineError>;

    async fn kill_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Ids of every container, running or not, carrying `label`.
    async fn list_containers(&self, label: &str) -> Result<Vec<String>, EngineError>;
}
