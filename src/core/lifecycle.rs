//! Container Lifecycle Manager.
//!
//! Every successful `create_container` produces a [`ContainerLease`], and a
//! lease always ends in exactly one removal: explicitly through
//! [`ContainerLease::release`], or from `Drop` when the owning future is
//! abandoned (panic, cancellation, early return).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;

use crate::constants::{STAGING_CHUNK_BYTES, STAGING_ENV};
use crate::core::traits::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, EngineError, ExecEvent, ExecRequest,
    ExecStream,
};

#[derive(Clone, Debug)]
pub struct CleanupPolicy {
    /// Removal attempts made before the result is returned.
    pub attempts: u32,
    pub backoff: Duration,
    /// Further attempts made in the background once a container is declared
    /// leaked.
    pub background_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("Container {id} still present after {attempts} removal attempts: {source}")]
    Deferred {
        id: String,
        attempts: u32,
        #[source]
        source: EngineError,
    },
}

#[derive(Debug, Default)]
struct LifecycleStats {
    provisioned: AtomicU64,
    released: AtomicU64,
    leaked: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub provisioned: u64,
    pub released: u64,
    /// Containers whose removal failed and is still being retried.
    pub leaked: u64,
}

#[derive(Clone, Debug)]
pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    policy: CleanupPolicy,
    stats: Arc<LifecycleStats>,
    pull_missing_images: bool,
}

impl LifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        policy: CleanupPolicy,
        pull_missing_images: bool,
    ) -> Self {
        Self {
            engine,
            policy,
            stats: Arc::new(LifecycleStats::default()),
            pull_missing_images,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            provisioned: self.stats.provisioned.load(Ordering::SeqCst),
            released: self.stats.released.load(Ordering::SeqCst),
            leaked: self.stats.leaked.load(Ordering::SeqCst),
        }
    }

    /// Creates and starts a container. If starting fails the container is
    /// released before the error is returned.
    #[tracing::instrument(skip_all, fields(name = %spec.name, image = %spec.image))]
    pub async fn provision(&self, spec: &ContainerSpec) -> Result<ContainerLease, EngineError> {
        if self.pull_missing_images {
            self.engine.ensure_image(&spec.image).await?;
        }

        let id = self.engine.create_container(spec).await?;
        self.stats.provisioned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(container = %id, "Container created");

        let mut lease = ContainerLease {
            id,
            engine: self.engine.clone(),
            policy: self.policy.clone(),
            stats: self.stats.clone(),
            terminated: AtomicBool::new(false),
            released: false,
        };

        if let Err(err) = self.engine.start_container(&lease.id).await {
            tracing::warn!(container = %lease.id, error = %err, "Failed to start container");
            if let Err(release_err) = lease.release().await {
                tracing::error!(error = %release_err, "Failed to release unstarted container");
            }
            return Err(err);
        }

        Ok(lease)
    }

    /// Removes containers left behind by a previous process.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_orphans(&self, label: &str) -> Result<usize, EngineError> {
        let orphans = self.engine.list_containers(label).await?;
        let mut removed = 0;
        for id in orphans {
            match self.engine.remove_container(&id).await {
                Ok(()) => {
                    tracing::info!(container = %id, "Removed orphaned container");
                    removed += 1;
                }
                Err(err) => {
                    tracing::warn!(container = %id, error = %err, "Failed to remove orphan")
                }
            }
        }
        Ok(removed)
    }
}

/// Exclusive handle on one provisioned container.
#[derive(Debug)]
pub struct ContainerLease {
    id: String,
    engine: Arc<dyn ContainerEngine>,
    policy: CleanupPolicy,
    stats: Arc<LifecycleStats>,
    terminated: AtomicBool,
    released: bool,
}

impl ContainerLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecStream, EngineError> {
        self.engine.exec(&self.id, request).await
    }

    /// Starts `command`. With `stdin_path` its standard input is redirected
    /// from that already staged file, so the command sees EOF at its end.
    pub async fn run(
        &self,
        command: Vec<String>,
        env: Vec<String>,
        stdin_path: Option<&str>,
    ) -> Result<ExecStream, EngineError> {
        let cmd = match stdin_path {
            Some(stdin_path) => {
                let mut cmd = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    r#"exec "$@" < "$0""#.to_string(),
                    stdin_path.to_string(),
                ];
                cmd.extend(command);
                cmd
            }
            None => command,
        };

        self.exec(&ExecRequest::new(cmd).with_env(env)).await
    }

    /// Writes `contents` to `path` inside the container, in chunks small
    /// enough to travel through the exec environment.
    #[tracing::instrument(
        skip(self, contents),
        fields(container = %self.id, bytes = contents.len())
    )]
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<(), EngineError> {
        let mut offset = 0;
        loop {
            let end = chunk_end(contents, offset, STAGING_CHUNK_BYTES);
            let redirect = if offset == 0 { ">" } else { ">>" };
            let request = ExecRequest::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(r#"printf '%s' "${STAGING_ENV}" {redirect} "$0""#),
                path.to_string(),
            ])
            .with_env(vec![format!("{STAGING_ENV}={}", &contents[offset..end])]);

            let stream = self.exec(&request).await?;
            expect_success(stream, "stage_file").await?;

            offset = end;
            if offset >= contents.len() {
                return Ok(());
            }
        }
    }

    pub async fn status(&self) -> Result<ContainerStatus, EngineError> {
        self.engine.inspect_container(&self.id).await
    }

    /// Kills everything running in the container. Calling it again is a no-op.
    pub async fn terminate(&self) -> Result<(), EngineError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(container = %self.id, "Terminating container");
        let result = self.engine.kill_container(&self.id).await;
        if result.is_err() {
            self.terminated.store(false, Ordering::SeqCst);
        }
        result
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Removes the container and its scratch storage. Calling it again is a
    /// no-op. On persistent failure the removal continues in the background
    /// and the error is only reported.
    pub async fn release(&mut self) -> Result<(), ReleaseError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        release_container(
            self.engine.clone(),
            self.id.clone(),
            self.policy.clone(),
            self.stats.clone(),
        )
        .await
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let release = release_container(
            self.engine.clone(),
            self.id.clone(),
            self.policy.clone(),
            self.stats.clone(),
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    container = %self.id,
                    "Lease dropped unreleased, removing in background"
                );
                handle.spawn(async move {
                    if let Err(err) = release.await {
                        tracing::error!(error = %err, "Background release failed");
                    }
                });
            }
            Err(_) => {
                self.stats.leaked.fetch_add(1, Ordering::SeqCst);
                tracing::error!(container = %self.id, "Container leaked: no runtime to remove it");
            }
        }
    }
}

async fn release_container(
    engine: Arc<dyn ContainerEngine>,
    id: String,
    policy: CleanupPolicy,
    stats: Arc<LifecycleStats>,
) -> Result<(), ReleaseError> {
    let mut last_err = None;
    for attempt in 1..=policy.attempts.max(1) {
        match engine.remove_container(&id).await {
            Ok(()) => {
                stats.released.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(container = %id, attempt, "Container removed");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(
                    container = %id,
                    attempt,
                    error = %err,
                    "Failed to remove container"
                );
                last_err = Some(err);
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
        }
    }

    stats.leaked.fetch_add(1, Ordering::SeqCst);
    tracing::error!(container = %id, "Container leaked, retrying removal in background");
    tokio::spawn(retry_in_background(
        engine,
        id.clone(),
        policy.clone(),
        stats,
    ));

    Err(ReleaseError::Deferred {
        id,
        attempts: policy.attempts,
        source: last_err.unwrap_or(EngineError::Rejected {
            operation: "remove_container",
            msg: "no attempt made".to_string(),
        }),
    })
}

async fn retry_in_background(
    engine: Arc<dyn ContainerEngine>,
    id: String,
    policy: CleanupPolicy,
    stats: Arc<LifecycleStats>,
) {
    let mut delay = policy.backoff.max(Duration::from_millis(100));
    for attempt in 1..=policy.background_attempts {
        tokio::time::sleep(delay).await;
        match engine.remove_container(&id).await {
            Ok(()) => {
                stats.released.fetch_add(1, Ordering::SeqCst);
                stats.leaked.fetch_sub(1, Ordering::SeqCst);
                tracing::info!(container = %id, attempt, "Leaked container removed");
                return;
            }
            Err(err) => {
                tracing::warn!(container = %id, attempt, error = %err, "Background removal failed");
                delay = (delay * 2).min(Duration::from_secs(60));
            }
        }
    }
    tracing::error!(container = %id, "Giving up on leaked container");
}

/// Largest end index not past `offset + max` that falls on a char boundary.
fn chunk_end(contents: &str, offset: usize, max: usize) -> usize {
    let mut end = (offset + max).min(contents.len());
    while end > offset && !contents.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Drains a command's output and fails unless it exited with status 0.
async fn expect_success(
    mut stream: ExecStream,
    operation: &'static str,
) -> Result<(), EngineError> {
    let mut stderr = Vec::new();
    while let Some(event) = stream.next().await {
        match event? {
            ExecEvent::Stdout(_) => {}
            ExecEvent::Stderr(bytes) => stderr.extend_from_slice(&bytes),
            ExecEvent::Exited(Some(0)) => return Ok(()),
            ExecEvent::Exited(code) => {
                return Err(EngineError::Rejected {
                    operation,
                    msg: format!(
                        "exit status {code:?}: {}",
                        String::from_utf8_lossy(&stderr).trim()
                    ),
                });
            }
        }
    }

    Err(EngineError::Rejected {
        operation,
        msg: "command ended without an exit status".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::engine::MockContainerEngine;
    use crate::stubs::engine::EngineStub;

    fn policy() -> CleanupPolicy {
        CleanupPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
            background_attempts: 2,
        }
    }

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandbox-run-test".to_string(),
            image: "python:3.12-slim".to_string(),
            labels: Default::default(),
            env: vec![],
            user: None,
            working_dir: "/sandbox".to_string(),
            memory_bytes: 64 * 1024 * 1024,
            cpu_millis: 1000,
            pids_limit: 32,
            scratch_dir: "/sandbox".to_string(),
            scratch_size_bytes: 1024 * 1024,
            keepalive: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_provision_then_release_once() {
        let engine = Arc::new(EngineStub::new());
        let manager = LifecycleManager::new(engine.clone(), policy(), true);

        let mut lease = manager.provision(&spec()).await.unwrap();
        assert_eq!(engine.live_containers().len(), 1);

        lease.release().await.unwrap();
        lease.release().await.unwrap();

        assert!(engine.live_containers().is_empty());
        assert_eq!(engine.remove_calls(), 1);
        assert_eq!(
            manager.snapshot(),
            LifecycleSnapshot {
                provisioned: 1,
                released: 1,
                leaked: 0
            }
        );
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let engine = Arc::new(EngineStub::new());
        let manager = LifecycleManager::new(engine.clone(), policy(), false);

        let mut lease = manager.provision(&spec()).await.unwrap();
        lease.terminate().await.unwrap();
        lease.terminate().await.unwrap();
        assert!(lease.was_terminated());
        assert_eq!(engine.kill_calls(), 1);

        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_releases_container() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_create_container()
            .times(1)
            .returning(|_| Ok("c1".to_string()));
        engine.expect_start_container().times(1).returning(|_| {
            Err(EngineError::Rejected {
                operation: "start_container",
                msg: "no such image".to_string(),
            })
        });
        engine
            .expect_remove_container()
            .withf(|id| id == "c1")
            .times(1)
            .returning(|_| Ok(()));
        let manager = LifecycleManager::new(Arc::new(engine), policy(), false);

        let result = manager.provision(&spec()).await;

        assert!(matches!(result, Err(EngineError::Rejected { .. })));
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.provisioned, 1);
        assert_eq!(snapshot.released, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released_in_background() {
        let engine = Arc::new(EngineStub::new());
        let manager = LifecycleManager::new(engine.clone(), policy(), false);

        let lease = manager.provision(&spec()).await.unwrap();
        drop(lease);

        for _ in 0..100 {
            if engine.live_containers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.live_containers().is_empty());
        assert_eq!(manager.snapshot().released, 1);
    }

    #[tokio::test]
    async fn test_release_failure_is_deferred_not_blocking() {
        let engine = Arc::new(EngineStub::new().failing_removes(3));
        let manager = LifecycleManager::new(engine.clone(), policy(), false);

        let mut lease = manager.provision(&spec()).await.unwrap();
        let result = lease.release().await;

        assert!(matches!(
            result,
            Err(ReleaseError::Deferred { attempts: 3, .. })
        ));
        assert_eq!(manager.snapshot().leaked, 1);

        for _ in 0..100 {
            if manager.snapshot().leaked == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.snapshot(),
            LifecycleSnapshot {
                provisioned: 1,
                released: 1,
                leaked: 0
            }
        );
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_write_file_chunks_large_contents() {
        let engine = Arc::new(EngineStub::new());
        let manager = LifecycleManager::new(engine.clone(), policy(), false);
        let mut lease = manager.provision(&spec()).await.unwrap();

        let contents = "é".repeat(STAGING_CHUNK_BYTES);
        lease.write_file("/sandbox/main.py", &contents).await.unwrap();

        assert_eq!(engine.staged_file("/sandbox/main.py").unwrap(), contents);
        assert!(engine.staging_calls() >= 2);
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_empty_file() {
        let engine = Arc::new(EngineStub::new());
        let manager = LifecycleManager::new(engine.clone(), policy(), false);
        let mut lease = manager.provision(&spec()).await.unwrap();

        lease.write_file("/sandbox/main.sh", "").await.unwrap();

        assert_eq!(engine.staged_file("/sandbox/main.sh").unwrap(), "");
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_with_stdin_redirects_staged_file() {
        let engine = Arc::new(EngineStub::new());
        let manager = LifecycleManager::new(engine.clone(), policy(), false);
        let mut lease = manager.provision(&spec()).await.unwrap();

        let stream = lease
            .run(
                vec!["python3".to_string(), "main.py".to_string()],
                vec![],
                Some("/sandbox/.stdin"),
            )
            .await
            .unwrap();
        drop(stream);

        assert_eq!(engine.staging_calls(), 0);
        let commands = engine.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(&commands[0][..4], &["sh", "-c", r#"exec "$@" < "$0""#, "/sandbox/.stdin"]);
        assert_eq!(&commands[0][4..], &["python3", "main.py"]);
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_orphans() {
        let engine = Arc::new(EngineStub::new().with_orphans(&["old1", "old2"]));
        let manager = LifecycleManager::new(engine.clone(), policy(), false);

        let removed = manager.sweep_orphans("sandbox-runner.submission").await.unwrap();

        assert_eq!(removed, 2);
        assert!(engine.live_containers().is_empty());
    }

    #[test]
    fn test_chunk_end_respects_char_boundaries() {
        let text = "aé";
        assert_eq!(chunk_end(text, 0, 2), 1);
        assert_eq!(chunk_end(text, 0, 3), 3);
        assert_eq!(chunk_end(text, 1, 10), 3);
    }
}
