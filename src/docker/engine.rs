use std::collections::HashMap;
use std::time::Duration;

use bollard::{
    Docker,
    container::LogOutput,
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        KillContainerOptionsBuilder, ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
        StartContainerOptions,
    },
};
use futures::{StreamExt, TryStreamExt, stream};

use crate::{
    config::EngineConfig,
    core::traits::engine::{
        ContainerEngine, ContainerSpec, ContainerStatus, EngineError, ExecEvent, ExecRequest,
        ExecStream,
    },
};

/// How long to wait for the daemon to record an exec's exit status after its
/// output closed.
const EXIT_POLL_ATTEMPTS: u32 = 50;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

const TMP_MOUNT: &str = "rw,noexec,nosuid,nodev,size=16m,mode=1777";

#[derive(Clone, Debug)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| map_err("connect", err))?
            .with_timeout(Duration::from_secs(config.api_timeout_secs));
        Ok(Self { docker })
    }

    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>, EngineError> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(|err| map_err("inspect_exec", err))?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        Ok(None)
    }
}

/// Isolation profile applied to every sandbox container.
pub(crate) fn host_config(spec: &ContainerSpec) -> HostConfig {
    let memory = i64::try_from(spec.memory_bytes).unwrap_or(i64::MAX);
    let scratch = format!(
        "rw,exec,nosuid,nodev,size={},mode=1777",
        spec.scratch_size_bytes
    );

    HostConfig {
        network_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        memory: Some(memory),
        // Equal to `memory`: no swap on top of the ceiling.
        memory_swap: Some(memory),
        pids_limit: Some(i64::from(spec.pids_limit)),
        nano_cpus: Some(i64::try_from(spec.cpu_millis).unwrap_or(i64::MAX / 1_000_000) * 1_000_000),
        tmpfs: Some(HashMap::from([
            (spec.scratch_dir.clone(), scratch),
            ("/tmp".to_string(), TMP_MOUNT.to_string()),
        ])),
        init: Some(true),
        ipc_mode: Some("private".to_string()),
        ..HostConfig::default()
    }
}

/// Splits `repo[:tag]` for a pull, leaving registry ports and digests alone.
fn split_image(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (image, Some("latest")),
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn map_err(operation: &'static str, err: BollardError) -> EngineError {
    let msg = err.to_string();
    match status_code(&err) {
        Some(404) => EngineError::NotFound { operation, msg },
        Some(_) => EngineError::Rejected { operation, msg },
        None => EngineError::Unreachable { operation, msg },
    }
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| map_err("ping", err))
    }

    #[tracing::instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!("Pulling image");
        let (from_image, tag) = split_image(image);
        let mut options = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        self.docker
            .create_image(Some(options.build()), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| map_err("pull_image", err))?;
        tracing::info!("Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec![spec.keepalive.as_secs().max(1).to_string()]),
            env: Some(spec.env.clone()),
            user: spec.user.clone(),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(true),
            host_config: Some(host_config(spec)),
            ..ContainerCreateBody::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|err| map_err("create_container", err))?;
        for warning in &response.warnings {
            tracing::warn!(container = %response.id, "Engine warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|err| map_err("start_container", err))
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecStream, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(request.cmd.clone()),
                    env: (!request.env.is_empty()).then(|| request.env.clone()),
                    attach_stdin: Some(false),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| map_err("create_exec", err))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|err| map_err("start_exec", err))?;
        let StartExecResults::Attached { output, .. } = started else {
            return Err(EngineError::Rejected {
                operation: "start_exec",
                msg: "exec started detached".to_string(),
            });
        };

        let events = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(ExecEvent::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(ExecEvent::Stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(err) => Some(Err(map_err("exec_output", err))),
            }
        });

        let engine = self.clone();
        let exit = stream::once(async move {
            engine.exit_code(&exec.id).await.map(ExecEvent::Exited)
        });

        Ok(events.chain(exit).boxed())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, EngineError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| map_err("inspect_container", err))?;
        let state = inspect.state.unwrap_or_default();
        Ok(ContainerStatus {
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .kill_container(id, Some(KillContainerOptionsBuilder::new().signal("SIGKILL").build()))
            .await
        {
            Ok(()) => Ok(()),
            // Gone already, or not running.
            Err(err) if matches!(status_code(&err), Some(404 | 409)) => Ok(()),
            Err(err) => Err(map_err("kill_container", err)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Gone already, or a removal is in progress.
            Err(err) if matches!(status_code(&err), Some(404 | 409)) => Ok(()),
            Err(err) => Err(map_err("remove_container", err)),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, EngineError> {
        let filters = HashMap::from([("label", vec![label])]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| map_err("list_containers", err))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
