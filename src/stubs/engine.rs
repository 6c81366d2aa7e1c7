use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{StreamExt, stream};

use crate::constants::STAGING_ENV;
use crate::core::traits::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, EngineError, ExecEvent, ExecRequest,
    ExecStream,
};

/// What a scripted command does once started.
#[derive(Clone, Debug)]
pub enum ExecScript {
    Exit {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        code: Option<i64>,
    },
    /// Prints `stdout` after `delay`, then never exits.
    Hang { stdout: Vec<u8>, delay: Duration },
    /// Prints, waits `delay`, then exits with `code`.
    Slow { stdout: Vec<u8>, delay: Duration, code: i64 },
    Fail(EngineError),
}

impl ExecScript {
    pub fn exit(code: i64) -> Self {
        Self::Exit {
            stdout: vec![],
            stderr: vec![],
            code: Some(code),
        }
    }

    pub fn print(stdout: &str, code: i64) -> Self {
        Self::Exit {
            stdout: stdout.as_bytes().to_vec(),
            stderr: vec![],
            code: Some(code),
        }
    }
}

type Script = Arc<dyn Fn(&[String]) -> ExecScript + Send + Sync>;

#[derive(Default)]
struct State {
    next_id: u64,
    live: HashSet<String>,
    specs: Vec<ContainerSpec>,
    files: HashMap<String, String>,
    commands: Vec<Vec<String>>,
    staging_calls: usize,
    create_calls: usize,
    remove_calls: usize,
    kill_calls: usize,
    failing_creates: usize,
    failing_removes: usize,
    failing_staging: usize,
    failing_paths: HashMap<String, usize>,
}

/// In-memory container engine. Staging commands write into a file map, every
/// other command follows the script.
#[derive(Clone)]
pub struct EngineStub {
    state: Arc<Mutex<State>>,
    script: Script,
    oom: bool,
    reachable: bool,
    create_delay: Duration,
    start_delay: Duration,
}

impl std::fmt::Debug for EngineStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStub").finish_non_exhaustive()
    }
}

impl EngineStub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            script: Arc::new(|_| ExecScript::exit(0)),
            oom: false,
            reachable: true,
            create_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
        }
    }

    pub fn with_script(
        mut self,
        script: impl Fn(&[String]) -> ExecScript + Send + Sync + 'static,
    ) -> Self {
        self.script = Arc::new(script);
        self
    }

    pub fn failing_creates(self, count: usize) -> Self {
        self.state.lock().unwrap().failing_creates = count;
        self
    }

    pub fn failing_removes(self, count: usize) -> Self {
        self.state.lock().unwrap().failing_removes = count;
        self
    }

    pub fn failing_staging(self, count: usize) -> Self {
        self.state.lock().unwrap().failing_staging = count;
        self
    }

    /// Fails the next `count` attempts to stage `path`.
    pub fn failing_staging_of(self, path: &str, count: usize) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_paths
            .insert(path.to_string(), count);
        self
    }

    /// The container exists as soon as `create_container` is called, but the
    /// call only returns after `delay`.
    pub fn slow_create(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn slow_start(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_orphans(self, ids: &[&str]) -> Self {
        self.state
            .lock()
            .unwrap()
            .live
            .extend(ids.iter().map(|id| id.to_string()));
        self
    }

    /// Reports every container as killed by the OOM killer.
    pub fn out_of_memory(mut self) -> Self {
        self.oom = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn live_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().live.iter().cloned().collect()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn staged_file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Non-staging commands in the order they were started.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn staging_calls(&self) -> usize {
        self.state.lock().unwrap().staging_calls
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.lock().unwrap().remove_calls
    }

    pub fn kill_calls(&self) -> usize {
        self.state.lock().unwrap().kill_calls
    }

    fn unreachable_error(operation: &'static str) -> EngineError {
        EngineError::Unreachable {
            operation,
            msg: "connection refused".to_string(),
        }
    }
}

fn events(stdout: Vec<u8>, stderr: Vec<u8>) -> Vec<Result<ExecEvent, EngineError>> {
    let mut events = Vec::new();
    if !stdout.is_empty() {
        events.push(Ok(ExecEvent::Stdout(stdout)));
    }
    if !stderr.is_empty() {
        events.push(Ok(ExecEvent::Stderr(stderr)));
    }
    events
}

#[async_trait::async_trait]
impl ContainerEngine for EngineStub {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.reachable {
            Ok(())
        } else {
            Err(Self::unreachable_error("ping"))
        }
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            if !self.reachable {
                return Err(Self::unreachable_error("create_container"));
            }
            if state.failing_creates > 0 {
                state.failing_creates -= 1;
                return Err(EngineError::Rejected {
                    operation: "create_container",
                    msg: "scripted failure".to_string(),
                });
            }

            state.next_id += 1;
            let id = format!("stub-{}", state.next_id);
            state.live.insert(id.clone());
            state.specs.push(spec.clone());
            id
        };
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.state.lock().unwrap().live.contains(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                operation: "start_container",
                msg: id.to_string(),
            })
        }
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecStream, EngineError> {
        let staged_chunk = request
            .env
            .iter()
            .find_map(|var| var.strip_prefix(&format!("{STAGING_ENV}=")).map(str::to_string));

        {
            let mut state = self.state.lock().unwrap();
            if !state.live.contains(id) {
                return Err(EngineError::NotFound {
                    operation: "exec",
                    msg: id.to_string(),
                });
            }

            if let Some(chunk) = staged_chunk {
                state.staging_calls += 1;
                let path = request.cmd.get(3).cloned().unwrap_or_default();
                let path_fails = match state.failing_paths.get_mut(&path) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                };
                if path_fails || state.failing_staging > 0 {
                    if !path_fails {
                        state.failing_staging -= 1;
                    }
                    return Ok(stream::iter(vec![
                        Ok(ExecEvent::Stderr(b"read-only file system".to_vec())),
                        Ok(ExecEvent::Exited(Some(1))),
                    ])
                    .boxed());
                }
                let append = request.cmd.get(2).is_some_and(|script| script.contains(">>"));
                let file = state.files.entry(path).or_default();
                if !append {
                    file.clear();
                }
                file.push_str(&chunk);
                return Ok(stream::iter(vec![Ok(ExecEvent::Exited(Some(0)))]).boxed());
            }

            state.commands.push(request.cmd.clone());
        }

        match (self.script)(&request.cmd) {
            ExecScript::Exit {
                stdout,
                stderr,
                code,
            } => {
                let mut events = events(stdout, stderr);
                events.push(Ok(ExecEvent::Exited(code)));
                Ok(stream::iter(events).boxed())
            }
            ExecScript::Hang { stdout, delay } => Ok(stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok(ExecEvent::Stdout(stdout))
            })
            .chain(stream::pending())
            .boxed()),
            ExecScript::Slow {
                stdout,
                delay,
                code,
            } => Ok(stream::iter(events(stdout, vec![]))
                .chain(stream::once(async move {
                    tokio::time::sleep(delay).await;
                    Ok(ExecEvent::Exited(Some(code)))
                }))
                .boxed()),
            ExecScript::Fail(err) => Err(err),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, EngineError> {
        let state = self.state.lock().unwrap();
        if !state.live.contains(id) {
            return Err(EngineError::NotFound {
                operation: "inspect_container",
                msg: id.to_string(),
            });
        }
        Ok(ContainerStatus {
            oom_killed: self.oom,
        })
    }

    async fn kill_container(&self, _id: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().kill_calls += 1;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.remove_calls += 1;
        if state.failing_removes > 0 {
            state.failing_removes -= 1;
            return Err(EngineError::Unreachable {
                operation: "remove_container",
                msg: "scripted failure".to_string(),
            });
        }
        state.live.remove(id);
        Ok(())
    }

    async fn list_containers(&self, _label: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.live_containers())
    }
}
