use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::{
    domain::OutputCaps,
    lifecycle::CleanupPolicy,
    orchestrator::ExecutionPolicy,
    service::LimitsPolicy,
    toolchain::Language,
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
/// The first attempt plus one retry.
const MAX_PROVISION_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {msg}")]
    Invalid { msg: String },
    #[error("Toolchain override for unknown language: {0}")]
    UnknownLanguage(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { msg: msg.into() }
}

/// Service configuration. Every field has a default, so an empty file (or no
/// file at all) yields a working setup.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: SocketAddr,
    /// How long shutdown waits for in-flight submissions to clean up.
    pub shutdown_grace_secs: u64,
    pub admission: AdmissionConfig,
    pub limits: LimitsConfig,
    pub output: OutputConfig,
    pub cleanup: CleanupConfig,
    pub engine: EngineConfig,
    /// Keyed by language id (`python3`, `cpp`, ...).
    pub toolchains: HashMap<String, ToolchainOverride>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub default_time_limit_ms: u64,
    pub max_time_limit_ms: u64,
    pub default_memory_bytes: u64,
    pub max_memory_bytes: u64,
    /// CPU quota in thousandths of a CPU.
    pub cpu_millis: u64,
    pub pids_limit: u32,
    pub build_time_limit_ms: u64,
    pub min_run_allowance_ms: u64,
    pub scratch_size_bytes: u64,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub max_extra_files: usize,
    /// Attempts at provisioning before the submission fails with an internal
    /// error: 1 disables the retry, 2 allows a single one. Provisioning is the
    /// only stage that is ever retried.
    pub provision_attempts: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub stdout_cap_bytes: usize,
    pub stderr_cap_bytes: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub release_attempts: u32,
    pub release_backoff_ms: u64,
    pub background_release_attempts: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub api_timeout_secs: u64,
    pub pull_missing_images: bool,
    pub sweep_orphans_on_start: bool,
    /// `uid:gid` the submitted code runs as. Empty string keeps the image's user.
    pub sandbox_user: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainOverride {
    pub image: Option<String>,
    /// An empty list turns the build step off.
    pub build: Option<Vec<String>>,
    pub run: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            shutdown_grace_secs: 30,
            admission: AdmissionConfig::default(),
            limits: LimitsConfig::default(),
            output: OutputConfig::default(),
            cleanup: CleanupConfig::default(),
            engine: EngineConfig::default(),
            toolchains: HashMap::new(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_depth: 32,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_time_limit_ms: 5_000,
            max_time_limit_ms: 30_000,
            default_memory_bytes: 256 * MIB,
            max_memory_bytes: GIB,
            cpu_millis: 1_000,
            pids_limit: 128,
            build_time_limit_ms: 15_000,
            min_run_allowance_ms: 1_000,
            scratch_size_bytes: 64 * MIB,
            max_source_bytes: (256 * KIB) as usize,
            max_stdin_bytes: MIB as usize,
            max_extra_files: 16,
            provision_attempts: 2,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stdout_cap_bytes: (64 * KIB) as usize,
            stderr_cap_bytes: (64 * KIB) as usize,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            release_attempts: 3,
            release_backoff_ms: 200,
            background_release_attempts: 10,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_timeout_secs: 120,
            pull_missing_images: true,
            sweep_orphans_on_start: true,
            sandbox_user: "65534:65534".to_string(),
        }
    }
}

impl Config {
    /// Reads the TOML file at `path` (defaults when `None`) and validates it.
    #[tracing::instrument]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };

        config.validate()?;
        tracing::debug!("Loaded config: {:?}", config);
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_concurrent == 0 {
            return Err(invalid("admission.max_concurrent must be at least 1"));
        }

        let limits = &self.limits;
        if limits.default_time_limit_ms == 0 || limits.max_time_limit_ms == 0 {
            return Err(invalid("time limits must be positive"));
        }
        if limits.default_time_limit_ms > limits.max_time_limit_ms {
            return Err(invalid(
                "limits.default_time_limit_ms exceeds limits.max_time_limit_ms",
            ));
        }
        if limits.default_memory_bytes > limits.max_memory_bytes {
            return Err(invalid(
                "limits.default_memory_bytes exceeds limits.max_memory_bytes",
            ));
        }
        if limits.default_memory_bytes < crate::constants::MIN_MEMORY_BYTES {
            return Err(invalid("limits.default_memory_bytes is below 6 MiB"));
        }
        if limits.cpu_millis == 0 || limits.pids_limit == 0 {
            return Err(invalid("limits.cpu_millis and limits.pids_limit must be positive"));
        }
        if limits.build_time_limit_ms == 0 || limits.scratch_size_bytes == 0 {
            return Err(invalid(
                "limits.build_time_limit_ms and limits.scratch_size_bytes must be positive",
            ));
        }
        if !(1..=MAX_PROVISION_ATTEMPTS).contains(&limits.provision_attempts) {
            return Err(invalid("limits.provision_attempts must be 1 or 2"));
        }
        if self.output.stdout_cap_bytes == 0 || self.output.stderr_cap_bytes == 0 {
            return Err(invalid("output caps must be positive"));
        }
        if self.cleanup.release_attempts == 0 {
            return Err(invalid("cleanup.release_attempts must be at least 1"));
        }

        for (id, toolchain) in &self.toolchains {
            if Language::from_id(id).is_none() {
                return Err(ConfigError::UnknownLanguage(id.clone()));
            }
            if toolchain.run.as_ref().is_some_and(|run| run.is_empty()) {
                return Err(invalid(format!("toolchains.{id}.run must not be empty")));
            }
            if toolchain.image.as_ref().is_some_and(|image| image.trim().is_empty()) {
                return Err(invalid(format!("toolchains.{id}.image must not be empty")));
            }
        }

        Ok(())
    }

    /// Keeps the configured host and swaps the port, the way the deployment
    /// descriptor hands the service a `PORT`.
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen.set_port(port);
        self
    }

    pub fn limits_policy(&self) -> LimitsPolicy {
        let limits = &self.limits;
        LimitsPolicy {
            default_time: Duration::from_millis(limits.default_time_limit_ms),
            max_time: Duration::from_millis(limits.max_time_limit_ms),
            default_memory_bytes: limits.default_memory_bytes,
            max_memory_bytes: limits.max_memory_bytes,
            cpu_millis: limits.cpu_millis,
            pids: limits.pids_limit,
            max_source_bytes: limits.max_source_bytes,
            max_stdin_bytes: limits.max_stdin_bytes,
            max_extra_files: limits.max_extra_files,
        }
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        let user = self.engine.sandbox_user.trim();
        ExecutionPolicy {
            build_time_limit: Duration::from_millis(self.limits.build_time_limit_ms),
            min_run_allowance: Duration::from_millis(self.limits.min_run_allowance_ms),
            output: OutputCaps {
                stdout_bytes: self.output.stdout_cap_bytes,
                stderr_bytes: self.output.stderr_cap_bytes,
            },
            provision_attempts: self.limits.provision_attempts,
            scratch_size_bytes: self.limits.scratch_size_bytes,
            sandbox_user: (!user.is_empty()).then(|| user.to_string()),
        }
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            attempts: self.cleanup.release_attempts,
            backoff: Duration::from_millis(self.cleanup.release_backoff_ms),
            background_attempts: self.cleanup.background_release_attempts,
        }
    }
}
