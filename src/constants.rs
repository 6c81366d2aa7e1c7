/// Label attached to every container this service creates; the value is the
/// submission id. Used to find orphans after a crash.
pub const CONTAINER_LABEL: &str = "sandbox-runner.submission";
pub const CONTAINER_NAME_PREFIX: &str = "sandbox-run";

/// Writable tmpfs inside the container; everything else is read-only.
pub const SCRATCH_DIR: &str = "/sandbox";
pub const STDIN_FILE: &str = ".stdin";

/// Environment variable carrying one chunk of a staged file.
pub const STAGING_ENV: &str = "SANDBOX_CHUNK";
/// Below the kernel's per-string argv/envp limit (128 KiB).
pub const STAGING_CHUNK_BYTES: usize = 64 * 1024;

/// Docker refuses memory limits below this.
pub const MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;

/// Extra lifetime given to the keep-alive process on top of the time limits.
pub const KEEPALIVE_SLACK_SECS: u64 = 60;

pub const UPDATES_BUFFER: usize = 16;
pub const STREAM_BUFFER: usize = 32;

pub const HEALTH_PING_TIMEOUT_SECS: u64 = 5;

pub const STREAM_TX_ERR: &str = "Failed to forward submission update: client disconnected";
