//! Worker configuration
//!
//! Defaults are compiled in. An optional TOML file named by `EXECUTOR_CONFIG`
//! overrides them section by section, and `REDIS_URL` / `ISOLATE_BIN` override
//! the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub redis: RedisConfig,
    pub sandbox: SandboxConfig,
    pub limits: RunLimits,
    pub compile: CompileLimits,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Lifetime of a job entry before the retention TTL removes it
    pub job_ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            job_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path or name of the isolate binary
    pub isolate_bin: String,
    /// Highest slot id handed out by the pool (slots are 0..=max_slot_id)
    pub max_slot_id: u32,
    /// Added to a slot id to form the isolate box id
    pub box_id_base: u32,
    /// A slot not released within this window is reclaimed
    pub slot_idle_timeout_secs: u64,
    /// Whether to pass `--cg` to isolate
    pub use_cgroups: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolate_bin: "isolate".to_string(),
            max_slot_id: 3,
            box_id_base: 0,
            slot_idle_timeout_secs: 120,
            use_cgroups: true,
        }
    }
}

/// Resource ceilings for one sandboxed run
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunLimits {
    pub memory_kb: u64,
    /// Ceiling for each of stdout and stderr, enforced by the sandbox and on read-back
    pub output_limit_bytes: u64,
    pub processes: u32,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    /// Outer kill timeout is `wall_time_ms + kill_slack_ms`
    pub kill_slack_ms: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            memory_kb: 256 * 1024,
            output_limit_bytes: 64 * 1024,
            processes: 1,
            cpu_time_ms: 2_000,
            wall_time_ms: 5_000,
            kill_slack_ms: 2_000,
        }
    }
}

impl RunLimits {
    pub fn outer_timeout(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms + self.kill_slack_ms)
    }
}

/// Limits for the toolchain, which runs outside the sandbox
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompileLimits {
    pub memory_mb: u64,
    pub cpu_time_secs: u64,
    pub wall_time_ms: u64,
    /// Ceiling on captured compiler diagnostics
    pub output_limit_bytes: u64,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_time_secs: 20,
            wall_time_ms: 30_000,
            output_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Jobs fetched and processed concurrently per poll
    pub batch_width: usize,
    pub poll_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_width: 4,
            poll_interval_ms: 1_000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl WorkerConfig {
    /// Load from `EXECUTOR_CONFIG` (if set) and environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("EXECUTOR_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = url;
        }
        if let Ok(bin) = std::env::var("ISOLATE_BIN") {
            config.sandbox.isolate_bin = bin;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.batch_width == 0 {
            anyhow::bail!("dispatcher.batch_width must be at least 1");
        }
        if self.limits.processes == 0 {
            anyhow::bail!("limits.processes must be at least 1");
        }
        if self.limits.wall_time_ms < self.limits.cpu_time_ms {
            anyhow::bail!(
                "limits.wall_time_ms ({}) must not be below limits.cpu_time_ms ({})",
                self.limits.wall_time_ms,
                self.limits.cpu_time_ms
            );
        }
        Ok(())
    }

    pub fn isolate_bin(&self) -> PathBuf {
        PathBuf::from(&self.sandbox.isolate_bin)
    }
}
