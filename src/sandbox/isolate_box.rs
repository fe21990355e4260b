//! Isolate box management
//!
//! Low-level wrapper around the isolate sandbox. Knows how to initialize a
//! box for a slot, run one command in it with limits and redirected I/O, and
//! tear it down. It does not interpret outcomes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{RunLimits, SandboxConfig};

/// File names inside the sandbox root, plus the meta file outside it
#[derive(Debug, Clone)]
pub struct IoSpec {
    pub stdin_file: String,
    pub stdout_file: String,
    pub stderr_file: String,
    /// Written by the sandbox; must live outside the box so the program can't forge it
    pub meta_file: PathBuf,
}

impl IoSpec {
    pub fn new(meta_file: impl Into<PathBuf>) -> Self {
        Self {
            stdin_file: "stdin.txt".to_string(),
            stdout_file: "stdout.txt".to_string(),
            stderr_file: "stderr.txt".to_string(),
            meta_file: meta_file.into(),
        }
    }
}

/// Process-lifecycle contract with the isolated environment
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Prepare a clean environment for `slot` and return the directory
    /// that becomes the program's working directory
    async fn init(&self, slot: u32) -> Result<PathBuf>;

    /// Run `command` to completion under `limits`
    async fn run(&self, slot: u32, limits: &RunLimits, io: &IoSpec, command: &[String])
        -> Result<()>;

    /// Tear the environment down
    async fn cleanup(&self, slot: u32) -> Result<()>;
}

/// `Sandbox` backed by the isolate CLI
pub struct IsolateSandbox {
    isolate_bin: PathBuf,
    box_id_base: u32,
    use_cgroups: bool,
}

impl IsolateSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            isolate_bin: PathBuf::from(&config.isolate_bin),
            box_id_base: config.box_id_base,
            use_cgroups: config.use_cgroups,
        }
    }

    fn box_id(&self, slot: u32) -> String {
        (self.box_id_base + slot).to_string()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.isolate_bin);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Arguments for a box lifecycle action (`--init` or `--cleanup`)
    fn box_args(&self, slot: u32, action: &'static str) -> Vec<String> {
        let mut args = vec!["--box-id".to_string(), self.box_id(slot)];
        if self.use_cgroups {
            args.push("--cg".to_string());
        }
        args.push(action.to_string());
        args
    }

    /// Check that isolate is installed and usable with the configured options
    pub async fn ensure_available(&self, slot: u32) -> Result<()> {
        self.init(slot)
            .await
            .context("Isolate is required but could not initialize a box")?;
        self.cleanup(slot).await
    }

    /// Arguments for `isolate --run`
    pub fn run_args(
        &self,
        slot: u32,
        limits: &RunLimits,
        io: &IoSpec,
        command: &[String],
    ) -> Vec<String> {
        let mut args = vec!["--box-id".to_string(), self.box_id(slot)];

        if self.use_cgroups {
            args.push("--cg".to_string());
            args.push(format!("--cg-mem={}", limits.memory_kb));
        } else {
            args.push(format!("--mem={}", limits.memory_kb));
        }

        args.extend([
            format!("--time={}", millis_to_secs(limits.cpu_time_ms)),
            format!("--wall-time={}", millis_to_secs(limits.wall_time_ms)),
            format!("--meta={}", io.meta_file.display()),
            format!("--stdin={}", io.stdin_file),
            format!("--stdout={}", io.stdout_file),
            format!("--stderr={}", io.stderr_file),
            format!("--processes={}", limits.processes),
            format!("--fsize={}", fsize_kb(limits.output_limit_bytes)),
            "--silent".to_string(),
            // Runtime directories for interpreters
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64:maybe".to_string(),
            "--dir=/etc:noexec".to_string(),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
            "--run".to_string(),
            "--".to_string(),
        ]);

        // isolate uses execve, so bare program names need a full path
        let mut cmd_iter = command.iter();
        if let Some(program) = cmd_iter.next() {
            if program.starts_with('/') || program.starts_with("./") {
                args.push(program.clone());
            } else {
                args.push(format!("/usr/bin/{}", program));
            }
            args.extend(cmd_iter.cloned());
        }

        args
    }
}

#[async_trait]
impl Sandbox for IsolateSandbox {
    async fn init(&self, slot: u32) -> Result<PathBuf> {
        // A box left behind by a crashed worker would make --init fail
        match self.command().args(self.box_args(slot, "--cleanup")).output().await {
            Ok(output) if !output.status.success() => debug!(
                slot,
                "Pre-init cleanup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(_) => {}
            Err(e) => debug!(slot, "Pre-init cleanup could not run: {}", e),
        }

        let output = self
            .command()
            .args(self.box_args(slot, "--init"))
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box {}: {}", slot, stderr.trim());
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let root = Path::new(&box_path).join("box");
        debug!(slot, root = %root.display(), "Initialized isolate box");
        Ok(root)
    }

    async fn run(
        &self,
        slot: u32,
        limits: &RunLimits,
        io: &IoSpec,
        command: &[String],
    ) -> Result<()> {
        let args = self.run_args(slot, limits, io, command);
        debug!("Running isolate with args: {:?}", args);

        // Exit status mirrors the program's; the meta file carries the real outcome
        let output = self
            .command()
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run isolate")?;

        // Status 2 is isolate's own failure (bad arguments, box not initialized)
        if output.status.code() == Some(2) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("isolate --run failed: {}", stderr.trim());
        }

        Ok(())
    }

    async fn cleanup(&self, slot: u32) -> Result<()> {
        let output = self
            .command()
            .args(self.box_args(slot, "--cleanup"))
            .output()
            .await
            .context("Failed to run isolate --cleanup")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to clean up isolate box {}: {}", slot, stderr.trim());
        }
        info!("Cleaned up isolate box {}", slot);
        Ok(())
    }
}

/// Sandbox file-size ceiling in KB for a read-back ceiling in bytes.
///
/// Kept strictly above the read ceiling, so a program that writes too much
/// leaves a file larger than the limit and the read-back marks it truncated.
pub fn fsize_kb(output_limit_bytes: u64) -> u64 {
    output_limit_bytes / 1024 + 1
}

fn millis_to_secs(ms: u64) -> String {
    format!("{}", ms as f64 / 1000.0)
}
