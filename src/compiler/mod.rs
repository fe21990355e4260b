//! Compiler module - native compilation of user code
//!
//! Compilation runs outside the sandbox in the job's private scratch
//! directory. The toolchain gets its own address-space and CPU-time rlimits,
//! runs in a fresh process group, and is killed as a group when the
//! wall-clock timeout expires.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CompileLimits;
use crate::core::utils::read_capped;
use crate::error::ExecError;
use crate::languages::{Language, BINARY_NAME};

const COMPILE_STDERR_FILE: &str = "compile_stderr.txt";

/// What the run stage needs to start the program
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// Interpreted language: the source is written into the sandbox
    Source { file_name: String, contents: String },
    /// Compiled language: this executable is copied into the sandbox
    Binary { path: PathBuf },
}

/// Build `source` for `language` inside `scratch`.
///
/// Non-zero exit, a missing executable and a timeout all produce
/// `ExecError::Compile` carrying the compiler's stderr.
pub async fn compile(
    language: Language,
    source: &str,
    scratch: &Path,
    limits: &CompileLimits,
) -> Result<Artifact, ExecError> {
    let Some(command) = language.compile_command() else {
        return Ok(Artifact::Source {
            file_name: language.source_file().to_string(),
            contents: source.to_string(),
        });
    };

    let source_path = scratch.join(language.source_file());
    tokio::fs::write(&source_path, source)
        .await
        .with_context(|| format!("Failed to write source to {}", source_path.display()))?;

    debug!(%language, "Compiling with {:?}", command);

    let status = run_toolchain(&command, scratch, &language.compile_env(scratch), limits).await?;

    let stderr = read_capped(&scratch.join(COMPILE_STDERR_FILE), limits.output_limit_bytes)
        .await
        .context("Failed to read compiler output")?
        .text;

    let binary = scratch.join(BINARY_NAME);
    match status {
        ToolchainStatus::TimedOut => Err(ExecError::Compile {
            stderr: append_line(stderr, "Compilation timed out"),
        }),
        ToolchainStatus::Exited(code) if code != Some(0) => {
            let stderr = if stderr.is_empty() {
                match code {
                    Some(code) => format!("Compilation failed with exit code {}", code),
                    None => "Compiler crashed".to_string(),
                }
            } else {
                stderr
            };
            Err(ExecError::Compile { stderr })
        }
        ToolchainStatus::Exited(_) if !binary.is_file() => Err(ExecError::Compile {
            stderr: append_line(stderr, "Compiler produced no executable"),
        }),
        ToolchainStatus::Exited(_) => Ok(Artifact::Binary { path: binary }),
    }
}

enum ToolchainStatus {
    /// Exit code, None if killed by a signal
    Exited(Option<i32>),
    TimedOut,
}

async fn run_toolchain(
    command: &[String],
    scratch: &Path,
    env: &[(String, String)],
    limits: &CompileLimits,
) -> Result<ToolchainStatus, ExecError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Compile command is empty"))?;

    let stderr_file = std::fs::File::create(scratch.join(COMPILE_STDERR_FILE))
        .context("Failed to create compiler stderr file")?;

    let address_space = limits.memory_mb * 1024 * 1024;
    let cpu_secs = limits.cpu_time_secs;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(scratch)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_file))
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe syscalls run between fork and exec
    unsafe {
        cmd.pre_exec(move || {
            setsid()?;
            setrlimit(Resource::RLIMIT_AS, address_space, address_space)?;
            setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn compiler {}", program))?;
    let pgid = child.id();

    let timeout = std::time::Duration::from_millis(limits.wall_time_ms);
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("Failed to wait for compiler")?;
            Ok(ToolchainStatus::Exited(status.code()))
        }
        Err(_) => {
            warn!(program = %program, "Compiler exceeded wall-clock limit, killing");
            // The compiler driver forks cc1/ld; kill the whole group
            if let Some(pgid) = pgid {
                if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                    warn!("Failed to kill compiler process group {}: {}", pgid, e);
                }
            }
            let _ = child.kill().await;
            Ok(ToolchainStatus::TimedOut)
        }
    }
}

fn append_line(mut text: String, line: &str) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text
}
