//! Sandboxed runner implementation
//!
//! Executes untrusted user code in an isolated environment with resource limits.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::compiler::Artifact;
use crate::config::RunLimits;
use crate::core::outcome::{RunOutcome, RunStatus, SIGXFSZ};
use crate::core::utils::read_capped;
use crate::error::ExecError;
use crate::languages::{Language, BINARY_NAME};
use crate::sandbox::meta::parse_meta;
use crate::sandbox::{IoSpec, Sandbox};

/// Runner that executes code in the sandbox
#[derive(Clone)]
pub struct SandboxedRunner {
    sandbox: Arc<dyn Sandbox>,
    limits: RunLimits,
}

impl SandboxedRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, limits: RunLimits) -> Self {
        Self { sandbox, limits }
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    /// Run `artifact` once with `stdin` in a fresh sandbox on `slot`.
    ///
    /// `scratch` is the job's private directory; the meta file is kept there,
    /// outside the sandbox root. The environment is torn down before
    /// returning, whatever happened; teardown failures are only logged.
    pub async fn run(
        &self,
        slot: u32,
        language: Language,
        artifact: &Artifact,
        stdin: &str,
        scratch: &Path,
    ) -> Result<RunOutcome, ExecError> {
        let result = self.run_in_box(slot, language, artifact, stdin, scratch).await;

        if let Err(e) = self.sandbox.cleanup(slot).await {
            warn!(slot, "Sandbox cleanup failed: {:#}", e);
        }

        result
    }

    async fn run_in_box(
        &self,
        slot: u32,
        language: Language,
        artifact: &Artifact,
        stdin: &str,
        scratch: &Path,
    ) -> Result<RunOutcome, ExecError> {
        let root = self
            .sandbox
            .init(slot)
            .await
            .map_err(|e| ExecError::Sandbox(format!("{:#}", e)))?;

        let meta_path = scratch.join(format!("meta_{}.txt", slot));
        // A stale meta file from a previous case must not be mistaken for this one
        let _ = fs::remove_file(&meta_path).await;
        let io = IoSpec::new(&meta_path);

        fs::write(root.join(&io.stdin_file), stdin)
            .await
            .context("Failed to write stdin into sandbox")?;

        match artifact {
            Artifact::Source {
                file_name,
                contents,
            } => {
                fs::write(root.join(file_name), contents)
                    .await
                    .context("Failed to write source into sandbox")?;
            }
            Artifact::Binary { path } => {
                let dest = root.join(BINARY_NAME);
                fs::copy(path, &dest)
                    .await
                    .context("Failed to copy executable into sandbox")?;
                fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
                    .await
                    .context("Failed to mark executable")?;
            }
        }

        let limits = RunLimits {
            processes: language.calculate_process_limit(self.limits.processes),
            ..self.limits.clone()
        };
        let command = language.run_command();
        let started = Instant::now();
        let run = self.sandbox.run(slot, &limits, &io, &command);

        let killed = match tokio::time::timeout(limits.outer_timeout(), run).await {
            Ok(result) => {
                result.map_err(|e| ExecError::Sandbox(format!("{:#}", e)))?;
                false
            }
            Err(_) => {
                warn!(
                    slot,
                    timeout_ms = limits.outer_timeout().as_millis() as u64,
                    "Sandbox overran its wall-clock limit, killed by outer timeout"
                );
                true
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u32;

        let stdout = read_capped(&root.join(&io.stdout_file), self.limits.output_limit_bytes)
            .await
            .context("Failed to read stdout")?;
        let stderr = read_capped(&root.join(&io.stderr_file), self.limits.output_limit_bytes)
            .await
            .context("Failed to read stderr")?;

        let meta_content = fs::read_to_string(&meta_path).await.unwrap_or_default();
        let meta = parse_meta(&meta_content);
        let _ = fs::remove_file(&meta_path).await;

        let status = if killed {
            RunStatus::TimeLimitExceeded
        } else {
            match RunStatus::from_meta(&meta) {
                // Hitting the file-size ceiling is reported through the marker
                RunStatus::Signaled { signal: SIGXFSZ }
                    if stdout.truncated || stderr.truncated =>
                {
                    RunStatus::Ok
                }
                status => status,
            }
        };
        let time_ms = if meta.time_ms > 0 { meta.time_ms } else { elapsed_ms };

        debug!(slot, ?status, time_ms, "Run finished");

        Ok(RunOutcome {
            status,
            stdout: stdout.text,
            stderr: stderr.text,
            stdout_truncated: stdout.truncated,
            time_ms,
        }
        .with_cause_in_stderr())
    }
}
