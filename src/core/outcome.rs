//! Run outcome classification

use serde::{Deserialize, Serialize};

use crate::sandbox::meta::{MetaStatus, SandboxMeta};

const SIGSEGV: i32 = 11;
/// Raised when a program writes past the sandbox file-size ceiling
pub const SIGXFSZ: i32 = 25;

/// How a sandboxed program ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    TimeLimitExceeded,
    Signaled { signal: i32 },
    RuntimeError { exit_code: Option<i32> },
    Other {
        code: Option<String>,
        message: Option<String>,
    },
}

impl RunStatus {
    pub fn from_meta(meta: &SandboxMeta) -> Self {
        match &meta.status {
            MetaStatus::Ok => RunStatus::Ok,
            MetaStatus::TimeOut => RunStatus::TimeLimitExceeded,
            MetaStatus::Signal => RunStatus::Signaled {
                signal: meta.exit_sig.unwrap_or(0),
            },
            MetaStatus::RuntimeError => RunStatus::RuntimeError {
                exit_code: meta.exit_code,
            },
            MetaStatus::Other(code) => RunStatus::Other {
                code: Some(code.clone()).filter(|c| !c.is_empty()),
                message: meta.message.clone(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RunStatus::Ok)
    }

    /// Human-readable cause appended to stderr (None for a clean exit)
    pub fn cause(&self) -> Option<String> {
        match self {
            RunStatus::Ok => None,
            RunStatus::TimeLimitExceeded => Some("Time limit exceeded".to_string()),
            RunStatus::Signaled { signal } if *signal == SIGSEGV => {
                Some("Segmentation fault (core dumped)".to_string())
            }
            RunStatus::Signaled { signal } => {
                Some(format!("Program terminated by signal {}", signal))
            }
            RunStatus::RuntimeError {
                exit_code: Some(code),
            } => Some(format!("Runtime error (exit code {})", code)),
            RunStatus::RuntimeError { exit_code: None } => Some("Runtime error".to_string()),
            RunStatus::Other { code: Some(code), .. } => {
                Some(format!("Program terminated with status {}", code))
            }
            RunStatus::Other {
                code: None,
                message: Some(message),
            } => Some(message.clone()),
            RunStatus::Other {
                code: None,
                message: None,
            } => Some("Program terminated abnormally".to_string()),
        }
    }
}

/// Classification plus captured output of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    /// CPU time reported by the sandbox, or wall time measured by the worker
    pub time_ms: u32,
}

impl RunOutcome {
    /// Append the status cause to stderr on its own line
    pub fn with_cause_in_stderr(mut self) -> Self {
        if let Some(cause) = self.status.cause() {
            if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
                self.stderr.push('\n');
            }
            self.stderr.push_str(&cause);
        }
        self
    }
}
