//! Error taxonomy for the execution pipeline

use thiserror::Error;

/// Errors that end a job's pipeline early.
///
/// Runtime failures of the user program (signals, timeouts, non-zero exit)
/// are not errors: they are classified into a `RunOutcome` instead.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Language outside the fixed set; rejected before any resource is touched
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Toolchain rejected the source, produced no output, or timed out
    #[error("Compilation failed")]
    Compile { stderr: String },

    /// Sandbox init/run could not be carried out
    #[error("Sandbox failure: {0}")]
    Sandbox(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExecError {
    /// Text to surface in the job's stderr
    pub fn user_message(&self) -> String {
        match self {
            ExecError::Compile { stderr } if !stderr.is_empty() => stderr.clone(),
            ExecError::Internal(e) => format!("Internal error: {:#}", e),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Internal(e.into())
    }
}
