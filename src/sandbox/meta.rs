//! Sandbox meta file parser
//!
//! The meta file is newline-delimited `key:value` text. isolate emits
//! two-letter status codes (`TO`, `SG`, `RE`, `XX`); the spelled-out forms
//! are accepted as well.

/// Raw execution status from the sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum MetaStatus {
    /// No status line: program exited on its own
    Ok,
    /// Wall-clock or CPU time limit exceeded
    TimeOut,
    /// Killed by signal
    Signal,
    /// Non-zero exit
    RuntimeError,
    /// Anything else, including isolate's internal error `XX`
    Other(String),
}

/// Parsed meta file contents
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxMeta {
    pub status: MetaStatus,
    /// CPU time used in milliseconds
    pub time_ms: u32,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u32,
    /// Memory used in KB (from cg-mem or max-rss)
    pub memory_kb: u32,
    pub exit_code: Option<i32>,
    pub exit_sig: Option<i32>,
    /// Free-text explanation from the sandbox
    pub message: Option<String>,
}

impl Default for SandboxMeta {
    fn default() -> Self {
        Self {
            status: MetaStatus::Ok,
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: None,
            exit_sig: None,
            message: None,
        }
    }
}

/// Parse meta file content
pub fn parse_meta(content: &str) -> SandboxMeta {
    let mut meta = SandboxMeta::default();
    let mut status_str = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.time_ms = (t * 1000.0) as u32;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = (t * 1000.0) as u32;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u32>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "status" => status_str = value.to_string(),
            "exitcode" => meta.exit_code = value.parse().ok(),
            "exitsig" => meta.exit_sig = value.parse().ok(),
            "message" if !value.is_empty() => meta.message = Some(value.to_string()),
            _ => {}
        }
    }

    meta.status = match status_str.as_str() {
        "" | "OK" | "ok" => MetaStatus::Ok,
        "TO" | "timeout" => MetaStatus::TimeOut,
        "SG" | "signal" => MetaStatus::Signal,
        "RE" | "runtime-error" => MetaStatus::RuntimeError,
        other => MetaStatus::Other(other.to_string()),
    };

    // A signal or exit code without a status line still means abnormal termination
    if meta.status == MetaStatus::Ok {
        if meta.exit_sig.is_some() {
            meta.status = MetaStatus::Signal;
        } else if meta.exit_code.is_some_and(|code| code != 0) {
            meta.status = MetaStatus::RuntimeError;
        }
    }

    meta
}
