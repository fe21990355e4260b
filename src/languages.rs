//! Language table for compilation and execution
//!
//! The set of languages is fixed. Each variant knows its source file name,
//! its optional compile command and the command that runs it in the sandbox.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Name of the executable produced by compiled languages
pub const BINARY_NAME: &str = "main";

/// Threads the Go runtime and node start before running any user code
const RUNTIME_THREAD_ALLOWANCE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Rust,
    Go,
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Go,
        Language::Python,
        Language::JavaScript,
    ];

    /// Name of the source file (e.g., "main.cpp")
    pub fn source_file(&self) -> &'static str {
        match self {
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
            Language::Rust => "main.rs",
            Language::Go => "main.go",
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
        }
    }

    /// Compile command, run from the scratch directory (None if interpreted)
    pub fn compile_command(&self) -> Option<Vec<String>> {
        let cmd: &[&str] = match self {
            Language::C => &["gcc", "-O2", "-std=c17", "-o", BINARY_NAME, "main.c", "-lm"],
            Language::Cpp => &["g++", "-O2", "-std=c++17", "-o", BINARY_NAME, "main.cpp"],
            Language::Rust => &["rustc", "-O", "--edition", "2021", "-o", BINARY_NAME, "main.rs"],
            Language::Go => &["go", "build", "-o", BINARY_NAME, "main.go"],
            Language::Python | Language::JavaScript => return None,
        };
        Some(into_command(cmd))
    }

    /// Command run inside the sandbox
    pub fn run_command(&self) -> Vec<String> {
        let cmd: &[&str] = match self {
            Language::C | Language::Cpp | Language::Rust | Language::Go => &["./main"],
            Language::Python => &["python3", "main.py"],
            Language::JavaScript => &["node", "main.js"],
        };
        into_command(cmd)
    }

    /// Process/thread ceiling for a run, given the configured base.
    ///
    /// isolate counts threads against `--processes`, so multi-threaded
    /// runtimes get a floor that lets them start.
    pub fn calculate_process_limit(&self, base: u32) -> u32 {
        match self {
            Language::Go | Language::JavaScript => base.max(RUNTIME_THREAD_ALLOWANCE),
            _ => base,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compile_command().is_some()
    }

    /// Extra environment for the toolchain (Go needs writable cache dirs)
    pub fn compile_env(&self, scratch: &std::path::Path) -> Vec<(String, String)> {
        match self {
            Language::Go => vec![
                ("GOCACHE".into(), scratch.join(".gocache").display().to_string()),
                ("GOPATH".into(), scratch.join(".gopath").display().to_string()),
                ("HOME".into(), scratch.display().to_string()),
            ],
            _ => Vec::new(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "c" => Ok(Language::C),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "rust" | "rs" => Ok(Language::Rust),
            "go" | "golang" => Ok(Language::Go),
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            _ => Err(ExecError::UnsupportedLanguage(s.to_string())),
        }
    }
}

fn into_command(command: &[&str]) -> Vec<String> {
    command.iter().map(|s| s.to_string()).collect()
}
