//! Runner module - sandboxed execution of user programs
//!
//! `SandboxedRunner` runs one artifact against one stdin blob in a cold
//! sandbox for an already-acquired slot and classifies the result.
//!
//! The runner module does NOT:
//! - Acquire or release slots
//! - Compile code
//! - Compare outputs against expected answers

pub mod sandboxed;

pub use sandboxed::SandboxedRunner;
