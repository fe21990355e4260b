//! Sandbox module - isolation slots and the isolate wrapper
//!
//! This module handles:
//! - The box slot pool arbitrating exclusive sandbox ids
//! - Isolate box initialization, execution and cleanup
//! - Meta file parsing
//!
//! The sandbox module does NOT:
//! - Interpret outcomes (that's the runner's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod isolate_box;
pub mod meta;
pub mod pool;

pub use isolate_box::{fsize_kb, IoSpec, IsolateSandbox, Sandbox};
pub use pool::{SlotLease, SlotPool};
