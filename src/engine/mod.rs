//! Engine module - drives one job through compile and run
//!
//! The engine owns the slot lease and the scratch directory for the
//! duration of a job. It does not touch persistence.

pub mod executer;

pub use executer::Executor;
