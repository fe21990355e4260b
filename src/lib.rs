//! Code execution worker
//!
//! Compiles and runs untrusted programs in isolate boxes, records the
//! outcome in the job ledger and grades challenge submissions. The web
//! layer links against `jobs::JobLedger` to submit and query jobs.

pub mod compiler;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod languages;
pub mod redis_manager;
pub mod runner;
pub mod sandbox;
pub mod storage;
