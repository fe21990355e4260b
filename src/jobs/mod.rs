//! Job lifecycle: submission, dispatch and grading

pub mod dispatcher;
pub mod grader;
pub mod ledger;

pub use dispatcher::Dispatcher;
pub use grader::GradingEngine;
pub use ledger::JobLedger;
