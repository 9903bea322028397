//! Bulk-data tester
//!
//! A hierarchical test engine (tree model, runner, per-test context) and an
//! asynchronous client for the bulk data export protocol, bundled with a
//! conformance catalog.

pub mod bulk;
pub mod cli;
pub mod commands;
pub mod common;
pub mod http;
pub mod suites;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result, Settings};
pub use testing::{Runner, Status, TestApi, TestTree};
