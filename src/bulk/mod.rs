//! Bulk data export protocol client
//!
//! [`BulkDataClient`] drives an export job against the server under test and
//! logs every exchange into the running test's record.

pub mod auth;
pub mod client;
pub mod clock;
pub mod diagnostics;

pub use auth::{load_signer, AssertionClaims, AssertionSigner, AuthMethod, Ed25519Signer, JwtSigner};
pub use client::{BulkDataClient, Job, Manifest, OutputFile, RequestOptions};
pub use clock::{Sleeper, TokioSleeper};
pub use diagnostics::{describe_failure, expect_operation_outcome};
