//! gitops-pilot-core: domain model for gitops-pilot
//!
//! Plain data and pure logic shared by the installer and the CLI. Nothing
//! in here talks to a cluster or the network.

pub mod retry;
pub mod types;

pub use retry::{Backoff, RetryError, RetryLimit, RetryPolicy, retry};
pub use types::*;
