//! Backend storage clients.
//!
//! The [`client::ObjectBackend`] trait abstracts one account's bucket.
//! [`aws::AwsBackend`] talks to any S3-compatible provider through the AWS
//! SDK; [`memory::MemoryBackend`] keeps everything in process.
//! [`factory::BackendFactory`] hands out (memoised) clients per account.

pub mod aws;
pub mod client;
pub mod factory;
pub mod memory;

pub use client::{BackendError, BackendErrorKind, ObjectBackend};
pub use factory::BackendFactory;
