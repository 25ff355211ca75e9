//! Synchronization: the queue-draining uploader, the pull-based stream
//! client, and the observable status they share.

pub mod client;
pub mod status;
pub mod uploader;

pub use client::{StreamError, StreamErrorKind, SyncClient, SyncOptions, SyncStream};
pub use status::{DataFlowStatus, SyncStatus};
pub use uploader::{RetryConfig, UploadOutcome, Uploader};
