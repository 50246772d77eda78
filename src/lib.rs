//! # pan-transfer
//!
//! `pan-transfer` moves files to and from a cloud drive using the provider's
//! chunked-transfer protocol.
//! It supports features like:
//! - Parallel chunk uploads and byte-range downloads under one shared budget
//! - Skipping files and chunks that are already complete
//! - Automatic retries on network failure
//! - Rate limiting (throttling)
//! - Rapid upload when the provider already holds identical content
//!
//! The library drives the `pan` binary, but the engine is usable on its own:
//! implement [`api::PanApi`] for another provider, or hand a batch to
//! [`TransferEngine`] directly.

pub mod api;
pub mod args;
pub mod collector;
pub mod config;
pub mod downloader;
pub mod error;
pub mod finalize;
pub mod observer;
pub mod orchestrator;
pub mod plan;
pub mod resolve;
pub mod skip;
pub mod state;
pub mod throttle;
pub mod uploader;
pub mod utils;
pub mod worker;

pub use args::Args;
pub use config::{EngineConfig, RetryPolicy, Settings};
pub use error::{BatchError, TransferError};
pub use orchestrator::TransferEngine;
pub use state::{BatchReport, DownloadSpec, FileOutcome, TransferBatch, TransferJob, UploadSpec};
pub use throttle::{ArcRateLimiter, Throttle};
