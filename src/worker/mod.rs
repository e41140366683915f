//! Per-datum processing stages.
//!
//! A worker slot runs one datum attempt at a time through three stages:
//! - **Fetch**: [`DatumFetcher`] downloads the datum's inputs into scratch space
//! - **Execute**: [`Sandbox`] runs the pipeline transform as a child process
//! - **Commit**: [`OutputCommitter`] uploads the output and writes its manifest
//!
//! [`DatumRunner`] strings the stages together, owns the scratch directory
//! of each attempt, and reports per-stage timings and sizes back to the
//! dispatcher, which advances the datum state and records metrics.

pub mod committer;
pub mod fetcher;
pub mod runner;
pub mod sandbox;

pub use committer::{CommitReceipt, OutputCommitter, OutputFile, OutputManifest};
pub use fetcher::{DatumFetcher, TransferStats};
pub use runner::{Attempt, AttemptReport, DatumRunner};
pub use sandbox::{ExecutionOutcome, ExecutionRequest, Sandbox};
