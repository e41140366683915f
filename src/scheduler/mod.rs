//! Job scheduling: datum enumeration, the bounded slot pool, retry
//! re-queueing and the final job verdict.

pub mod dispatcher;
pub mod job;
pub mod outcome;
pub mod pipeline;
pub mod queue;
pub mod source;

pub use dispatcher::Dispatcher;
pub use job::{DatumCounts, FailedDatum, Job, JobState, JobStatus};
pub use outcome::{evaluate, JobOutcome};
pub use pipeline::{FailureTolerance, Pipeline, TransformSpec};
pub use queue::{Claim, DatumQueue, QueuedDatum};
pub use source::{DatumSource, FileSource, StaticSource};
