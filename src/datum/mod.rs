//! Datums: descriptors, fingerprints, lifecycle and retry policy.

pub mod descriptor;
pub mod retry;
pub mod state;

pub use descriptor::{DatumDescriptor, Fingerprint, InputRef};
pub use retry::RetryPolicy;
pub use state::{DatumFailure, DatumRecord, DatumState};
