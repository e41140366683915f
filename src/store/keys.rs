//! Store key layout.

use crate::datum::Fingerprint;

pub fn object(digest: &str) -> String {
    format!("objects/{}", digest)
}

/// Output manifest of one datum within one job. Its existence is the commit
/// point for that datum's output.
pub fn job_datum(job_id: &str, fingerprint: &Fingerprint) -> String {
    format!("jobs/{}/datums/{}", job_id, fingerprint)
}

/// Reuse index entry shared by every job of one pipeline version.
pub fn reuse(pipeline: &str, version: u64, fingerprint: &Fingerprint) -> String {
    format!("pipelines/{}/{}/datums/{}", pipeline, version, fingerprint)
}
