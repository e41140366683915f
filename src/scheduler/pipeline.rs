use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// The user transform a pipeline applies to every datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Shell command run with the datum's input directory as working directory
    pub cmd: String,
    /// Extra environment for the transform
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TransformSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            env: BTreeMap::new(),
        }
    }
}

/// How many errored datums a job may have and still succeed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureTolerance {
    /// Highest allowed `errored / (finished + errored)`
    #[serde(default)]
    pub max_failed_fraction: f64,
    /// Highest allowed number of errored datums, if capped separately
    #[serde(default)]
    pub max_failed_count: Option<u64>,
}

impl Default for FailureTolerance {
    fn default() -> Self {
        Self::zero()
    }
}

impl FailureTolerance {
    /// Any errored datum fails the job.
    pub fn zero() -> Self {
        Self {
            max_failed_fraction: 0.0,
            max_failed_count: None,
        }
    }

    pub fn fraction(max_failed_fraction: f64) -> Self {
        Self {
            max_failed_fraction,
            max_failed_count: None,
        }
    }

    pub fn count(max_failed_count: u64) -> Self {
        Self {
            max_failed_fraction: 1.0,
            max_failed_count: Some(max_failed_count),
        }
    }

    /// The fraction must be a finite ratio in `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<()> {
        let fraction = self.max_failed_fraction;
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err(WorkerError::Config(format!(
                "max_failed_fraction must be between 0 and 1, got {}",
                fraction
            )));
        }
        Ok(())
    }
}

fn default_version() -> u64 {
    1
}

fn default_reuse() -> bool {
    true
}

/// A registered transform and its failure policy. Re-registering a pipeline
/// bumps its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u64,
    pub transform: TransformSpec,
    #[serde(default)]
    pub tolerance: FailureTolerance,
    /// Finish datums whose fingerprint already has committed output from an
    /// earlier job of this pipeline version
    #[serde(default = "default_reuse")]
    pub reuse_outputs: bool,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, transform: TransformSpec) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            transform,
            tolerance: FailureTolerance::default(),
            reuse_outputs: default_reuse(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: FailureTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_reuse(mut self, reuse_outputs: bool) -> Self {
        self.reuse_outputs = reuse_outputs;
        self
    }

    /// Same pipeline with a new transform, as a new version.
    pub fn reregister(&self, transform: TransformSpec) -> Self {
        Self {
            version: self.version + 1,
            transform,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let p: Pipeline =
            serde_json::from_str(r#"{"name":"edges","transform":{"cmd":"cp * $DATUM_OUTPUT"}}"#)
                .unwrap();
        assert_eq!(p.version, 1);
        assert!(p.reuse_outputs);
        assert_eq!(p.tolerance, FailureTolerance::zero());
        assert!(p.transform.env.is_empty());
    }

    #[test]
    fn tolerance_fraction_must_be_a_ratio() {
        for ok in [0.0, 0.25, 1.0] {
            assert!(FailureTolerance::fraction(ok).validate().is_ok());
        }
        assert!(FailureTolerance::count(3).validate().is_ok());
        for bad in [-0.5, 1.5, f64::NAN, f64::INFINITY] {
            let err = FailureTolerance::fraction(bad).validate().unwrap_err();
            assert!(matches!(err, WorkerError::Config(_)), "{} gave {:?}", bad, err);
        }
    }

    #[test]
    fn reregister_bumps_version() {
        let p = Pipeline::new("edges", TransformSpec::new("true"));
        let q = p.reregister(TransformSpec::new("false"));
        assert_eq!(q.version, 2);
        assert_eq!(q.name, "edges");
        assert_eq!(q.transform.cmd, "false");
    }
}
