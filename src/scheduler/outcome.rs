use super::job::{DatumCounts, JobState};
use super::pipeline::FailureTolerance;

/// Final verdict for a job whose datums have all settled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobOutcome {
    pub state: JobState,
    /// `errored / (finished + errored)`, zero when nothing settled
    pub failure_ratio: f64,
}

/// Decide job success from the terminal datum counts.
pub fn evaluate(counts: &DatumCounts, tolerance: &FailureTolerance) -> JobOutcome {
    let settled = counts.finished + counts.errored;
    let failure_ratio = if settled == 0 {
        0.0
    } else {
        counts.errored as f64 / settled as f64
    };

    let within_fraction = failure_ratio <= tolerance.max_failed_fraction;
    let within_count = tolerance
        .max_failed_count
        .map_or(true, |max| counts.errored <= max);

    let state = if within_fraction && within_count {
        JobState::Success
    } else {
        JobState::Failure
    };
    JobOutcome {
        state,
        failure_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(finished: u64, errored: u64) -> DatumCounts {
        DatumCounts {
            finished,
            errored,
            ..Default::default()
        }
    }

    #[test]
    fn all_finished_succeeds() {
        let o = evaluate(&counts(5, 0), &FailureTolerance::zero());
        assert_eq!(o.state, JobState::Success);
        assert_eq!(o.failure_ratio, 0.0);
    }

    #[test]
    fn zero_tolerance_fails_on_any_error() {
        let o = evaluate(&counts(99, 1), &FailureTolerance::zero());
        assert_eq!(o.state, JobState::Failure);
        assert!((o.failure_ratio - 0.01).abs() < 1e-9);
    }

    #[test]
    fn fraction_tolerance_is_inclusive() {
        let t = FailureTolerance::fraction(0.2);
        assert_eq!(evaluate(&counts(8, 2), &t).state, JobState::Success);
        assert_eq!(evaluate(&counts(7, 3), &t).state, JobState::Failure);
    }

    #[test]
    fn count_tolerance_caps_errors() {
        let t = FailureTolerance::count(1);
        assert_eq!(evaluate(&counts(0, 1), &t).state, JobState::Success);
        assert_eq!(evaluate(&counts(100, 2), &t).state, JobState::Failure);
    }

    #[test]
    fn empty_job_succeeds() {
        let o = evaluate(&counts(0, 0), &FailureTolerance::zero());
        assert_eq!(o.state, JobState::Success);
    }
}
