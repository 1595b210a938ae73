//! Per-stage result aggregation.

use std::time::Duration;

use serde::Serialize;

use crate::launcher::ProcessResult;

/// Aggregate outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Every job result: sharded tests first, then custom tests.
    pub results: Vec<ProcessResult>,

    /// Number of jobs run.
    pub total: usize,

    /// Jobs that exited 0 without timing out.
    pub passed: usize,

    /// Jobs killed by the timeout.
    pub timed_out: usize,

    /// Wall-clock time from stage entry until the last job returned.
    pub time: Duration,
}

impl StageResult {
    /// Reduces job results into a stage result.
    ///
    /// `time` is the stage's own elapsed wall time, not the sum of job times;
    /// with several workers the two differ.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use shardrun::launcher::ProcessResult;
    /// use shardrun::stage::StageResult;
    ///
    /// let job = |exit_code, timed_out| ProcessResult {
    ///     test: "t".into(),
    ///     invocation: "t".into(),
    ///     exit_code,
    ///     output: String::new(),
    ///     time: Duration::from_secs(1),
    ///     timed_out,
    /// };
    ///
    /// let result = StageResult::new(
    ///     vec![job(0, false), job(1, false), job(0, true)],
    ///     Duration::from_secs(2),
    /// );
    /// assert_eq!((result.total, result.passed, result.timed_out), (3, 1, 1));
    /// assert_eq!(result.failed(), 2);
    /// ```
    pub fn new(results: Vec<ProcessResult>, time: Duration) -> Self {
        let passed = results.iter().filter(|r| r.passed()).count();
        let timed_out = results.iter().filter(|r| r.timed_out).count();
        Self {
            total: results.len(),
            passed,
            timed_out,
            time,
            results,
        }
    }

    /// Jobs that did not pass, timeouts included.
    pub fn failed(&self) -> usize {
        self.total - self.passed
    }

    /// Returns `true` if every job passed.
    pub fn success(&self) -> bool {
        self.passed == self.total
    }
}
