//! Whole-run planning and execution.
//!
//! A [`TestPlan`] builds one [`Stage`] per selected feature, all of them up
//! front, so a configuration that cannot work for any stage fails before a
//! single process is spawned. Stages then run one after another and their
//! results roll up into a [`RunSummary`].
//!
//! # Example
//!
//! ```no_run
//! use shardrun::config::load_config;
//! use shardrun::launcher::LocalLauncher;
//! use shardrun::plan::TestPlan;
//! use shardrun::report::ConsoleReporter;
//! use shardrun::system::System;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardrun.toml"))?;
//!     let system = System::detect(&config.system).await;
//!
//!     let mut plan = TestPlan::new(config, system).await?;
//!     let summary = plan
//!         .execute(&LocalLauncher::new(), &ConsoleReporter::new(false))
//!         .await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::config::{Config, FeatureKind};
use crate::launcher::{ProcessLauncher, ProcessResult};
use crate::report::Reporter;
use crate::runner::{Runner, TestSpec};
use crate::stage::{Stage, StageError, StageOutcome, StageResult, debug_test_count, stage_for};
use crate::system::System;

/// Result of one stage within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// Stage name, e.g. `CPU`.
    pub name: String,
    /// Feature kind of the stage.
    pub kind: FeatureKind,
    /// The stage's aggregated results.
    pub result: StageResult,
}

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every job passed (or the debugger exited cleanly) |
/// | 1 | A job failed or timed out (or the debugger exited non-zero) |
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Per-stage results, in execution order.
    pub stages: Vec<StageReport>,

    /// Jobs run across every stage.
    pub total: usize,

    /// Jobs that passed.
    pub passed: usize,

    /// Jobs that failed, timeouts included.
    pub failed: usize,

    /// Jobs killed by the timeout.
    pub timed_out: usize,

    /// Wall-clock duration of the run.
    pub duration: Duration,

    /// Exit code of the debugger, when the run was a debug session.
    pub debug_exit_code: Option<i32>,
}

impl RunSummary {
    /// Totals the given stage results.
    pub fn new(stages: Vec<StageReport>, duration: Duration) -> Self {
        let total = stages.iter().map(|s| s.result.total).sum();
        let passed = stages.iter().map(|s| s.result.passed).sum();
        let timed_out = stages.iter().map(|s| s.result.timed_out).sum();
        Self {
            stages,
            total,
            passed,
            failed: total - passed,
            timed_out,
            duration,
            debug_exit_code: None,
        }
    }

    /// Returns true if nothing failed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.debug_exit_code.is_none_or(|code| code == 0)
    }

    /// Process exit code for the run.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Every failed job with the name of its stage.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProcessResult)> {
        self.stages.iter().flat_map(|s| {
            s.result
                .results
                .iter()
                .filter(|r| !r.passed())
                .map(move |r| (s.name.as_str(), r))
        })
    }
}

/// What a stage will do, for `plan` output.
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    /// Stage name.
    pub name: String,
    /// Feature kind.
    pub kind: FeatureKind,
    /// Concurrent workers.
    pub workers: usize,
    /// Shards, rendered as `ids/ids`.
    pub shards: Vec<String>,
    /// Sharded tests.
    pub tests: Vec<String>,
    /// Custom tests, run after the sharded ones.
    pub custom: Vec<String>,
}

/// Stages built for a run.
#[derive(Debug)]
pub struct TestPlan {
    config: Config,
    system: System,
    runner: Runner,
    tests: Vec<TestSpec>,
    stages: Vec<Stage>,
}

impl TestPlan {
    /// Discovers tests and builds every stage.
    ///
    /// # Errors
    ///
    /// Fails if discovery fails or any stage cannot be built.
    pub async fn new(config: Config, system: System) -> Result<Self, StageError> {
        let runner = Runner::from_config(&config)?;
        let tests = runner.test_specs(&config).await?;
        Self::with_tests(config, system, runner, tests)
    }

    /// Builds every stage for an already discovered test list.
    ///
    /// # Errors
    ///
    /// Fails on the first stage that cannot be built, or when a debugger is
    /// selected and the first stage does not have exactly one test.
    pub fn with_tests(
        config: Config,
        system: System,
        runner: Runner,
        tests: Vec<TestSpec>,
    ) -> Result<Self, StageError> {
        let mut kinds: Vec<FeatureKind> = Vec::new();
        for kind in &config.features {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }

        let stages = kinds
            .into_iter()
            .map(|kind| Stage::new(stage_for(kind), &config, &system, &tests))
            .collect::<Result<Vec<_>, _>>()?;

        // Only the first stage runs under a debugger; the session ends the run.
        if let Some(debugger) = config.execution.debugger
            && let Some(first) = stages.first()
            && first.tests().len() != 1
        {
            return Err(debug_test_count(debugger, first.name(), first.tests().len()));
        }

        Ok(Self {
            config,
            system,
            runner,
            tests,
            stages,
        })
    }

    /// The discovered tests.
    pub fn tests(&self) -> &[TestSpec] {
        &self.tests
    }

    /// The stages, in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Describes every stage without running anything.
    pub fn describe(&self) -> Vec<StagePlan> {
        self.stages
            .iter()
            .map(|stage| {
                let (custom, sharded): (Vec<&TestSpec>, Vec<&TestSpec>) =
                    stage.tests().iter().partition(|t| t.custom.is_some());
                StagePlan {
                    name: stage.name().to_string(),
                    kind: stage.kind(),
                    workers: stage.spec().workers,
                    shards: stage.spec().shards.iter().map(|s| s.to_string()).collect(),
                    tests: sharded.iter().map(|t| t.display.clone()).collect(),
                    custom: custom.iter().map(|t| t.display.clone()).collect(),
                }
            })
            .collect()
    }

    /// Runs every stage in order.
    ///
    /// A debug session ends the run after its single job; the remaining
    /// stages are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first [`StageError`] raised by a stage.
    pub async fn execute(
        &mut self,
        launcher: &dyn ProcessLauncher,
        reporter: &dyn Reporter,
    ) -> Result<RunSummary, StageError> {
        let start = Instant::now();
        let mut reports = Vec::new();

        for stage in &mut self.stages {
            let outcome = stage
                .execute(&self.config, &self.system, &self.runner, launcher, reporter)
                .await?;

            if let StageOutcome::DebugSessionEnded { exit_code } = outcome {
                info!("Debug session ended with exit code {}", exit_code);
                let mut summary = RunSummary::new(reports, start.elapsed());
                summary.debug_exit_code = Some(exit_code);
                return Ok(summary);
            }

            if let Some(result) = stage.result() {
                reports.push(StageReport {
                    name: stage.name().to_string(),
                    kind: stage.kind(),
                    result: result.clone(),
                });
            }
        }

        let summary = RunSummary::new(reports, start.elapsed());
        info!(
            "Run complete: {}/{} passed in {:.2}s",
            summary.passed,
            summary.total,
            summary.duration.as_secs_f64()
        );
        reporter.on_run_complete(&summary).await;
        Ok(summary)
    }
}
