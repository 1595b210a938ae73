//! Progress and result reporting.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use crate::launcher::ProcessResult;
use crate::plan::RunSummary;
use crate::stage::{Shard, StageResult, StageSpec};

/// Receives events while stages run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called when a stage starts, before any job launches.
    async fn on_stage_start(&self, stage: &str, spec: &StageSpec, tests: usize);

    /// Called after each job. `shard` is `None` for custom tests.
    async fn on_job_complete(&self, stage: &str, shard: Option<&Shard>, result: &ProcessResult);

    /// Called when every job of a stage has returned.
    async fn on_stage_complete(&self, stage: &str, result: &StageResult);

    /// Called once after the last stage.
    async fn on_run_complete(&self, summary: &RunSummary);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_stage_start(&self, _stage: &str, _spec: &StageSpec, _tests: usize) {}
    async fn on_job_complete(&self, _stage: &str, _shard: Option<&Shard>, _result: &ProcessResult) {
    }
    async fn on_stage_complete(&self, _stage: &str, _result: &StageResult) {}
    async fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Console reporter with a per-stage progress bar.
///
/// In verbose mode every job is printed as it completes and no progress bar
/// is drawn. Otherwise only failures are printed, above the bar.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn progress(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One status line for a finished job.
fn job_line(stage: &str, shard: Option<&Shard>, result: &ProcessResult) -> String {
    let status = if result.timed_out {
        console::style("TIME").yellow()
    } else if result.passed() {
        console::style("PASS").green()
    } else {
        console::style("FAIL").red()
    };
    let shard = shard.map_or_else(|| "custom".to_string(), |s| s.to_string());

    format!(
        "{} ({}) {} {} {:.2}s",
        status,
        stage,
        console::style(format!("[{}]", shard)).dim(),
        result.test,
        result.time.as_secs_f64()
    )
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_stage_start(&self, stage: &str, spec: &StageSpec, tests: usize) {
        println!(
            "{} {} tests, {} workers",
            console::style(format!("Entering stage: {}", stage)).bold(),
            tests,
            spec.workers
        );

        if self.verbose || tests == 0 {
            return;
        }

        let pb = ProgressBar::new(tests as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        *self.progress() = Some(pb);
    }

    async fn on_job_complete(&self, stage: &str, shard: Option<&Shard>, result: &ProcessResult) {
        let line = job_line(stage, shard, result);

        if let Some(pb) = self.progress().as_ref() {
            pb.inc(1);
            if !result.passed() {
                pb.println(line);
            }
            return;
        }

        println!("{}", line);
        if self.verbose && !result.passed() && !result.output.is_empty() {
            println!("    {}", console::style(result.invocation.as_str()).dim());
            for l in result.output.lines() {
                println!("    {}", l);
            }
        }
    }

    async fn on_stage_complete(&self, stage: &str, result: &StageResult) {
        if let Some(pb) = self.progress().take() {
            pb.finish_and_clear();
        }

        let summary = format!(
            "{}: {}/{} passed ({} timed out) in {:.2}s",
            stage,
            result.passed,
            result.total,
            result.timed_out,
            result.time.as_secs_f64()
        );
        if result.success() {
            println!("{}", console::style(summary).green());
        } else {
            println!("{}", console::style(summary).red());
        }
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        println!();
        println!("Test Results:");
        println!("  Total:     {}", summary.total);
        println!("  Passed:    {}", console::style(summary.passed).green());
        println!("  Failed:    {}", console::style(summary.failed).red());
        if summary.timed_out > 0 {
            println!("  Timed out: {}", console::style(summary.timed_out).yellow());
        }
        println!("  Duration:  {:.2}s", summary.duration.as_secs_f64());

        println!();
        if summary.success() {
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }

        println!("{}", console::style("Some tests failed.").red().bold());
        println!();
        println!("Failed tests:");
        for (stage, result) in summary.failures() {
            println!("  - ({}) {}", stage, result.test);
            println!("    {}", console::style(result.invocation.as_str()).dim());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn result(exit_code: i32, timed_out: bool) -> ProcessResult {
        ProcessResult {
            test: "tests/test_io.py".to_string(),
            invocation: "legate tests/test_io.py".to_string(),
            exit_code,
            output: String::new(),
            time: Duration::from_millis(1500),
            timed_out,
        }
    }

    #[test]
    fn test_job_line() {
        console::set_colors_enabled(false);
        let shard = Shard::new(vec![vec![0, 1]]);

        assert_eq!(
            job_line("CPU", Some(&shard), &result(0, false)),
            "PASS (CPU) [0,1] tests/test_io.py 1.50s"
        );
        assert_eq!(
            job_line("CPU", None, &result(1, false)),
            "FAIL (CPU) [custom] tests/test_io.py 1.50s"
        );
        assert!(job_line("GPU", Some(&shard), &result(-1, true)).starts_with("TIME (GPU)"));
    }
}
