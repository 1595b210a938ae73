//! Test stages: one per feature kind.
//!
//! A [`Stage`] pairs a [`StagePolicy`] (how a feature consumes resources and
//! which flags bind a job to them) with the shards computed for the host
//! inventory, and runs every test assigned to it.
//!
//! # Execution
//!
//! ```text
//! sharded tests ──► queue ──► worker 0 ─┐
//!                         ──► worker 1 ─┼─ acquire shard ─► launch ─► release
//!                         ──► worker N ─┘
//! custom tests  ──► sequential, no shard
//! ```
//!
//! Results are ordered sharded-first, then custom, each in submission order,
//! regardless of completion order.

pub mod cpu;
pub mod eager;
pub mod gpu;
pub mod omp;
mod pool;
mod result;
mod spec;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{Config, CpuPin, Debugger, FeatureKind};
use crate::launcher::{ProcessLauncher, ProcessResult};
use crate::report::Reporter;
use crate::runner::{Runner, TestSpec};
use crate::system::System;

pub use cpu::CpuStage;
pub use eager::EagerStage;
pub use gpu::GpuStage;
pub use omp::OmpStage;
pub use pool::{ShardLease, ShardPool};
pub use result::StageResult;
pub use spec::{PartitionRequest, Shard, StageSpec, adjust_workers, partition};

/// Environment overrides for a test process.
pub type EnvMap = BTreeMap<String, String>;

/// Errors that stop a stage from being built or run.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Settings that can never produce a valid run.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// More workers requested than the inventory supports, or none supported
    /// at all while tests are waiting.
    #[error("Not enough resources: requested {requested} workers, at most {max} available")]
    ResourceExhausted {
        /// Workers asked for.
        requested: usize,
        /// Workers the inventory supports.
        max: usize,
    },

    /// The test command cannot be built or started at all.
    #[error("Launch error: {0}")]
    Launch(String),
}

/// How one feature kind consumes resources and binds jobs to them.
#[async_trait]
pub trait StagePolicy: Send + Sync + fmt::Debug {
    /// The feature this policy exercises.
    fn kind(&self) -> FeatureKind;

    /// Short name used in reports.
    fn name(&self) -> &'static str;

    /// Flags added to every job of the stage, before the shard flags.
    fn args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Environment overrides specific to this feature.
    fn env(&self, config: &Config, system: &System) -> EnvMap;

    /// Flags binding a job to `shard`.
    fn shard_args(&self, shard: &Shard, config: &Config) -> Vec<String>;

    /// Hook awaited before each sharded launch.
    async fn delay(&self, _shard: &Shard, _config: &Config, _system: &System) {}

    /// Computes workers and shards for the inventory.
    fn compute_spec(&self, config: &Config, system: &System) -> Result<StageSpec, StageError>;
}

/// Returns the policy for a feature kind.
pub fn stage_for(kind: FeatureKind) -> Box<dyn StagePolicy> {
    match kind {
        FeatureKind::Cpus => Box::new(CpuStage),
        FeatureKind::Openmp => Box::new(OmpStage),
        FeatureKind::Cuda => Box::new(GpuStage),
        FeatureKind::Eager => Box::new(EagerStage),
    }
}

/// Disables the runtime's own core pinning.
pub const UNPIN_ENV: [(&str, &str); 1] = [("REALM_SYNTHETIC_CORE_MAP", "")];

/// Environment for stages that honor `cpu_pin`: empty under strict pinning,
/// [`UNPIN_ENV`] otherwise.
pub(crate) fn pin_env(config: &Config) -> EnvMap {
    if config.execution.cpu_pin == CpuPin::Strict {
        EnvMap::new()
    } else {
        UNPIN_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// One extra core per rank under strict pinning.
pub(crate) fn strict_reserve(config: &Config) -> usize {
    usize::from(config.execution.cpu_pin == CpuPin::Strict)
}

/// Resolves a per-rank cost computed with checked arithmetic; `None` means
/// the configured sizes overflowed.
pub(crate) fn checked_cost(kind: FeatureKind, cost: Option<usize>) -> Result<usize, StageError> {
    cost.ok_or_else(|| {
        StageError::InvalidConfiguration(format!(
            "per-rank resource sizes for the {} stage overflow",
            kind
        ))
    })
}

/// `--cpu-bind <shard>` unless pinning is disabled.
pub(crate) fn cpu_bind_args(shard: &Shard, config: &Config) -> Vec<String> {
    if config.execution.cpu_pin == CpuPin::None {
        Vec::new()
    } else {
        vec!["--cpu-bind".to_string(), shard.to_string()]
    }
}

/// `--ranks-per-node <n>` when more than one rank runs per job.
pub(crate) fn ranks_args(config: &Config) -> Vec<String> {
    let rpn = config.multi_node.ranks_per_node;
    if rpn > 1 {
        vec!["--ranks-per-node".to_string(), rpn.to_string()]
    } else {
        Vec::new()
    }
}

/// A debug session drives exactly one test.
pub(crate) fn debug_test_count(debugger: Debugger, stage: &str, tests: usize) -> StageError {
    StageError::InvalidConfiguration(format!(
        "{} needs exactly one test, the {} stage has {}",
        debugger.program(),
        stage,
        tests
    ))
}

/// How a stage run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Every assigned job ran; see [`Stage::result`].
    Completed,
    /// A debugger session ran the stage's single test. No further stages
    /// should run.
    DebugSessionEnded {
        /// Exit code of the debugger process.
        exit_code: i32,
    },
}

/// A test stage for one feature kind.
#[derive(Debug)]
pub struct Stage {
    policy: Box<dyn StagePolicy>,
    spec: StageSpec,
    pool: ShardPool,
    tests: Vec<TestSpec>,
    env: EnvMap,
    result: Option<StageResult>,
}

impl Stage {
    /// Builds a stage: computes its shards and selects its tests.
    ///
    /// Sharded tests are assigned to every stage; custom tests only to the
    /// stages their kind selector matches.
    ///
    /// # Errors
    ///
    /// - Any error from [`StagePolicy::compute_spec`]
    /// - [`StageError::ResourceExhausted`] if the inventory supports no
    ///   workers but tests are assigned
    pub fn new(
        policy: Box<dyn StagePolicy>,
        config: &Config,
        system: &System,
        specs: &[TestSpec],
    ) -> Result<Self, StageError> {
        let kind = policy.kind();
        let tests: Vec<TestSpec> = specs
            .iter()
            .filter(|s| s.runs_under(kind))
            .cloned()
            .collect();

        let spec = policy.compute_spec(config, system)?;
        if spec.workers == 0 && !tests.is_empty() {
            return Err(StageError::ResourceExhausted {
                requested: 1,
                max: 0,
            });
        }

        let mut env = config.env.clone();
        env.extend(policy.env(config, system));
        for var in &config.execution.passthrough_env {
            if let Some(value) = system.env.get(var) {
                env.insert(var.clone(), value.clone());
            }
        }

        debug!(
            "{} stage: {} workers, {} shards, {} tests",
            policy.name(),
            spec.workers,
            spec.shards.len(),
            tests.len()
        );

        Ok(Self {
            pool: ShardPool::new(spec.shards.clone()),
            policy,
            spec,
            tests,
            env,
            result: None,
        })
    }

    /// The feature kind of this stage.
    pub fn kind(&self) -> FeatureKind {
        self.policy.kind()
    }

    /// Short name used in reports.
    pub fn name(&self) -> &'static str {
        self.policy.name()
    }

    /// Workers and shards.
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// Tests assigned to this stage, in submission order.
    pub fn tests(&self) -> &[TestSpec] {
        &self.tests
    }

    /// The full environment applied to every job.
    pub fn env(&self) -> &EnvMap {
        &self.env
    }

    /// The stage's shard pool.
    pub fn pool(&self) -> &ShardPool {
        &self.pool
    }

    /// The aggregated result, once [`execute`](Self::execute) completed.
    pub fn result(&self) -> Option<&StageResult> {
        self.result.as_ref()
    }

    /// Runs every assigned test and records the stage result.
    ///
    /// Job failures, timeouts, and per-job spawn errors are recorded in the
    /// result rather than returned.
    ///
    /// # Errors
    ///
    /// - [`StageError::InvalidConfiguration`] if a debugger is selected and
    ///   the stage does not have exactly one test
    /// - [`StageError::Launch`] if the debugger process cannot be started
    pub async fn execute(
        &mut self,
        config: &Config,
        system: &System,
        runner: &Runner,
        launcher: &dyn ProcessLauncher,
        reporter: &dyn Reporter,
    ) -> Result<StageOutcome, StageError> {
        if let Some(debugger) = config.execution.debugger {
            let [test] = self.tests.as_slice() else {
                return Err(debug_test_count(debugger, self.name(), self.tests.len()));
            };
            let mut args = self.policy.args();
            if let Some(shard) = self.spec.shards.first() {
                args.extend(self.policy.shard_args(shard, config));
            }
            let cmd = runner
                .cmd_debug(test, config, debugger, &args)
                .envs(self.env.clone());

            info!("Starting {} for {}", debugger.program(), test.display);
            let exit_code = launcher
                .run_interactive(&cmd)
                .await
                .map_err(|e| StageError::Launch(e.to_string()))?;
            return Ok(StageOutcome::DebugSessionEnded { exit_code });
        }

        info!(
            "Running {} tests in the {} stage with {} workers",
            self.tests.len(),
            self.name(),
            self.spec.workers
        );
        reporter
            .on_stage_start(self.name(), &self.spec, self.tests.len())
            .await;

        let start = Instant::now();
        let (sharded, custom): (Vec<&TestSpec>, Vec<&TestSpec>) =
            self.tests.iter().partition(|t| t.custom.is_none());

        let mut results = self
            .run_sharded(&sharded, config, system, runner, launcher, reporter)
            .await;

        for test in custom {
            let result = self.run_job(test, None, config, system, runner, launcher).await;
            reporter.on_job_complete(self.name(), None, &result).await;
            results.push(result);
        }

        let result = StageResult::new(results, start.elapsed());
        reporter.on_stage_complete(self.name(), &result).await;
        self.result = Some(result);

        Ok(StageOutcome::Completed)
    }

    async fn run_sharded(
        &self,
        tests: &[&TestSpec],
        config: &Config,
        system: &System,
        runner: &Runner,
        launcher: &dyn ProcessLauncher,
        reporter: &dyn Reporter,
    ) -> Vec<ProcessResult> {
        let queue = tokio::sync::Mutex::new(
            tests
                .iter()
                .copied()
                .enumerate()
                .collect::<VecDeque<_>>(),
        );

        let worker = |id: usize| {
            let queue = &queue;
            async move {
                let mut done = Vec::new();
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some((index, test)) = next else {
                        break;
                    };

                    let lease = self.pool.acquire().await;
                    debug!("Worker {} running {} on shard {}", id, test.display, *lease);
                    let result = self
                        .run_job(test, Some(lease.shard()), config, system, runner, launcher)
                        .await;
                    reporter
                        .on_job_complete(self.name(), Some(lease.shard()), &result)
                        .await;
                    drop(lease);

                    done.push((index, result));
                }
                done
            }
        };

        let workers = self.spec.workers.min(tests.len());
        let mut results: Vec<(usize, ProcessResult)> = join_all((0..workers).map(worker))
            .await
            .into_iter()
            .flatten()
            .collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn run_job(
        &self,
        test: &TestSpec,
        shard: Option<&Shard>,
        config: &Config,
        system: &System,
        runner: &Runner,
        launcher: &dyn ProcessLauncher,
    ) -> ProcessResult {
        let mut args = self.policy.args();
        if let Some(shard) = shard {
            args.extend(self.policy.shard_args(shard, config));
        }
        let custom_args = test
            .custom
            .as_ref()
            .map(|c| c.args.as_slice())
            .unwrap_or_default();

        let cmd = runner
            .cmd(test, config, &args, custom_args)
            .envs(self.env.clone());

        if let Some(shard) = shard {
            self.policy.delay(shard, config, system).await;
        }

        match launcher.run(&cmd, &test.display, config.timeout()).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Failed to launch {}: {}", test.display, e);
                ProcessResult::launch_failure(&test.display, &cmd, &e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::{Debugger, KindSelector};
    use crate::launcher::{Command, LaunchError};
    use crate::plan::RunSummary;
    use crate::runner::CustomTest;

    /// Launcher that never spawns anything. Tests named `*fail*` exit 1,
    /// `*slow*` time out, `*missing*` fail to spawn.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub commands: Mutex<Vec<Command>>,
        pub interactive: Mutex<Vec<Command>>,
        running: AtomicUsize,
        pub max_running: AtomicUsize,
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn run(
            &self,
            cmd: &Command,
            display: &str,
            timeout: Option<Duration>,
        ) -> Result<ProcessResult, LaunchError> {
            self.commands.lock().unwrap().push(cmd.clone());
            if display.contains("missing") {
                return Err(LaunchError::Spawn {
                    program: cmd.program.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let timed_out = display.contains("slow") && timeout.is_some();
            Ok(ProcessResult {
                test: display.to_string(),
                invocation: cmd.to_shell_string(),
                exit_code: if display.contains("fail") || timed_out { -1 } else { 0 },
                output: String::new(),
                time: Duration::from_millis(10),
                timed_out,
            })
        }

        async fn run_interactive(&self, cmd: &Command) -> Result<i32, LaunchError> {
            self.interactive.lock().unwrap().push(cmd.clone());
            Ok(0)
        }
    }

    /// Reporter that records events as strings.
    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reporter for RecordingReporter {
        async fn on_stage_start(&self, stage: &str, _spec: &StageSpec, tests: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("start {} {}", stage, tests));
        }

        async fn on_job_complete(&self, stage: &str, shard: Option<&Shard>, result: &ProcessResult) {
            let shard = shard.map(Shard::to_string).unwrap_or_else(|| "-".to_string());
            self.events
                .lock()
                .unwrap()
                .push(format!("job {} {} {}", stage, result.test, shard));
        }

        async fn on_stage_complete(&self, stage: &str, result: &StageResult) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {} {}/{}", stage, result.passed, result.total));
        }

        async fn on_run_complete(&self, _summary: &RunSummary) {}
    }

    fn script_config() -> Config {
        let mut config = Config::default();
        config.tests.driver = "legate".to_string();
        config.core.cpus = 1;
        config.core.utility = 0;
        config
    }

    fn specs(names: &[&str]) -> Vec<TestSpec> {
        names.iter().map(|n| TestSpec::file(*n)).collect()
    }

    async fn run_stage(
        config: &Config,
        system: &System,
        tests: &[TestSpec],
        launcher: &FakeLauncher,
        reporter: &RecordingReporter,
    ) -> Stage {
        let runner = Runner::from_config(config).unwrap();
        let mut stage = Stage::new(stage_for(FeatureKind::Cpus), config, system, tests).unwrap();
        let outcome = stage
            .execute(config, system, &runner, launcher, reporter)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        stage
    }

    #[tokio::test]
    async fn test_every_test_runs_exactly_once() {
        let config = script_config();
        let system = System::synthetic(3, 0);
        let tests = specs(&["a.py", "b.py", "c.py", "d.py", "e.py", "f.py", "g.py"]);
        let launcher = FakeLauncher::default();
        let reporter = RecordingReporter::default();

        let stage = run_stage(&config, &system, &tests, &launcher, &reporter).await;
        let result = stage.result().unwrap();

        let names: Vec<_> = result.results.iter().map(|r| r.test.as_str()).collect();
        assert_eq!(names, vec!["a.py", "b.py", "c.py", "d.py", "e.py", "f.py", "g.py"]);
        assert_eq!(result.passed, 7);
        assert_eq!(launcher.commands.lock().unwrap().len(), 7);
        assert!(launcher.max_running.load(Ordering::SeqCst) <= 3);
        assert_eq!(stage.pool().available(), 3);
    }

    #[tokio::test]
    async fn test_timeout_releases_shard_and_stage_continues() {
        let mut config = script_config();
        config.execution.timeout_secs = Some(1);
        let system = System::synthetic(1, 0);
        let tests = specs(&["slow.py", "after.py"]);
        let launcher = FakeLauncher::default();
        let reporter = RecordingReporter::default();

        let stage = run_stage(&config, &system, &tests, &launcher, &reporter).await;
        let result = stage.result().unwrap();

        assert!(result.results[0].timed_out);
        assert!(result.results[1].passed());
        assert_eq!((result.total, result.passed, result.timed_out), (2, 1, 1));
        assert_eq!(stage.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_custom_tests_run_after_sharded_without_shard() {
        let config = script_config();
        let system = System::synthetic(2, 0);
        let custom = CustomTest {
            kind: Some(KindSelector::Many(vec![FeatureKind::Cpus, FeatureKind::Cuda])),
            args: vec!["--custom".to_string()],
        };
        let skipped = CustomTest {
            kind: Some(KindSelector::One(FeatureKind::Cuda)),
            args: Vec::new(),
        };
        let tests = vec![
            TestSpec::file("custom.py").with_custom(custom),
            TestSpec::file("one.py"),
            TestSpec::file("gpu_only.py").with_custom(skipped),
            TestSpec::file("two.py"),
        ];
        let launcher = FakeLauncher::default();
        let reporter = RecordingReporter::default();

        let stage = run_stage(&config, &system, &tests, &launcher, &reporter).await;
        let names: Vec<_> = stage
            .result()
            .unwrap()
            .results
            .iter()
            .map(|r| r.test.clone())
            .collect();
        assert_eq!(names, vec!["one.py", "two.py", "custom.py"]);

        let commands = launcher.commands.lock().unwrap();
        let custom_cmd = commands.last().unwrap();
        assert_eq!(custom_cmd.args, vec!["custom.py", "--custom"]);
        assert!(commands[0].args.contains(&"--cpus".to_string()));

        let events = reporter.events.lock().unwrap();
        assert_eq!(events.first().unwrap(), "start CPU 3");
        assert!(events.contains(&"job CPU custom.py -".to_string()));
        assert_eq!(events.last().unwrap(), "done CPU 3/3");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_failed_result() {
        let config = script_config();
        let system = System::synthetic(2, 0);
        let tests = specs(&["missing.py", "fail.py", "ok.py"]);
        let launcher = FakeLauncher::default();
        let reporter = RecordingReporter::default();

        let stage = run_stage(&config, &system, &tests, &launcher, &reporter).await;
        let result = stage.result().unwrap();
        assert_eq!(result.results[0].exit_code, -1);
        assert_eq!((result.total, result.passed), (3, 1));
        assert_eq!(stage.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_stage_env_layers_config_policy_and_passthrough() {
        let mut config = script_config();
        config.env.insert("FROM_CONFIG".to_string(), "1".to_string());
        let mut system = System::synthetic(2, 0);
        system
            .env
            .insert("LEGATE_CONFIG".to_string(), "--logging x".to_string());
        system.env.insert("UNRELATED".to_string(), "y".to_string());

        let launcher = FakeLauncher::default();
        let reporter = RecordingReporter::default();
        run_stage(&config, &system, &specs(&["a.py"]), &launcher, &reporter).await;

        let env = launcher.commands.lock().unwrap()[0].env.clone();
        assert_eq!(env.get("FROM_CONFIG").map(String::as_str), Some("1"));
        assert_eq!(env.get("REALM_SYNTHETIC_CORE_MAP").map(String::as_str), Some(""));
        assert_eq!(env.get("LEGATE_CONFIG").map(String::as_str), Some("--logging x"));
        assert!(!env.contains_key("UNRELATED"));
    }

    #[test]
    fn test_zero_workers_with_tests_is_exhausted() {
        let config = script_config();
        let system = System::synthetic(0, 0);
        let err = Stage::new(stage_for(FeatureKind::Cpus), &config, &system, &specs(&["a.py"]))
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::ResourceExhausted { requested: 1, max: 0 }
        ));

        assert!(Stage::new(stage_for(FeatureKind::Cpus), &config, &system, &[]).is_ok());
    }

    #[tokio::test]
    async fn test_debugger_needs_exactly_one_test() {
        let mut config = script_config();
        config.execution.debugger = Some(Debugger::Gdb);
        let system = System::synthetic(2, 0);
        let runner = Runner::from_config(&config).unwrap();
        let launcher = FakeLauncher::default();

        let mut stage = Stage::new(
            stage_for(FeatureKind::Cpus),
            &config,
            &system,
            &specs(&["a.py", "b.py"]),
        )
        .unwrap();
        let err = stage
            .execute(
                &config,
                &system,
                &runner,
                &launcher,
                &RecordingReporter::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::InvalidConfiguration(_)));
        assert!(launcher.interactive.lock().unwrap().is_empty());
        assert!(launcher.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debugger_runs_single_job_interactively() {
        let mut config = script_config();
        config.execution.debugger = Some(Debugger::Gdb);
        let system = System::synthetic(2, 0);
        let runner = Runner::from_config(&config).unwrap();
        let launcher = FakeLauncher::default();
        let reporter = RecordingReporter::default();

        let mut stage = Stage::new(
            stage_for(FeatureKind::Cpus),
            &config,
            &system,
            &specs(&["a.py"]),
        )
        .unwrap();
        let outcome = stage
            .execute(&config, &system, &runner, &launcher, &reporter)
            .await
            .unwrap();

        assert_eq!(outcome, StageOutcome::DebugSessionEnded { exit_code: 0 });
        assert!(stage.result().is_none());
        assert!(launcher.commands.lock().unwrap().is_empty());

        let interactive = launcher.interactive.lock().unwrap();
        assert_eq!(interactive.len(), 1);
        assert_eq!(interactive[0].program, "gdb");
        assert_eq!(&interactive[0].args[..2], &["--args", "legate"]);
    }
}
