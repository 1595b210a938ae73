//! Configuration schema definitions for shardrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section is optional and falls back to the
//! defaults documented on each field.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── features              - Feature stages to run (cpus, openmp, cuda, eager)
//! ├── env                   - Extra environment for every test process
//! ├── CoreConfig            - Per-feature resource sizes
//! ├── ExecutionConfig       - Workers, timeout, CPU pinning, debugger
//! ├── MultiNodeConfig       - Launcher topology
//! ├── TestsConfig           - Test discovery and custom per-test overrides
//! ├── SystemConfig          - Optional synthetic resource inventory
//! └── InfoConfig            - Output verbosity
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for shardrun.
///
/// # TOML Structure
///
/// ```toml
/// features = ["cpus", "cuda"]
///
/// [core]
/// cpus = 2
/// gpus = 1
///
/// [execution]
/// workers = 4
/// timeout_secs = 600
/// cpu_pin = "strict"
///
/// [tests]
/// root = "tests/integration"
/// pattern = '\.py$'
/// ```
///
/// # Example
///
/// ```
/// use shardrun::config::{Config, FeatureKind};
///
/// let config: Config = toml::from_str(r#"
///     features = ["cpus", "eager"]
///
///     [core]
///     cpus = 1
/// "#).unwrap();
///
/// assert_eq!(config.features, vec![FeatureKind::Cpus, FeatureKind::Eager]);
/// assert_eq!(config.core.utility, 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Feature stages to run, in order.
    ///
    /// Default: `["cpus"]`
    #[serde(default = "default_features")]
    pub features: Vec<FeatureKind>,

    /// Extra environment variables applied to every test process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Resource sizes requested per rank for each feature.
    #[serde(default)]
    pub core: CoreConfig,

    /// Worker, timeout, pinning and debugger settings.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Launcher topology for multi-rank jobs.
    #[serde(default)]
    pub multi_node: MultiNodeConfig,

    /// Test discovery and command construction.
    #[serde(default)]
    pub tests: TestsConfig,

    /// Optional synthetic resource inventory.
    #[serde(default)]
    pub system: SystemConfig,

    /// Output settings.
    #[serde(default)]
    pub info: InfoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            features: default_features(),
            env: BTreeMap::new(),
            core: CoreConfig::default(),
            execution: ExecutionConfig::default(),
            multi_node: MultiNodeConfig::default(),
            tests: TestsConfig::default(),
            system: SystemConfig::default(),
            info: InfoConfig::default(),
        }
    }
}

fn default_features() -> Vec<FeatureKind> {
    vec![FeatureKind::Cpus]
}

/// The feature kind exercised by a test stage.
///
/// Serialized in lowercase (`cpus`, `openmp`, `cuda`, `eager`), matching
/// the `--use` values accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    /// Plain CPU execution.
    Cpus,
    /// OpenMP processor groups.
    Openmp,
    /// CUDA GPUs.
    Cuda,
    /// Single-core eager execution.
    Eager,
}

impl FeatureKind {
    /// All feature kinds, in canonical stage order.
    pub const ALL: [FeatureKind; 4] = [
        FeatureKind::Cpus,
        FeatureKind::Openmp,
        FeatureKind::Cuda,
        FeatureKind::Eager,
    ];

    /// The configuration name of this feature.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Cpus => "cpus",
            FeatureKind::Openmp => "openmp",
            FeatureKind::Cuda => "cuda",
            FeatureKind::Eager => "eager",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown feature '{}'", s))
    }
}

/// Per-rank resource sizes for each feature.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `cpus` | 2 |
/// | `gpus` | 1 |
/// | `omps` | 1 |
/// | `ompthreads` | 4 |
/// | `utility` | 1 |
/// | `fbmem` | 4096 (MiB) |
/// | `sysmem` | 300 (MiB) |
/// | `numamem` | 0 (MiB) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// CPU processors per rank for the `cpus` stage.
    #[serde(default = "default_cpus")]
    pub cpus: usize,

    /// GPUs per rank for the `cuda` stage.
    #[serde(default = "default_gpus")]
    pub gpus: usize,

    /// OpenMP groups per rank for the `openmp` stage.
    #[serde(default = "default_omps")]
    pub omps: usize,

    /// Threads per OpenMP group.
    #[serde(default = "default_ompthreads")]
    pub ompthreads: usize,

    /// Utility processors per rank.
    #[serde(default = "default_utility")]
    pub utility: usize,

    /// GPU framebuffer memory per rank, in MiB.
    #[serde(default = "default_fbmem")]
    pub fbmem: u64,

    /// System memory per rank for GPU jobs, in MiB.
    #[serde(default = "default_sysmem")]
    pub sysmem: u64,

    /// NUMA memory per OpenMP group, in MiB.
    #[serde(default)]
    pub numamem: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            gpus: default_gpus(),
            omps: default_omps(),
            ompthreads: default_ompthreads(),
            utility: default_utility(),
            fbmem: default_fbmem(),
            sysmem: default_sysmem(),
            numamem: 0,
        }
    }
}

fn default_cpus() -> usize {
    2
}

fn default_gpus() -> usize {
    1
}

fn default_omps() -> usize {
    1
}

fn default_ompthreads() -> usize {
    4
}

fn default_utility() -> usize {
    1
}

fn default_fbmem() -> u64 {
    4096
}

fn default_sysmem() -> u64 {
    300
}

/// CPU pinning policy for test processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CpuPin {
    /// Bind to the shard's cores, let the runtime place its own helpers.
    #[default]
    Partial,
    /// No `--cpu-bind` flags at all.
    None,
    /// Bind to the shard's cores and reserve one extra core per rank.
    Strict,
}

/// Interactive debugger selected for the single-job debug mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Debugger {
    /// GNU debugger.
    Gdb,
    /// NVIDIA CUDA debugger.
    CudaGdb,
}

impl Debugger {
    /// The debugger executable.
    pub fn program(&self) -> &'static str {
        match self {
            Debugger::Gdb => "gdb",
            Debugger::CudaGdb => "cuda-gdb",
        }
    }
}

/// Execution settings.
///
/// # Example
///
/// ```toml
/// [execution]
/// workers = 4
/// timeout_secs = 300
/// cpu_pin = "none"
/// gpu_delay_ms = 500
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Requested number of concurrent workers per stage.
    ///
    /// When unset, each stage uses as many workers as its resources allow.
    /// Zero is rejected when the stage is constructed.
    pub workers: Option<usize>,

    /// Per-test timeout in seconds. Unset means no timeout.
    pub timeout_secs: Option<u64>,

    /// CPU pinning policy.
    #[serde(default)]
    pub cpu_pin: CpuPin,

    /// Delay before each GPU job launch, in milliseconds.
    ///
    /// Default: 2000
    #[serde(default = "default_gpu_delay_ms")]
    pub gpu_delay_ms: u64,

    /// Upper bound on eager stage workers regardless of core count.
    ///
    /// Default: 60
    #[serde(default = "default_eager_worker_cap")]
    pub eager_worker_cap: usize,

    /// Run a single test interactively under this debugger.
    pub debugger: Option<Debugger>,

    /// Host environment variables forwarded to tests when set.
    ///
    /// Default: `["LEGATE_CONFIG"]`
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout_secs: None,
            cpu_pin: CpuPin::default(),
            gpu_delay_ms: default_gpu_delay_ms(),
            eager_worker_cap: default_eager_worker_cap(),
            debugger: None,
            passthrough_env: default_passthrough_env(),
        }
    }
}

fn default_gpu_delay_ms() -> u64 {
    2000
}

fn default_eager_worker_cap() -> usize {
    60
}

fn default_passthrough_env() -> Vec<String> {
    vec!["LEGATE_CONFIG".to_string()]
}

/// Launcher used for multi-rank jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Launcher {
    /// Single-process launch.
    #[default]
    None,
    /// Open MPI / MPICH `mpirun`.
    Mpirun,
    /// IBM `jsrun`.
    Jsrun,
    /// Slurm `srun`.
    Srun,
}

impl fmt::Display for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Launcher::None => "none",
            Launcher::Mpirun => "mpirun",
            Launcher::Jsrun => "jsrun",
            Launcher::Srun => "srun",
        };
        f.write_str(name)
    }
}

/// Multi-node launcher topology.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiNodeConfig {
    /// Launcher program.
    #[serde(default)]
    pub launcher: Launcher,

    /// Ranks launched on each node. Each rank gets its own resource group.
    #[serde(default = "default_one")]
    pub ranks_per_node: usize,

    /// Number of nodes.
    #[serde(default = "default_one")]
    pub nodes: usize,

    /// Extra arguments forwarded verbatim to the launcher.
    #[serde(default)]
    pub launcher_extra: Vec<String>,
}

impl Default for MultiNodeConfig {
    fn default() -> Self {
        Self {
            launcher: Launcher::None,
            ranks_per_node: 1,
            nodes: 1,
            launcher_extra: Vec::new(),
        }
    }
}

fn default_one() -> usize {
    1
}

/// How test commands are formed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Each test is a script or executable file.
    #[default]
    Script,
    /// Each test is a case inside a single googletest binary.
    Gtest,
}

/// Test discovery and command construction settings.
///
/// # Example
///
/// ```toml
/// [tests]
/// driver = "legate"
/// root = "tests/integration"
/// pattern = '\.py$'
/// extra_args = "-v --tb=short"
///
/// [[tests.custom]]
/// file = "tests/integration/test_mpi.py"
/// kind = ["cpus", "cuda"]
/// args = "--ranks 2"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestsConfig {
    /// Runner type.
    #[serde(default)]
    pub runner: RunnerKind,

    /// Program that wraps every test invocation.
    ///
    /// An empty string executes test files directly.
    ///
    /// Default: `"legate"`
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Explicit test files. Takes precedence over `root` discovery.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Directory searched recursively for test files.
    pub root: Option<PathBuf>,

    /// Regex matched against file names found under `root`.
    ///
    /// Default: `\.py$`
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Regex matched against test display names; non-matching tests are dropped.
    pub filter: Option<String>,

    /// The googletest binary for the `gtest` runner.
    pub gtest_binary: Option<PathBuf>,

    /// Extra arguments appended to every test command (shell syntax).
    #[serde(default)]
    pub extra_args: String,

    /// Working directory for test processes.
    pub working_dir: Option<PathBuf>,

    /// Tests that bypass sharding and carry their own arguments.
    #[serde(default)]
    pub custom: Vec<CustomTestConfig>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            runner: RunnerKind::default(),
            driver: default_driver(),
            files: Vec::new(),
            root: None,
            pattern: default_pattern(),
            filter: None,
            gtest_binary: None,
            extra_args: String::new(),
            working_dir: None,
            custom: Vec::new(),
        }
    }
}

fn default_driver() -> String {
    "legate".to_string()
}

fn default_pattern() -> String {
    r"\.py$".to_string()
}

/// A test that runs outside the shard pool with its own arguments.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomTestConfig {
    /// Test file path, or gtest display name for the `gtest` runner.
    pub file: String,

    /// Feature kinds this test runs under. Unset means every stage.
    pub kind: Option<KindSelector>,

    /// Extra arguments for this test (shell syntax).
    pub args: Option<String>,
}

/// A single feature kind or a set of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum KindSelector {
    /// Exactly one feature kind.
    One(FeatureKind),
    /// Any of several feature kinds.
    Many(Vec<FeatureKind>),
}

impl KindSelector {
    /// Returns true if a stage of `kind` should run the test.
    pub fn matches(&self, kind: FeatureKind) -> bool {
        match self {
            KindSelector::One(k) => *k == kind,
            KindSelector::Many(kinds) => kinds.contains(&kind),
        }
    }
}

/// Synthetic inventory overrides.
///
/// When `cpus` or `gpus` is set, the corresponding part of the host
/// inventory is replaced with `N` single-id groups. Useful for reproducible
/// plans and for CI hosts that misreport their topology.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Number of synthetic CPU groups.
    pub cpus: Option<usize>,

    /// Number of synthetic GPUs.
    pub gpus: Option<usize>,

    /// Memory of each synthetic GPU, in MiB.
    pub gpu_memory_mb: Option<u64>,
}

/// Output settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InfoConfig {
    /// Print every test's output, not only failures.
    #[serde(default)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.features, vec![FeatureKind::Cpus]);
        assert_eq!(config.core.cpus, 2);
        assert_eq!(config.core.ompthreads, 4);
        assert_eq!(config.execution.cpu_pin, CpuPin::Partial);
        assert_eq!(config.execution.eager_worker_cap, 60);
        assert_eq!(config.multi_node.ranks_per_node, 1);
        assert_eq!(config.tests.driver, "legate");
        assert!(config.execution.workers.is_none());
    }

    #[test]
    fn test_kind_selector_single_and_many() {
        let config: Config = toml::from_str(
            r#"
            [[tests.custom]]
            file = "a.py"
            kind = "cuda"

            [[tests.custom]]
            file = "b.py"
            kind = ["cpus", "openmp"]

            [[tests.custom]]
            file = "c.py"
            "#,
        )
        .unwrap();

        let custom = &config.tests.custom;
        assert_eq!(custom[0].kind, Some(KindSelector::One(FeatureKind::Cuda)));
        assert!(custom[1].kind.as_ref().unwrap().matches(FeatureKind::Openmp));
        assert!(!custom[1].kind.as_ref().unwrap().matches(FeatureKind::Cuda));
        assert!(custom[2].kind.is_none());
    }

    #[test]
    fn test_enum_spellings() {
        let config: Config = toml::from_str(
            r#"
            [execution]
            cpu_pin = "strict"
            debugger = "cuda-gdb"

            [multi_node]
            launcher = "srun"
            "#,
        )
        .unwrap();

        assert_eq!(config.execution.cpu_pin, CpuPin::Strict);
        assert_eq!(config.execution.debugger, Some(Debugger::CudaGdb));
        assert_eq!(config.multi_node.launcher.to_string(), "srun");
    }

    #[test]
    fn test_feature_kind_from_str() {
        assert_eq!("openmp".parse::<FeatureKind>(), Ok(FeatureKind::Openmp));
        assert!("tpu".parse::<FeatureKind>().is_err());
    }
}
