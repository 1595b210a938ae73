//! shardrun: a resource-sharded test stage runner.
//!
//! Tests run once per selected feature (`cpus`, `openmp`, `cuda`, `eager`).
//! Each feature is a stage that carves the host's CPU cores or GPUs into
//! disjoint shards and runs as many tests at a time as there are shards,
//! binding every job to the shard it holds.
//!
//! # Architecture
//!
//! - **System**: detects the CPU core groups and GPUs to shard
//! - **Runner**: discovers tests and builds their command lines
//! - **Stage**: partitions the inventory and runs tests over a shard pool
//! - **Launcher**: spawns, times out, and reaps test processes
//! - **Plan**: builds every stage, runs them in order, totals the results
//! - **Report**: console progress and summaries
//!
//! # Example
//!
//! ```no_run
//! use shardrun::{LocalLauncher, NullReporter, System, TestPlan, load_config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardrun.toml"))?;
//!     let system = System::detect(&config.system).await;
//!     let mut plan = TestPlan::new(config, system).await?;
//!     let summary = plan.execute(&LocalLauncher::new(), &NullReporter).await?;
//!     println!("{}/{} passed", summary.passed, summary.total);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod launcher;
pub mod plan;
pub mod report;
pub mod runner;
pub mod stage;
pub mod system;

// Re-export commonly used types
pub use config::{Config, FeatureKind, load_config};
pub use launcher::{LocalLauncher, ProcessLauncher, ProcessResult};
pub use plan::{RunSummary, TestPlan};
pub use report::{ConsoleReporter, NullReporter, Reporter};
pub use runner::{Runner, TestSpec};
pub use stage::{Shard, Stage, StageError, StageResult, StageSpec};
pub use system::System;
