//! The `eager` stage.

use async_trait::async_trait;

use super::{EnvMap, PartitionRequest, Shard, StageError, StagePolicy, StageSpec, partition};
use crate::config::{Config, FeatureKind};
use crate::system::System;

/// Disables test-mode checks and keeps every operation on a single chunk so
/// the runtime executes eagerly.
pub const EAGER_ENV: [(&str, &str); 4] = [
    ("LEGATE_TEST", "0"),
    ("LEGATE_MIN_CPU_CHUNK", "2000000000"),
    ("LEGATE_MIN_OMP_CHUNK", "2000000000"),
    ("LEGATE_MIN_GPU_CHUNK", "2000000000"),
];

/// Runs single-core, single-rank eager jobs.
///
/// Worker count is bounded by `execution.eager_worker_cap` no matter how
/// many cores the host has.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerStage;

#[async_trait]
impl StagePolicy for EagerStage {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Eager
    }

    fn name(&self) -> &'static str {
        "Eager"
    }

    fn env(&self, _config: &Config, _system: &System) -> EnvMap {
        EAGER_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn shard_args(&self, shard: &Shard, _config: &Config) -> Vec<String> {
        vec![
            "--cpus".to_string(),
            "1".to_string(),
            "--cpu-bind".to_string(),
            shard.to_string(),
        ]
    }

    fn compute_spec(&self, config: &Config, system: &System) -> Result<StageSpec, StageError> {
        let groups = system.cpu_groups();
        partition(&PartitionRequest {
            groups: &groups,
            cost: 1,
            ranks_per_node: 1,
            requested: config.execution.workers,
            cap: Some(config.execution.eager_worker_cap),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_props() {
        let env = EagerStage.env(&Config::default(), &System::synthetic(1, 0));
        assert_eq!(EagerStage.kind(), FeatureKind::Eager);
        assert_eq!(EagerStage.name(), "Eager");
        assert_eq!(env.len(), 4);
        assert_eq!(env.get("LEGATE_TEST").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_one_core_per_worker() {
        let system = System::synthetic(6, 0);
        let spec = EagerStage.compute_spec(&Config::default(), &system).unwrap();
        assert_eq!(spec.workers, 6);
        assert_eq!(spec.shards[4], Shard::new(vec![vec![4]]));
    }

    #[test]
    fn test_ignores_ranks_per_node() {
        let system = System::synthetic(4, 0);
        let mut config = Config::default();
        config.multi_node.ranks_per_node = 2;

        let spec = EagerStage.compute_spec(&config, &system).unwrap();
        assert_eq!(spec.workers, 4);
        assert!(spec.shards.iter().all(|s| s.ranks() == 1));
    }

    #[test]
    fn test_worker_cap() {
        let system = System::synthetic(128, 0);
        let spec = EagerStage.compute_spec(&Config::default(), &system).unwrap();
        assert_eq!(spec.workers, 60);

        let mut config = Config::default();
        config.execution.eager_worker_cap = 8;
        assert_eq!(EagerStage.compute_spec(&config, &system).unwrap().workers, 8);
    }

    #[test]
    fn test_shard_args() {
        let shard = Shard::new(vec![vec![3]]);
        assert_eq!(
            EagerStage.shard_args(&shard, &Config::default()),
            vec!["--cpus", "1", "--cpu-bind", "3"]
        );
    }
}
