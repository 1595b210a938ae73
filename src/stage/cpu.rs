//! The `cpus` stage.

use async_trait::async_trait;

use super::{
    EnvMap, PartitionRequest, Shard, StageError, StagePolicy, StageSpec, checked_cost, cpu_bind_args,
    partition, pin_env, ranks_args, strict_reserve,
};
use crate::config::{Config, FeatureKind};
use crate::system::System;

/// Runs tests on plain CPU processors.
///
/// Each rank takes `cpus + utility` core groups, plus one more under strict
/// pinning.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStage;

#[async_trait]
impl StagePolicy for CpuStage {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Cpus
    }

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn env(&self, config: &Config, _system: &System) -> EnvMap {
        pin_env(config)
    }

    fn shard_args(&self, shard: &Shard, config: &Config) -> Vec<String> {
        let mut args = vec!["--cpus".to_string(), config.core.cpus.to_string()];
        args.extend(cpu_bind_args(shard, config));
        args.extend(ranks_args(config));
        args
    }

    fn compute_spec(&self, config: &Config, system: &System) -> Result<StageSpec, StageError> {
        let core = &config.core;
        let cost = checked_cost(
            self.kind(),
            core.cpus
                .checked_add(core.utility)
                .and_then(|c| c.checked_add(strict_reserve(config))),
        )?;

        let groups = system.cpu_groups();
        partition(&PartitionRequest {
            groups: &groups,
            cost,
            ranks_per_node: config.multi_node.ranks_per_node,
            requested: config.execution.workers,
            cap: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuPin;

    fn config(cpus: usize, utility: usize) -> Config {
        let mut config = Config::default();
        config.core.cpus = cpus;
        config.core.utility = utility;
        config
    }

    #[test]
    fn test_props() {
        let stage = CpuStage;
        assert_eq!(stage.kind(), FeatureKind::Cpus);
        assert_eq!(stage.name(), "CPU");
        assert!(stage.args().is_empty());
    }

    #[test]
    fn test_env_follows_pinning() {
        let system = System::synthetic(4, 0);
        let mut config = config(1, 0);
        assert_eq!(
            CpuStage.env(&config, &system).get("REALM_SYNTHETIC_CORE_MAP"),
            Some(&String::new())
        );

        config.execution.cpu_pin = CpuPin::Strict;
        assert!(CpuStage.env(&config, &system).is_empty());
    }

    #[test]
    fn test_spec_with_utility() {
        let system = System::synthetic(6, 0);
        let spec = CpuStage.compute_spec(&config(1, 1), &system).unwrap();
        assert_eq!(spec.workers, 3);
        assert_eq!(
            spec.shards,
            vec![
                Shard::new(vec![vec![0, 1]]),
                Shard::new(vec![vec![2, 3]]),
                Shard::new(vec![vec![4, 5]]),
            ]
        );
    }

    #[test]
    fn test_spec_strict_reserves_a_core() {
        let system = System::synthetic(6, 0);
        let mut config = config(1, 1);
        config.execution.cpu_pin = CpuPin::Strict;

        let spec = CpuStage.compute_spec(&config, &system).unwrap();
        assert_eq!(spec.workers, 2);
        assert_eq!(spec.shards[1], Shard::new(vec![vec![3, 4, 5]]));
    }

    #[test]
    fn test_spec_multi_rank() {
        let system = System::synthetic(12, 0);
        let mut config = config(1, 1);
        config.multi_node.ranks_per_node = 2;

        let spec = CpuStage.compute_spec(&config, &system).unwrap();
        assert_eq!(spec.workers, 3);
        assert_eq!(spec.shards[0], Shard::new(vec![vec![0, 1], vec![2, 3]]));
        assert_eq!(spec.shards[2], Shard::new(vec![vec![8, 9], vec![10, 11]]));
    }

    #[test]
    fn test_requested_workers() {
        let system = System::synthetic(6, 0);
        let mut config = config(1, 1);

        config.execution.workers = Some(2);
        assert_eq!(CpuStage.compute_spec(&config, &system).unwrap().workers, 2);

        config.execution.workers = Some(4);
        assert!(matches!(
            CpuStage.compute_spec(&config, &system),
            Err(StageError::ResourceExhausted { requested: 4, max: 3 })
        ));
    }

    #[test]
    fn test_overflowing_sizes_are_invalid() {
        let system = System::synthetic(6, 0);
        assert!(matches!(
            CpuStage.compute_spec(&config(usize::MAX, 1), &system),
            Err(StageError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_shard_args() {
        let shard = Shard::new(vec![vec![0, 1]]);
        let mut config = config(2, 1);
        assert_eq!(
            CpuStage.shard_args(&shard, &config),
            vec!["--cpus", "2", "--cpu-bind", "0,1"]
        );

        config.execution.cpu_pin = CpuPin::None;
        assert_eq!(CpuStage.shard_args(&shard, &config), vec!["--cpus", "2"]);

        config.execution.cpu_pin = CpuPin::Strict;
        config.multi_node.ranks_per_node = 2;
        let shard = Shard::new(vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(
            CpuStage.shard_args(&shard, &config),
            vec!["--cpus", "2", "--cpu-bind", "0,1/2,3", "--ranks-per-node", "2"]
        );
    }
}
