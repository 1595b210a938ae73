//! The `openmp` stage.

use async_trait::async_trait;

use super::{
    EnvMap, PartitionRequest, Shard, StageError, StagePolicy, StageSpec, checked_cost, cpu_bind_args,
    partition, pin_env, ranks_args, strict_reserve,
};
use crate::config::{Config, FeatureKind};
use crate::system::System;

/// Runs tests on OpenMP processor groups.
///
/// Each rank takes `omps * ompthreads + utility` core groups, plus one more
/// under strict pinning.
#[derive(Debug, Clone, Copy, Default)]
pub struct OmpStage;

#[async_trait]
impl StagePolicy for OmpStage {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Openmp
    }

    fn name(&self) -> &'static str {
        "OMP"
    }

    fn env(&self, config: &Config, _system: &System) -> EnvMap {
        pin_env(config)
    }

    fn shard_args(&self, shard: &Shard, config: &Config) -> Vec<String> {
        let core = &config.core;
        let mut args = vec![
            "--omps".to_string(),
            core.omps.to_string(),
            "--ompthreads".to_string(),
            core.ompthreads.to_string(),
            "--numamem".to_string(),
            core.numamem.to_string(),
        ];
        args.extend(cpu_bind_args(shard, config));
        args.extend(ranks_args(config));
        args
    }

    fn compute_spec(&self, config: &Config, system: &System) -> Result<StageSpec, StageError> {
        let core = &config.core;
        let cost = checked_cost(
            self.kind(),
            core.omps
                .checked_mul(core.ompthreads)
                .and_then(|c| c.checked_add(core.utility))
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
