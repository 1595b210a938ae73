//! The `cuda` stage.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    EnvMap, PartitionRequest, Shard, StageError, StagePolicy, StageSpec, partition, ranks_args,
};
use crate::config::{Config, FeatureKind};
use crate::system::System;

/// Runs tests on GPUs, `gpus` devices per rank.
///
/// Launches are spaced by `execution.gpu_delay_ms` so that concurrent jobs
/// do not initialize their devices at the same moment.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuStage;

#[async_trait]
impl StagePolicy for GpuStage {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Cuda
    }

    fn name(&self) -> &'static str {
        "GPU"
    }

    fn env(&self, _config: &Config, _system: &System) -> EnvMap {
        EnvMap::new()
    }

    fn shard_args(&self, shard: &Shard, config: &Config) -> Vec<String> {
        let core = &config.core;
        let per_rank = shard.rank_groups().first().map_or(0, Vec::len);
        let mut args = vec![
            "--fbmem".to_string(),
            core.fbmem.to_string(),
            "--gpus".to_string(),
            per_rank.to_string(),
            "--gpu-bind".to_string(),
            shard.to_string(),
            "--sysmem".to_string(),
            core.sysmem.to_string(),
            "--cpus".to_string(),
            "1".to_string(),
            "--utility".to_string(),
            core.utility.to_string(),
        ];
        args.extend(ranks_args(config));
        args
    }

    async fn delay(&self, _shard: &Shard, config: &Config, _system: &System) {
        let delay = config.execution.gpu_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn compute_spec(&self, config: &Config, system: &System) -> Result<StageSpec, StageError> {
        let groups = system.gpu_groups();
        let spec = partition(&PartitionRequest {
            groups: &groups,
            cost: config.core.gpus,
            ranks_per_node: config.multi_node.ranks_per_node,
            requested: config.execution.workers,
            cap: None,
        })?;

        // Every job asks for `fbmem` on each of its devices.
        let fbmem = config.core.fbmem;
        for shard in &spec.shards {
            for id in shard.ids() {
                if let Some(gpu) = system.gpus.iter().find(|g| g.id == id)
                    && fbmem > gpu.total_mb
                {
                    return Err(StageError::InvalidConfiguration(format!(
                        "--fbmem {} MiB exceeds the {} MiB of GPU {}",
                        fbmem, gpu.total_mb, gpu.id
                    )));
                }
            }
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_props() {
        let config = Config::default();
        let system = System::synthetic(4, 2);
        assert_eq!(GpuStage.kind(), FeatureKind::Cuda);
        assert_eq!(GpuStage.name(), "GPU");
        assert!(GpuStage.env(&config, &system).is_empty());
    }

    #[test]
    fn test_spec_one_gpu_per_rank() {
        let system = System::synthetic(4, 4);
        let spec = GpuStage.compute_spec(&Config::default(), &system).unwrap();
        assert_eq!(spec.workers, 4);
        assert_eq!(spec.shards[3], Shard::new(vec![vec![3]]));
    }

    #[test]
    fn test_spec_multi_rank() {
        let system = System::synthetic(4, 4);
        let mut config = Config::default();
        config.multi_node.ranks_per_node = 2;

        let spec = GpuStage.compute_spec(&config, &system).unwrap();
        assert_eq!(spec.workers, 2);
        assert_eq!(
            spec.shards,
            vec![
                Shard::new(vec![vec![0], vec![1]]),
                Shard::new(vec![vec![2], vec![3]]),
            ]
        );
    }

    #[test]
    fn test_no_gpus() {
        let system = System::synthetic(8, 0);
        let spec = GpuStage.compute_spec(&Config::default(), &system).unwrap();
        assert_eq!(spec.workers, 0);
    }

    #[test]
    fn test_fbmem_must_fit_every_selected_gpu() {
        let mut system = System::synthetic(4, 2);
        system.gpus[1].total_mb = 2048;
        let mut config = Config::default();
        config.core.fbmem = 4096;

        let err = GpuStage.compute_spec(&config, &system).unwrap_err();
        assert!(matches!(err, StageError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("GPU 1"));

        config.core.fbmem = 2048;
        let spec = GpuStage.compute_spec(&config, &system).unwrap();
        assert_eq!(spec.workers, 2);
    }

    #[test]
    fn test_fbmem_ignores_unselected_gpus() {
        let mut system = System::synthetic(4, 3);
        system.gpus[2].total_mb = 1024;
        let mut config = Config::default();
        config.core.fbmem = 4096;
        config.core.gpus = 2;

        let spec = GpuStage.compute_spec(&config, &system).unwrap();
        assert_eq!(spec.shards, vec![Shard::new(vec![vec![0, 1]])]);
    }

    #[test]
    fn test_shard_args() {
        let mut config = Config::default();
        config.core.fbmem = 1024;
        config.core.sysmem = 256;
        config.core.utility = 2;
        config.multi_node.ranks_per_node = 2;

        let shard = Shard::new(vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(
            GpuStage.shard_args(&shard, &config),
            vec![
                "--fbmem",
                "1024",
                "--gpus",
                "2",
                "--gpu-bind",
                "0,1/2,3",
                "--sysmem",
                "256",
                "--cpus",
                "1",
                "--utility",
                "2",
                "--ranks-per-node",
                "2",
            ]
        );
    }

    #[tokio::test]
    async fn test_delay_sleeps_configured_time() {
        let mut config = Config::default();
        config.execution.gpu_delay_ms = 50;
        let system = System::synthetic(1, 1);

        let start = Instant::now();
        GpuStage
            .delay(&Shard::new(vec![vec![0]]), &config, &system)
            .await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
