//! Shards, stage specs, and the partitioning arithmetic that produces them.
//!
//! # Partitioning
//!
//! Given an ordered inventory of resource groups (CPU core groups or GPU
//! devices), [`partition`] carves out one contiguous block of `cost` groups
//! per rank and bundles `ranks_per_node` consecutive blocks into a [`Shard`]:
//!
//! ```text
//! groups:   [0] [1] [2] [3] [4] [5]        cost = 2, ranks_per_node = 2
//!            └─┬─┘   └─┬─┘   └─┬─┘
//!           rank 0  rank 1   idle
//!            └───┬────┘
//!          Shard [0,1]/[2,3]
//! ```
//!
//! The mapping is deterministic: the same inventory always yields the same
//! shards in the same order. Groups beyond the last full shard stay idle.

use std::fmt;

use serde::Serialize;

use super::StageError;

/// The resource ids assigned to one job, one group per rank.
///
/// # Example
///
/// ```
/// use shardrun::stage::Shard;
///
/// let shard = Shard::new(vec![vec![0, 1], vec![2, 3]]);
/// assert_eq!(shard.ranks(), 2);
/// assert_eq!(shard.to_string(), "0,1/2,3");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Shard(Vec<Vec<u32>>);

impl Shard {
    /// Creates a shard from per-rank id groups.
    pub fn new(ranks: Vec<Vec<u32>>) -> Self {
        Self(ranks)
    }

    /// Per-rank id groups.
    pub fn rank_groups(&self) -> &[Vec<u32>] {
        &self.0
    }

    /// Number of ranks.
    pub fn ranks(&self) -> usize {
        self.0.len()
    }

    /// Every id in the shard, in rank order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().flatten().copied()
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranks: Vec<String> = self
            .0
            .iter()
            .map(|ids| {
                ids.iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        f.write_str(&ranks.join("/"))
    }
}

/// Number of workers and the shards they cycle through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSpec {
    /// Concurrent job slots.
    pub workers: usize,
    /// Shards loaded into the stage's pool.
    pub shards: Vec<Shard>,
}

/// Input to [`partition`].
#[derive(Debug, Clone)]
pub struct PartitionRequest<'a> {
    /// Inventory resource groups, in order.
    pub groups: &'a [Vec<u32>],
    /// Resource groups consumed by each rank.
    pub cost: usize,
    /// Ranks per job.
    pub ranks_per_node: usize,
    /// Explicit worker count, if the user asked for one.
    pub requested: Option<usize>,
    /// Upper bound on workers regardless of inventory size.
    pub cap: Option<usize>,
}

/// Validates a requested worker count against what the stage supports.
///
/// Returns the requested count, or `max` when nothing was requested.
pub fn adjust_workers(max: usize, requested: Option<usize>) -> Result<usize, StageError> {
    match requested {
        None => Ok(max),
        Some(0) => Err(StageError::InvalidConfiguration(
            "requested worker count must be at least 1".to_string(),
        )),
        Some(n) if n > max => Err(StageError::ResourceExhausted { requested: n, max }),
        Some(n) => Ok(n),
    }
}

/// Computes the stage spec for an inventory and per-rank resource cost.
///
/// # Errors
///
/// - [`StageError::InvalidConfiguration`] if `cost`, `ranks_per_node`, or
///   the requested worker count is zero, or if `cost * ranks_per_node`
///   overflows
/// - [`StageError::ResourceExhausted`] if more workers are requested than
///   the inventory supports
///
/// # Example
///
/// ```
/// use shardrun::stage::{PartitionRequest, Shard, partition};
///
/// let groups: Vec<Vec<u32>> = (0..6).map(|i| vec![i]).collect();
/// let spec = partition(&PartitionRequest {
///     groups: &groups,
///     cost: 2,
///     ranks_per_node: 1,
///     requested: None,
///     cap: None,
/// })?;
///
/// assert_eq!(spec.workers, 3);
/// assert_eq!(spec.shards[2], Shard::new(vec![vec![4, 5]]));
/// # Ok::<(), shardrun::stage::StageError>(())
/// ```
pub fn partition(request: &PartitionRequest<'_>) -> Result<StageSpec, StageError> {
    if request.cost == 0 {
        return Err(StageError::InvalidConfiguration(
            "resource cost per rank must be at least 1".to_string(),
        ));
    }
    if request.ranks_per_node == 0 {
        return Err(StageError::InvalidConfiguration(
            "ranks per node must be at least 1".to_string(),
        ));
    }

    let per_worker = request
        .cost
        .checked_mul(request.ranks_per_node)
        .ok_or_else(|| {
            StageError::InvalidConfiguration(format!(
                "{} resource groups per rank times {} ranks per node overflows",
                request.cost, request.ranks_per_node
            ))
        })?;
    let mut max = request.groups.len() / per_worker;
    if let Some(cap) = request.cap {
        max = max.min(cap);
    }

    let workers = adjust_workers(max, request.requested)?;

    let shards = request
        .groups
        .chunks_exact(per_worker)
        .take(workers)
        .map(|block| {
            Shard::new(
                block
                    .chunks_exact(request.cost)
                    .map(|rank| {
                        let mut ids: Vec<u32> = rank.iter().flatten().copied().collect();
                        ids.sort_unstable();
                        ids
                    })
                    .collect(),
            )
        })
        .collect();

    Ok(StageSpec { workers, shards })
}
