//! Shard pool shared by the workers of one stage.
//!
//! The [`ShardPool`] holds a fixed set of shards. Workers borrow one with
//! [`acquire`](ShardPool::acquire), which waits until a shard is free, and
//! give it back by dropping the returned [`ShardLease`]. Because release is
//! tied to the lease's lifetime, a shard returns to the pool whether the job
//! passed, failed, timed out, panicked, or was cancelled.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::Shard;

/// A fixed multiset of shards with blocking acquire and scoped release.
///
/// # Example
///
/// ```
/// use shardrun::stage::{Shard, ShardPool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = ShardPool::new(vec![Shard::new(vec![vec![0]]), Shard::new(vec![vec![1]])]);
///
/// {
///     let lease = pool.acquire().await;
///     assert_eq!(lease.to_string(), "0");
///     assert_eq!(pool.available(), 1);
/// }
///
/// // Dropping the lease returned the shard
/// assert_eq!(pool.available(), 2);
/// # }
/// ```
#[derive(Debug)]
pub struct ShardPool {
    available: Mutex<VecDeque<Shard>>,
    returned: Notify,
    capacity: usize,
}

impl ShardPool {
    /// Creates a pool pre-loaded with every shard.
    pub fn new(shards: Vec<Shard>) -> Self {
        let capacity = shards.len();
        Self {
            available: Mutex::new(shards.into()),
            returned: Notify::new(),
            capacity,
        }
    }

    /// Total number of shards in circulation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of shards not currently on loan.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Clones the shards not currently on loan, in pool order.
    pub fn snapshot(&self) -> Vec<Shard> {
        self.lock().iter().cloned().collect()
    }

    /// Waits for a free shard and loans it out.
    ///
    /// Never resolves for a pool with zero capacity.
    pub async fn acquire(&self) -> ShardLease<'_> {
        loop {
            let returned = self.returned.notified();
            let next = self.lock().pop_front();
            if let Some(shard) = next {
                return ShardLease { pool: self, shard };
            }
            returned.await;
        }
    }

    fn release(&self, shard: Shard) {
        self.lock().push_back(shard);
        self.returned.notify_one();
    }

    // The queue is consistent after every single push or pop, so a panic
    // elsewhere cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Shard>> {
        self.available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A shard on loan from a [`ShardPool`]; returned when dropped.
#[derive(Debug)]
pub struct ShardLease<'a> {
    pool: &'a ShardPool,
    shard: Shard,
}

impl ShardLease<'_> {
    /// The borrowed shard.
    pub fn shard(&self) -> &Shard {
        &self.shard
    }
}

impl Deref for ShardLease<'_> {
    type Target = Shard;

    fn deref(&self) -> &Shard {
        &self.shard
    }
}

impl Drop for ShardLease<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.shard));
    }
}
