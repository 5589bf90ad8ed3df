//! Feature partitioning and the fork/join worker pool

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Result, ShrinkError};

/// Contiguous, nearly equal row blocks: `workers * chunk_multiplier` buckets,
/// the first `n mod K` one row larger, empty buckets dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    n_rows: usize,
    partitions: Vec<Range<usize>>,
}

impl PartitionPlan {
    pub fn new(n_rows: usize, workers: usize, chunk_multiplier: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ShrinkError::InvalidInput {
                reason: "worker count must be at least 1".to_string(),
            });
        }
        if chunk_multiplier == 0 {
            return Err(ShrinkError::InvalidInput {
                reason: "chunk multiplier must be at least 1".to_string(),
            });
        }

        let k = workers.saturating_mul(chunk_multiplier);
        let base = n_rows / k;
        let extra = n_rows % k;
        let mut partitions = Vec::with_capacity(k.min(n_rows));
        let mut start = 0;
        for b in 0..k {
            let size = base + usize::from(b < extra);
            if size == 0 {
                break;
            }
            partitions.push(start..start + size);
            start += size;
        }

        log::debug!(
            "Partitioned {} rows into {} chunks ({} requested)",
            n_rows,
            partitions.len(),
            k
        );
        Ok(Self { n_rows, partitions })
    }

    pub fn partitions(&self) -> &[Range<usize>] {
        &self.partitions
    }

    /// Partition index of every row
    pub fn assignment(&self) -> Vec<usize> {
        let mut out = vec![0; self.n_rows];
        for (p, range) in self.partitions.iter().enumerate() {
            for row in range.clone() {
                out[row] = p;
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }
}

/// A dedicated rayon pool; cloning shares the same threads
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<ThreadPool>,
    workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.workers).finish()
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ShrinkError::InvalidInput {
                reason: "worker count must be at least 1".to_string(),
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| ShrinkError::InvalidInput {
                reason: format!("failed to create thread pool: {}", e),
            })?;
        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` on every partition inside the pool and wait for all of them.
    /// Results come back in partition order; the first failure aborts the
    /// call as `PartitionFailed`.
    pub fn run_partitions<T, F>(&self, plan: &PartitionPlan, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(Range<usize>) -> Result<T> + Sync + Send,
    {
        self.pool.install(|| {
            plan.partitions()
                .par_iter()
                .enumerate()
                .map(|(p, range)| {
                    f(range.clone()).map_err(|e| ShrinkError::PartitionFailed {
                        partition: p,
                        source: Box::new(e),
                    })
                })
                .collect::<Result<Vec<T>>>()
        })
    }
}

/// How a backend runs over the feature set
#[derive(Debug, Clone)]
pub enum Execution {
    Serial,
    Parallel { pool: WorkerPool, chunk_multiplier: usize },
}

impl Execution {
    /// Partition plan for `n_rows`, None when serial
    pub fn plan(&self, n_rows: usize) -> Result<Option<(&WorkerPool, PartitionPlan)>> {
        match self {
            Execution::Serial => Ok(None),
            Execution::Parallel { pool, chunk_multiplier } => {
                Ok(Some((pool, PartitionPlan::new(n_rows, pool.workers(), *chunk_multiplier)?)))
            }
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Execution::Parallel { .. })
    }
}
