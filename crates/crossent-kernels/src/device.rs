//! Execution device: a worker pool that runs one kernel at a time.
//!
//! # Kernel strategy
//!
//! Every kernel is data-parallel over a number of *logical workers* (one per
//! row, example, element or spatial position). Logical workers are grouped
//! into worker groups of `worker_group_size`, the block size of the launch.
//! Each group is one task on the [`rayon::ThreadPool`]; groups are
//! work-stolen across `num_workers` threads. Work inside a kernel has no
//! ordering; kernels themselves are ordered by the [`crate::Stream`].

use crossent_common::{DeviceConfig, KernelError, Result};
use rayon::prelude::*;

/// Grid geometry for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of logical workers.
    pub num_workers: usize,
    /// Logical workers per group.
    pub threads_per_block: u32,
}

impl LaunchConfig {
    pub fn for_workers(num_workers: usize, threads_per_block: u32) -> Self {
        Self { num_workers, threads_per_block: threads_per_block.max(1) }
    }

    /// Number of worker groups, `ceil(num_workers / threads_per_block)`.
    pub fn num_blocks(&self) -> usize {
        self.num_workers.div_ceil(self.threads_per_block as usize)
    }

    /// Grid dimensions `(num_blocks, 1, 1)`.
    pub fn grid_dim(&self) -> (u32, u32, u32) {
        (self.num_blocks() as u32, 1, 1)
    }

    /// Block dimensions `(threads_per_block, 1, 1)`.
    pub fn block_dim(&self) -> (u32, u32, u32) {
        (self.threads_per_block, 1, 1)
    }
}

/// Worker pool standing in for the accelerator.
pub struct Device {
    pool: rayon::ThreadPool,
    config: DeviceConfig,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("config", &self.config).finish()
    }
}

impl Device {
    /// Build a device from a validated configuration.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(move |idx| format!("{prefix}-worker-{idx}"))
            .build()
            .map_err(|e| KernelError::WorkerPool { reason: e.to_string() })?;
        log::debug!(
            "device ready: {} workers, worker groups of {}",
            config.num_workers,
            config.worker_group_size
        );
        Ok(Self { pool, config })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DeviceConfig::default())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn worker_group_size(&self) -> usize {
        self.config.worker_group_size as usize
    }

    /// Launch geometry for `num_workers` logical workers.
    pub fn launch_config(&self, num_workers: usize) -> LaunchConfig {
        LaunchConfig::for_workers(num_workers, self.config.worker_group_size)
    }

    // ── Parallel primitives ──

    /// One logical worker per element of `out`.
    pub fn for_each<T, F>(&self, out: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        let group = self.worker_group_size();
        self.pool.install(|| {
            out.par_chunks_mut(group).enumerate().for_each(|(block, chunk)| {
                let base = block * group;
                for (j, v) in chunk.iter_mut().enumerate() {
                    f(base + j, v);
                }
            });
        });
    }

    /// One logical worker per index, writing one element of each output.
    ///
    /// # Panics
    /// Panics if `a` and `b` differ in length.
    pub fn for_each_pair<T, U, F>(&self, a: &mut [T], b: &mut [U], f: F)
    where
        T: Send,
        U: Send,
        F: Fn(usize, &mut T, &mut U) + Send + Sync,
    {
        assert_eq!(a.len(), b.len(), "paired outputs must have equal length");
        let group = self.worker_group_size();
        self.pool.install(|| {
            a.par_chunks_mut(group).zip(b.par_chunks_mut(group)).enumerate().for_each(
                |(block, (ca, cb))| {
                    let base = block * group;
                    for (j, (va, vb)) in ca.iter_mut().zip(cb.iter_mut()).enumerate() {
                        f(base + j, va, vb);
                    }
                },
            );
        });
    }

    /// One logical worker per row of length `row_len`.
    pub fn for_each_row<T, F>(&self, out: &mut [T], row_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if row_len == 0 {
            return;
        }
        let group = self.worker_group_size();
        self.pool.install(|| {
            out.par_chunks_mut(row_len * group).enumerate().for_each(|(block, rows)| {
                let base = block * group;
                for (j, row) in rows.chunks_mut(row_len).enumerate() {
                    f(base + j, row);
                }
            });
        });
    }

    /// One logical worker per index in `0..n`. Workers write only through
    /// a [`crate::buffer::DisjointSlice`].
    pub fn for_each_index<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        let cfg = self.launch_config(n);
        log::trace!(
            "for_each_index: {n} workers, grid {:?} block {:?}",
            cfg.grid_dim(),
            cfg.block_dim()
        );
        let group = cfg.threads_per_block as usize;
        self.pool.install(|| {
            (0..cfg.num_blocks()).into_par_iter().for_each(|block| {
                let start = block * group;
                let end = (start + group).min(n);
                for i in start..end {
                    f(i);
                }
            });
        });
    }

    /// Sum reduction. Each worker group produces a partial sum; partials are
    /// combined in group order so the result does not depend on scheduling.
    pub fn sum(&self, data: &[f32]) -> f32 {
        let group = self.worker_group_size();
        let partials: Vec<f32> = self
            .pool
            .install(|| data.par_chunks(group).map(|chunk| chunk.iter().sum::<f32>()).collect());
        partials.iter().sum()
    }
}
