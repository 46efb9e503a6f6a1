//! Configuration management for blockproc
//!
//! Settings are layered with figment: embedded defaults, then user and
//! project files, then `BLOCKPROC_*` environment variables. This module holds
//! the typed view of those settings and their conversion into
//! [`ProcessOptions`].

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::parallel::ExecutionStrategy;
use crate::process::ProcessOptions;

pub mod core;
pub mod smart_load;

pub use self::core::BlockprocConfig;

/// Executor selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Pooled,
    WorkStealing,
}

/// Full typed configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub blocks: BlockSettings,
}

/// How blocks are executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Pool size for parallel strategies (0 = derive from CPU count)
    pub workers: usize,

    /// Upper bound on derived workers (0 = no limit)
    pub max_threads: usize,

    /// Percentage of CPU cores to use when deriving workers (1-100)
    pub thread_percentage: u8,

    /// Bound on each wait for a completion in milliseconds (0 = none)
    pub timeout_ms: u64,

    /// Grids with fewer blocks run sequentially (0 = never fall back)
    #[serde(default)]
    pub min_blocks_for_parallel: usize,

    /// Block copies queued ahead of parallel workers (0 = unbounded)
    #[serde(default)]
    pub queue_capacity: usize,
}

/// How the array is partitioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BlockSettings {
    #[serde(default)]
    pub overlap: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Sequential,
            workers: crate::parallel::DEFAULT_POOL_SIZE,
            max_threads: 0,
            thread_percentage: 75,
            timeout_ms: 0,
            min_blocks_for_parallel: 0,
            queue_capacity: 0,
        }
    }
}

impl ExecutorSettings {
    /// Worker count after resolving `workers = 0`
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            ExecutionStrategy::calculate_optimal_workers(self.max_threads, self.thread_percentage)
        }
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        match self.strategy {
            StrategyKind::Sequential => ExecutionStrategy::Sequential,
            StrategyKind::Pooled => ExecutionStrategy::Pooled {
                workers: self.effective_workers(),
            },
            StrategyKind::WorkStealing => ExecutionStrategy::WorkStealing {
                threads: self.effective_workers(),
            },
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Settings {
    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            strategy: self.executor.strategy(),
            timeout: self.executor.timeout(),
            min_blocks_for_parallel: self.executor.min_blocks_for_parallel,
            queue_capacity: (self.executor.queue_capacity > 0)
                .then_some(self.executor.queue_capacity),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.executor.thread_percentage == 0 || self.executor.thread_percentage > 100 {
            bail!(
                "executor.thread_percentage must be between 1 and 100, got {}",
                self.executor.thread_percentage
            );
        }
        Ok(())
    }
}
