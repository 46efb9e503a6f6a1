//! Block execution strategies
//!
//! This module decides **where** the per-block function runs. Every strategy
//! implements the same [`Executor`] contract, so the orchestration code never
//! needs to know which one it was handed.
//!
//! # Architecture Responsibilities
//!
//! ## What This Module Does:
//! - **Enumeration**: Walks the grid in row-major order and builds one invocation per block
//! - **Execution Strategy**: Runs invocations on the caller thread or on a worker pool
//! - **Failure Capture**: Turns errors and panics from the user function into tagged completions
//! - **Resource Calculation**: Derives a worker count from CPU cores and configured limits
//!
//! ## What This Module Does NOT Do:
//! - **Partitioning**: Blocks come from a [`ViewGrid`](crate::grid::ViewGrid)
//! - **Reassembly**: Ordering results by grid index is the collector's job
//! - **Cancellation**: Once a block starts running it always runs to the end
//!
//! # Data Flow
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   ViewGrid      │    │   Executor       │    │   Collector     │
//! │                 │───▶│                  │───▶│                 │
//! │ • grid shape    │    │ • invocations    │    │ • grid order    │
//! │ • block views   │    │ • worker pool    │    │ • timeouts      │
//! │                 │    │ • completions    │    │ • output array  │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! # Strategies
//!
//! - [`SequentialExecutor`]: caller thread, deterministic order, no `Send` bounds
//! - [`PooledExecutor`]: fixed pool of dedicated threads fed from a shared queue
//! - [`WorkStealingExecutor`]: private rayon pool, one job per block
//!
//! # Example Usage
//!
//! ```rust
//! use blockproc::grid::windows;
//! use blockproc::parallel::{Completion, Executor, PooledExecutor};
//! use ndarray::{Array2, ArrayViewD};
//!
//! let image = Array2::<f64>::ones((4, 4)).into_dyn();
//! let grid = windows(image.view(), &[2, 2], 2)?;
//!
//! let mut executor = PooledExecutor::new(|block: ArrayViewD<'_, f64>, _: &()| block.sum(), (), 2);
//! executor.submit(&grid, None)?;
//!
//! let mut completions = executor.results()?;
//! while let Some(completion) = completions.next_completion(None)? {
//!     if let Completion::Finished { value, .. } = completion {
//!         assert_eq!(value, 4.0);
//!     }
//! }
//! # Ok::<(), blockproc::BlockError>(())
//! ```

pub mod core;
pub mod pooled;
pub mod work_stealing;

// Re-export main types for easier access
pub use self::core::{
    Completion, Completions, DEFAULT_POOL_SIZE, ExecutionStrategy, Executor, ExecutorState,
    Invocation, SequentialExecutor, resolve_grid_dims,
};
pub use pooled::PooledExecutor;
pub use work_stealing::WorkStealingExecutor;
