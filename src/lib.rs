//! # blockproc - block-wise parallel execution over n-dimensional arrays
//!
//! blockproc splits an [`ndarray`] array into a regular grid of (possibly
//! overlapping) blocks, applies a caller-supplied function to every block and
//! reassembles the per-block results into an array addressed by grid position.
//!
//! - **Partitioning**: [`windows`] builds an addressable [`BlockGrid`] of read-only views
//! - **Execution**: sequential, fixed-pool and work-stealing strategies behind one
//!   [`Executor`](parallel::Executor) contract
//! - **Collection**: [`ResultCollector`] orders an out-of-order completion stream by grid index
//! - **Configuration**: TOML, JSON and YAML files plus `BLOCKPROC_*` environment variables
//!
//! ## Quick Start
//!
//! ```rust
//! use blockproc::{ExecutionStrategy, ProcessOptions, process_blocks};
//! use ndarray::{Array2, ArrayViewD};
//!
//! let image = Array2::<f64>::ones((32, 32));
//! let means = process_blocks(
//!     &image,
//!     &[8, 8],
//!     |block: ArrayViewD<'_, f64>, _: &()| block.mean().unwrap_or(0.0),
//!     (),
//!     0,
//!     &ProcessOptions::new(ExecutionStrategy::pooled()),
//! )?;
//! assert_eq!(means.shape(), &[4, 4]);
//! # Ok::<(), blockproc::BlockError>(())
//! ```
//!
//! ### Command line
//!
//! ```bash
//! # Sum 8x8 blocks of a JSON-encoded array on a worker pool
//! blockproc run --input image.json --block 8,8 --strategy pooled
//!
//! # Show the merged configuration
//! blockproc config show
//! ```

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod grid;
pub mod parallel;
pub mod process;

pub use collector::{ResultCollector, stack_results};
pub use error::{BlockError, Result};
pub use grid::{BlockGrid, GridIndex, ViewGrid, windows};
pub use parallel::ExecutionStrategy;
pub use process::{ProcessOptions, process_blocks, process_blocks_with, try_process_blocks};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
