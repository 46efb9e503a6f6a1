//! Entry point wiring partitioner, executor and collector together

use ndarray::{ArrayBase, ArrayD, ArrayViewD, Data, Dimension};
use std::convert::Infallible;
use std::fmt::Display;
use std::time::Duration;

use crate::collector::ResultCollector;
use crate::error::{BlockError, Result};
use crate::grid::{BlockGrid, block_step, windows};
use crate::parallel::{
    ExecutionStrategy, Executor, PooledExecutor, SequentialExecutor, WorkStealingExecutor,
};

/// Execution settings for one `process_blocks` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessOptions {
    pub strategy: ExecutionStrategy,
    /// Bound on each wait for the next completion; `None` waits forever
    pub timeout: Option<Duration>,
    /// Grids with fewer blocks run sequentially even when `strategy` is
    /// parallel. 0 keeps `strategy` as given.
    pub min_blocks_for_parallel: usize,
    /// Most block copies queued ahead of the workers; `None` queues them all
    pub queue_capacity: Option<usize>,
}

impl ProcessOptions {
    pub fn new(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_min_blocks_for_parallel(mut self, min_blocks: usize) -> Self {
        self.min_blocks_for_parallel = min_blocks;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Strategy actually used for a grid of `block_count` blocks
    pub fn strategy_for(&self, block_count: usize) -> ExecutionStrategy {
        self.strategy.auto(block_count, self.min_blocks_for_parallel)
    }
}

/// Apply `func` to distinct or overlapping blocks of `array`.
///
/// Blocks of `block_shape` are placed `max(block_shape) - overlap` elements
/// apart along every axis. The returned array has one cell per block, holding
/// `func(block, &func_args)`, at the block's grid position.
///
/// `func`, `func_args` and the elements must be `Send + Sync + 'static`
/// because `options` may pick a strategy whose workers outlive this call
/// after a timeout. To run a borrowing closure, build a
/// [`SequentialExecutor`] and hand it to [`process_blocks_with`].
///
/// ```rust
/// use blockproc::{ProcessOptions, process_blocks};
/// use ndarray::{Array, ArrayViewD};
///
/// let image = Array::from_shape_fn((16, 16), |(r, c)| (r * 16 + c) as f64);
/// let sums = process_blocks(
///     &image,
///     &[8, 8],
///     |block: ArrayViewD<'_, f64>, _: &()| block.sum(),
///     (),
///     0,
///     &ProcessOptions::default(),
/// )?;
/// assert_eq!(sums.shape(), &[2, 2]);
/// # Ok::<(), blockproc::BlockError>(())
/// ```
pub fn process_blocks<A, S, D, P, R, F>(
    array: &ArrayBase<S, D>,
    block_shape: &[usize],
    func: F,
    func_args: P,
    overlap: usize,
    options: &ProcessOptions,
) -> Result<ArrayD<R>>
where
    S: Data<Elem = A>,
    D: Dimension,
    A: Clone + Send + Sync + 'static,
    P: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(ArrayViewD<'_, A>, &P) -> R + Send + Sync + 'static,
{
    try_process_blocks(
        array,
        block_shape,
        move |block: ArrayViewD<'_, A>, args: &P| Ok::<R, Infallible>(func(block, args)),
        func_args,
        overlap,
        options,
    )
}

/// [`process_blocks`] for functions that can fail.
///
/// The first `Err` seen by the collector is returned as
/// [`BlockError::WorkerFailure`] tagged with the block's grid index.
pub fn try_process_blocks<A, S, D, P, R, E, F>(
    array: &ArrayBase<S, D>,
    block_shape: &[usize],
    func: F,
    func_args: P,
    overlap: usize,
    options: &ProcessOptions,
) -> Result<ArrayD<R>>
where
    S: Data<Elem = A>,
    D: Dimension,
    A: Clone + Send + Sync + 'static,
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: Display,
    F: Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, E> + Send + Sync + 'static,
{
    let grid = partition(array, block_shape, overlap)?;
    let strategy = options.strategy_for(grid.len());
    if strategy != options.strategy {
        tracing::debug!(
            "{} blocks is below the parallel threshold of {}, running sequentially",
            grid.len(),
            options.min_blocks_for_parallel
        );
    }
    tracing::debug!(
        "Processing {} blocks of {:?} (step {}) with {:?}",
        grid.len(),
        block_shape,
        grid.step(),
        strategy
    );

    match strategy {
        ExecutionStrategy::Sequential => run(
            SequentialExecutor::try_new(func, func_args),
            &grid,
            options.timeout,
        ),
        ExecutionStrategy::Pooled { workers } => {
            let mut executor = PooledExecutor::try_new(func, func_args, workers);
            if let Some(capacity) = options.queue_capacity {
                executor = executor.with_queue_capacity(capacity);
            }
            run(executor, &grid, options.timeout)
        }
        ExecutionStrategy::WorkStealing { threads } => {
            let mut executor = WorkStealingExecutor::try_new(func, func_args, threads);
            if let Some(capacity) = options.queue_capacity {
                executor = executor.with_queue_capacity(capacity);
            }
            run(executor, &grid, options.timeout)
        }
    }
}

/// Partition `array` and run every block on a caller-built executor.
///
/// The executor's own bounds apply, so a [`SequentialExecutor`] accepts
/// closures that borrow from the caller's stack and elements that are not
/// `Send`.
///
/// ```rust
/// use blockproc::parallel::SequentialExecutor;
/// use blockproc::process_blocks_with;
/// use ndarray::{Array2, ArrayViewD};
///
/// let image = Array2::<f64>::ones((4, 4));
/// let weights = vec![0.5, 2.0];
/// let executor =
///     SequentialExecutor::new(|block: ArrayViewD<'_, f64>, _: &()| block.sum() * weights[1], ());
/// let sums = process_blocks_with(&image, &[2, 2], executor, 0, None)?;
/// assert_eq!(sums[[1, 1]], 8.0);
/// # Ok::<(), blockproc::BlockError>(())
/// ```
pub fn process_blocks_with<A, S, D, R, X>(
    array: &ArrayBase<S, D>,
    block_shape: &[usize],
    executor: X,
    overlap: usize,
    timeout: Option<Duration>,
) -> Result<ArrayD<R>>
where
    S: Data<Elem = A>,
    D: Dimension,
    X: Executor<A, R>,
{
    let grid = partition(array, block_shape, overlap)?;
    tracing::debug!(
        "Processing {} blocks of {:?} (step {}) on a caller executor",
        grid.len(),
        block_shape,
        grid.step()
    );
    run(executor, &grid, timeout)
}

fn partition<'a, A, S, D>(
    array: &'a ArrayBase<S, D>,
    block_shape: &[usize],
    overlap: usize,
) -> Result<BlockGrid<'a, A>>
where
    S: Data<Elem = A>,
    D: Dimension,
{
    if block_shape.len() != array.ndim() {
        return Err(BlockError::invalid(format!(
            "block shape {:?} must have one length per array dimension ({})",
            block_shape,
            array.ndim()
        )));
    }

    let step = block_step(block_shape, overlap)?;
    windows(array.view().into_dyn(), block_shape, step)
}

/// Submit, collect, then drop the executor (tearing down any pool)
fn run<A, R, X>(mut executor: X, grid: &BlockGrid<'_, A>, timeout: Option<Duration>) -> Result<ArrayD<R>>
where
    X: Executor<A, R>,
{
    executor.submit(grid, Some(grid.grid_ndim()))?;
    let collector = ResultCollector::new(executor.results()?);
    let output = collector.collect(timeout);
    if let Err(err) = &output {
        tracing::debug!("Block processing failed: {}", err);
    }
    output
}
