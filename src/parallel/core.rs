use crossbeam::channel::{Receiver, RecvTimeoutError, unbounded};
use ndarray::{ArrayViewD, Dimension, IxDyn};
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{BlockError, Result};
use crate::grid::{GridIndex, ViewGrid};

/// Worker count used by the pooled strategy when none is configured
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Type-erased user function, borrowed for the executor's lifetime
pub type BlockFn<'f, A, P, R> =
    Box<dyn Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, String> + 'f>;

/// Type-erased user function shared across worker threads
pub type SharedBlockFn<A, P, R> =
    Arc<dyn Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, String> + Send + Sync>;

/// Outcome of running the user function on one block
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<R> {
    Finished { index: GridIndex, value: R },
    Failed { index: GridIndex, message: String },
}

impl<R> Completion<R> {
    pub fn index(&self) -> &GridIndex {
        match self {
            Completion::Finished { index, .. } | Completion::Failed { index, .. } => index,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Completion::Failed { .. })
    }
}

/// Lifecycle of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Submitted,
    Draining,
    Done,
}

/// Where the per-block function runs.
///
/// `submit` enumerates every grid index in row-major order and schedules one
/// invocation per block; `results` hands out the completion stream exactly
/// once per submission. Calling `submit` again discards the previous
/// submission.
pub trait Executor<A, R> {
    /// Schedule the function over `grid`. `grid_dims` is the number of leading
    /// axes that index the grid; `None` assumes half of `grid.ndim()`.
    ///
    /// The view collection decides which grid ranks it can address. A
    /// [`BlockGrid`](crate::grid::BlockGrid) only accepts its own grid rank,
    /// so any other count is rejected as `InvalidArgument` before a block runs.
    fn submit(&mut self, grid: &dyn ViewGrid<Elem = A>, grid_dims: Option<usize>) -> Result<()>;

    /// Single-consumer completion stream of the current submission
    fn results(&mut self) -> Result<Completions<R>>;

    fn state(&self) -> ExecutorState;

    /// Grid shape of the current submission, once known
    fn grid_shape(&self) -> Option<&[usize]>;
}

/// One scheduled call of the user function
#[derive(Debug)]
pub struct Invocation<'g, A> {
    pub index: GridIndex,
    pub block: ArrayViewD<'g, A>,
}

/// Every invocation of a submission, in grid order
pub(crate) struct Plan<'g, A> {
    pub grid_shape: Vec<usize>,
    pub invocations: Vec<Invocation<'g, A>>,
}

/// Number of grid axes to use for a collection of `ndim` dimensions.
///
/// Without an explicit count the grid is assumed to have as many axes as each
/// block, i.e. half of `ndim` rounded down.
pub fn resolve_grid_dims(ndim: usize, grid_dims: Option<usize>) -> Result<usize> {
    match grid_dims {
        None => Ok(ndim / 2),
        Some(dims) if dims > ndim => Err(BlockError::invalid(format!(
            "grid_dims {dims} exceeds the {ndim} dimensions of the view collection"
        ))),
        Some(dims) => Ok(dims),
    }
}

pub(crate) fn plan_invocations<'g, A>(
    grid: &'g dyn ViewGrid<Elem = A>,
    grid_dims: Option<usize>,
) -> Result<Plan<'g, A>> {
    let dims = resolve_grid_dims(grid.ndim(), grid_dims)?;
    let grid_shape = grid.shape()[..dims].to_vec();

    let invocations = ndarray::indices(IxDyn(&grid_shape))
        .into_iter()
        .map(|index| {
            let block = grid.view_at(index.slice()).map_err(|err| match err {
                BlockError::InvalidArgument(message) => BlockError::invalid(format!(
                    "grid_dims {dims} is not addressable by this view collection: {message}"
                )),
                other => other,
            })?;
            Ok(Invocation { index, block })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Plan {
        grid_shape,
        invocations,
    })
}

/// Run `func` on one block, turning errors and panics into a failed completion
pub(crate) fn invoke<A, P, R, F>(
    func: &F,
    index: GridIndex,
    block: ArrayViewD<'_, A>,
    args: &P,
) -> Completion<R>
where
    F: Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, String> + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| func(block, args))) {
        Ok(Ok(value)) => Completion::Finished { index, value },
        Ok(Err(message)) => Completion::Failed { index, message },
        Err(payload) => Completion::Failed {
            index,
            message: panic_message(payload.as_ref()),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Completion channel and bookkeeping for one submission
pub(crate) struct Submission<R> {
    receiver: Option<Receiver<Completion<R>>>,
    grid_shape: Vec<usize>,
    expected: usize,
    received: Arc<AtomicUsize>,
}

impl<R> Submission<R> {
    pub fn new(receiver: Receiver<Completion<R>>, grid_shape: Vec<usize>) -> Self {
        let expected = grid_shape.iter().product();
        Self {
            receiver: Some(receiver),
            grid_shape,
            expected,
            received: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn grid_shape(&self) -> &[usize] {
        &self.grid_shape
    }

    pub fn state(&self) -> ExecutorState {
        if self.receiver.is_some() {
            ExecutorState::Submitted
        } else if self.received.load(Ordering::Acquire) < self.expected {
            ExecutorState::Draining
        } else {
            ExecutorState::Done
        }
    }

    pub fn take_results(&mut self) -> Result<Completions<R>> {
        let receiver = self.receiver.take().ok_or_else(|| {
            BlockError::invalid("results of this submission were already taken")
        })?;
        Ok(Completions {
            receiver,
            grid_shape: self.grid_shape.clone(),
            expected: self.expected,
            received: self.received.clone(),
        })
    }
}

pub(crate) fn state_of<R>(submission: Option<&Submission<R>>) -> ExecutorState {
    submission.map_or(ExecutorState::Idle, Submission::state)
}

pub(crate) fn take_results<R>(submission: Option<&mut Submission<R>>) -> Result<Completions<R>> {
    submission
        .ok_or_else(|| BlockError::invalid("results requested before submit"))?
        .take_results()
}

/// Unordered stream of completions for one submission.
///
/// Yields exactly as many completions as blocks were submitted; it is not
/// restartable and has a single consumer.
pub struct Completions<R> {
    receiver: Receiver<Completion<R>>,
    grid_shape: Vec<usize>,
    expected: usize,
    received: Arc<AtomicUsize>,
}

impl<R> Completions<R> {
    pub fn grid_shape(&self) -> &[usize] {
        &self.grid_shape
    }

    /// Total number of completions this stream will deliver
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    /// Next completion, or `None` once every expected completion was seen.
    /// With a timeout, each wait is bounded and a miss is a `Timeout` error.
    pub fn next_completion(&mut self, timeout: Option<Duration>) -> Result<Option<Completion<R>>> {
        let received = self.received();
        let expected = self.expected;
        if received >= expected {
            return Ok(None);
        }

        let completion = match timeout {
            Some(timeout) => self.receiver.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => BlockError::Timeout {
                    timeout,
                    received,
                    expected,
                },
                RecvTimeoutError::Disconnected => BlockError::Disconnected { received, expected },
            })?,
            None => self
                .receiver
                .recv()
                .map_err(|_| BlockError::Disconnected { received, expected })?,
        };

        self.received.fetch_add(1, Ordering::AcqRel);
        Ok(Some(completion))
    }
}

/// Runs every block on the calling thread, in grid order, during `submit`
pub struct SequentialExecutor<'f, A, P, R> {
    func: BlockFn<'f, A, P, R>,
    args: P,
    submission: Option<Submission<R>>,
}

impl<'f, A, P, R> SequentialExecutor<'f, A, P, R> {
    pub fn new<F>(func: F, args: P) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> R + 'f,
    {
        Self {
            func: Box::new(move |block: ArrayViewD<'_, A>, args: &P| Ok::<R, String>(func(block, args))),
            args,
            submission: None,
        }
    }

    /// Like `new`, for functions that report failure through `Err`
    pub fn try_new<F, E>(func: F, args: P) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, E> + 'f,
        E: Display,
    {
        Self {
            func: Box::new(move |block: ArrayViewD<'_, A>, args: &P| {
                func(block, args).map_err(|err| err.to_string())
            }),
            args,
            submission: None,
        }
    }
}

impl<A, P, R> Executor<A, R> for SequentialExecutor<'_, A, P, R> {
    fn submit(&mut self, grid: &dyn ViewGrid<Elem = A>, grid_dims: Option<usize>) -> Result<()> {
        self.submission = None;
        let Plan {
            grid_shape,
            invocations,
        } = plan_invocations(grid, grid_dims)?;

        tracing::debug!(
            "Running {} blocks sequentially over grid {:?}",
            invocations.len(),
            grid_shape
        );

        let (sender, receiver) = unbounded();
        let submission = Submission::new(receiver, grid_shape);
        for Invocation { index, block } in invocations {
            let completion = invoke(&*self.func, index, block, &self.args);
            if let Completion::Failed { index, message } = &completion {
                tracing::debug!("Block {:?} failed: {}", index.slice(), message);
            }
            if sender.send(completion).is_err() {
                break;
            }
        }

        self.submission = Some(submission);
        Ok(())
    }

    fn results(&mut self) -> Result<Completions<R>> {
        take_results(self.submission.as_mut())
    }

    fn state(&self) -> ExecutorState {
        state_of(self.submission.as_ref())
    }

    fn grid_shape(&self) -> Option<&[usize]> {
        self.submission.as_ref().map(Submission::grid_shape)
    }
}

/// Execution strategy enum for choosing between sequential and pooled execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    /// Fixed pool of dedicated worker threads
    Pooled { workers: usize },
    /// Private rayon pool, one job per block
    WorkStealing { threads: usize },
}

impl ExecutionStrategy {
    /// Pooled strategy with the default pool size
    pub fn pooled() -> Self {
        ExecutionStrategy::Pooled {
            workers: DEFAULT_POOL_SIZE,
        }
    }

    pub fn is_parallel(&self) -> bool {
        !matches!(self, ExecutionStrategy::Sequential)
    }

    /// Threshold-based choice: keep a parallel strategy only when there are
    /// at least `min_blocks_for_parallel` blocks to pay for starting a pool.
    /// A threshold of 0 never falls back.
    ///
    /// ```rust
    /// use blockproc::ExecutionStrategy;
    ///
    /// let pooled = ExecutionStrategy::Pooled { workers: 8 };
    /// assert_eq!(pooled.auto(4, 16), ExecutionStrategy::Sequential);
    /// assert_eq!(pooled.auto(64, 16), pooled);
    /// assert_eq!(pooled.auto(4, 0), pooled);
    /// ```
    pub fn auto(self, block_count: usize, min_blocks_for_parallel: usize) -> Self {
        if self.is_parallel() && block_count < min_blocks_for_parallel {
            ExecutionStrategy::Sequential
        } else {
            self
        }
    }

    /// Workers allowed by the host and the configured limits.
    ///
    /// ```text
    /// 1. cores = num_cpus::get()
    /// 2. by_percentage = max(1, cores * thread_percentage / 100)
    /// 3. min(max_threads_config, by_percentage) when max_threads_config > 0
    /// ```
    pub fn calculate_optimal_workers(max_threads_config: usize, thread_percentage: u8) -> usize {
        let available_cores = num_cpus::get();

        let workers_by_percentage =
            std::cmp::max(1, (available_cores * thread_percentage as usize) / 100);

        if max_threads_config > 0 {
            std::cmp::min(max_threads_config, workers_by_percentage)
        } else {
            workers_by_percentage
        }
    }
}
