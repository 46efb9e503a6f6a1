use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use ndarray::{ArrayD, ArrayViewD};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::core::{
    Completion, Completions, DEFAULT_POOL_SIZE, Executor, ExecutorState, Invocation, Plan,
    SharedBlockFn, Submission, invoke, plan_invocations, state_of, take_results,
};
use crate::error::{BlockError, Result};
use crate::grid::{GridIndex, ViewGrid};

/// Owned copy of a block, ready to cross a thread boundary
type Job<A> = (GridIndex, ArrayD<A>);

/// Context for worker threads to avoid too many function parameters
struct WorkerContext<A, P, R> {
    worker_id: usize,
    work_rx: Receiver<Job<A>>,
    result_tx: Sender<Completion<R>>,
    func: SharedBlockFn<A, P, R>,
    args: Arc<P>,
    abandoned: Arc<AtomicBool>,
}

/// Runs blocks on a fixed-size pool of worker threads.
///
/// Each submission starts a fresh pool and then feeds it owned copies of
/// the blocks through a work queue. The queue is unbounded by default, so
/// every copy is made before `submit` returns. With
/// [`with_queue_capacity`](Self::with_queue_capacity) at most that many
/// copies wait ahead of the workers and `submit` blocks until the last block
/// is queued. Completions are pushed to a shared queue as soon as each block
/// finishes, so they arrive in no particular order. The pool is joined when
/// the executor is dropped or resubmitted after every completion arrived.
/// If the caller stopped waiting earlier (a timeout or a failure), queued
/// blocks are skipped and the pool is detached: blocks already running still
/// finish, and their completions are discarded.
pub struct PooledExecutor<A, P, R> {
    func: SharedBlockFn<A, P, R>,
    args: Arc<P>,
    workers: usize,
    queue_capacity: Option<usize>,
    submission: Option<Submission<R>>,
    handles: Vec<JoinHandle<()>>,
    abandoned: Arc<AtomicBool>,
}

impl<A, P, R> PooledExecutor<A, P, R>
where
    A: Send + 'static,
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new<F>(func: F, args: P, workers: usize) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> R + Send + Sync + 'static,
    {
        Self::from_shared(
            Arc::new(move |block: ArrayViewD<'_, A>, args: &P| Ok::<R, String>(func(block, args))),
            args,
            workers,
        )
    }

    /// Like `new`, for functions that report failure through `Err`
    pub fn try_new<F, E>(func: F, args: P, workers: usize) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, E> + Send + Sync + 'static,
        E: Display,
    {
        Self::from_shared(
            Arc::new(move |block: ArrayViewD<'_, A>, args: &P| {
                func(block, args).map_err(|err| err.to_string())
            }),
            args,
            workers,
        )
    }

    /// Pool with [`DEFAULT_POOL_SIZE`] workers
    pub fn with_default_pool<F>(func: F, args: P) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> R + Send + Sync + 'static,
    {
        Self::new(func, args, DEFAULT_POOL_SIZE)
    }

    fn from_shared(func: SharedBlockFn<A, P, R>, args: P, workers: usize) -> Self {
        Self {
            func,
            args: Arc::new(args),
            workers: workers.max(1),
            queue_capacity: None,
            submission: None,
            handles: Vec::new(),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Limit the blocks copied ahead of the workers (clamped to at least 1)
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }

    fn spawn_worker(&self, ctx: WorkerContext<A, P, R>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("blockproc-worker-{}", ctx.worker_id))
            .spawn(move || worker_thread(ctx))
            .map_err(|err| BlockError::PoolSetup(err.to_string()))
    }
}

fn worker_thread<A, P, R>(ctx: WorkerContext<A, P, R>) {
    tracing::trace!("Worker {} started", ctx.worker_id);
    let mut processed = 0usize;

    while let Ok((index, block)) = ctx.work_rx.recv() {
        if ctx.abandoned.load(Ordering::Acquire) {
            break; // Collector gave up
        }

        let completion = invoke(&*ctx.func, index, block.view(), &*ctx.args);
        processed += 1;

        if ctx.result_tx.send(completion).is_err() {
            break; // Receiver dropped
        }
    }

    tracing::trace!("Worker {} stopped after {} blocks", ctx.worker_id, processed);
}

impl<A, P, R> PooledExecutor<A, P, R> {
    /// Join the pool if it ran to completion, otherwise detach it
    fn teardown(&mut self) {
        if self.handles.is_empty() {
            return;
        }

        let finished = matches!(
            state_of(self.submission.as_ref()),
            ExecutorState::Done | ExecutorState::Idle
        );
        if finished {
            for handle in self.handles.drain(..) {
                if handle.join().is_err() {
                    tracing::warn!("Worker thread panicked outside of a block invocation");
                }
            }
        } else {
            self.abandoned.store(true, Ordering::Release);
            tracing::debug!(
                "Detaching {} workers with unfinished blocks",
                self.handles.len()
            );
            self.handles.clear();
        }
    }
}

impl<A, P, R> Executor<A, R> for PooledExecutor<A, P, R>
where
    A: Clone + Send + 'static,
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn submit(&mut self, grid: &dyn ViewGrid<Elem = A>, grid_dims: Option<usize>) -> Result<()> {
        self.teardown();
        self.submission = None;

        let Plan {
            grid_shape,
            invocations,
        } = plan_invocations(grid, grid_dims)?;
        let block_count = invocations.len();

        let (work_tx, work_rx) = match self.queue_capacity {
            Some(capacity) => bounded::<Job<A>>(capacity),
            None => unbounded::<Job<A>>(),
        };
        let (result_tx, result_rx) = unbounded();

        let actual_workers = std::cmp::min(self.workers, block_count);
        tracing::debug!(
            "Dispatching {} blocks over grid {:?} to {} workers",
            block_count,
            grid_shape,
            actual_workers
        );

        self.abandoned = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(actual_workers);
        for worker_id in 0..actual_workers {
            let ctx = WorkerContext {
                worker_id,
                work_rx: work_rx.clone(),
                result_tx: result_tx.clone(),
                func: self.func.clone(),
                args: self.args.clone(),
                abandoned: self.abandoned.clone(),
            };
            match self.spawn_worker(ctx) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Stop the workers that did start
                    self.abandoned.store(true, Ordering::Release);
                    return Err(err);
                }
            }
        }
        drop(work_rx);
        drop(result_tx);

        // Workers are already draining, so a bounded queue never deadlocks here
        for Invocation { index, block } in invocations {
            if work_tx.send((index, block.to_owned())).is_err() {
                tracing::warn!("Every worker exited before the work queue was filled");
                break;
            }
        }
        drop(work_tx);

        self.handles = handles;
        self.submission = Some(Submission::new(result_rx, grid_shape));
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

impl<A, P, R> Drop for PooledExecutor<A, P, R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<A, P, R> std::fmt::Debug for PooledExecutor<A, P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledExecutor")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("state", &state_of(self.submission.as_ref()))
            .field("live_threads", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::windows;
    use ndarray::{Array, Dimension, IxDyn};
    use std::time::Duration;

    fn ramp(shape: &[usize]) -> ArrayD<i64> {
        let len: usize = shape.iter().product();
        Array::from_iter(0..len as i64)
            .into_shape_with_order(IxDyn(shape))
            .unwrap()
    }

    #[test]
    fn test_pooled_executor_delivers_every_block() {
        let array = ramp(&[6, 6]);
        let grid = windows(array.view(), &[2, 2], 2).unwrap();
        let mut executor =
            PooledExecutor::new(|block: ArrayViewD<'_, i64>, _: &()| block.sum(), (), 3);
        executor.submit(&grid, None).unwrap();

        let mut completions = executor.results().unwrap();
        let mut indices = Vec::new();
        while let Some(completion) = completions.next_completion(None).unwrap() {
            match completion {
                Completion::Finished { index, value } => {
                    let block = grid.block(index.slice()).unwrap();
                    assert_eq!(value, block.sum());
                    indices.push(index.slice().to_vec());
                }
                Completion::Failed { index, message } => {
                    panic!("block {index:?} failed: {message}")
                }
            }
        }

        // Completions may arrive in any order
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 9);
        assert_eq!(executor.state(), ExecutorState::Done);
    }

    #[test]
    fn test_pool_never_exceeds_block_count() {
        let array = ramp(&[2, 2]);
        let grid = windows(array.view(), &[2, 2], 2).unwrap();
        let mut executor =
            PooledExecutor::new(|block: ArrayViewD<'_, i64>, _: &()| block.sum(), (), 8);
        executor.submit(&grid, None).unwrap();
        assert_eq!(executor.handles.len(), 1);
        assert_eq!(executor.workers(), 8);
    }

    #[test]
    fn test_bounded_queue_feeds_blocks_while_workers_run() {
        let array = ramp(&[2, 2]);
        let grid = windows(array.view(), &[1, 1], 1).unwrap();
        let mut executor = PooledExecutor::new(
            |block: ArrayViewD<'_, i64>, _: &()| {
                thread::sleep(Duration::from_millis(50));
                block.sum()
            },
            (),
            1,
        )
        .with_queue_capacity(1);
        assert_eq!(executor.queue_capacity(), Some(1));

        // One block running and one queued: the last two must wait for room
        let started = std::time::Instant::now();
        executor.submit(&grid, None).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));

        let mut completions = executor.results().unwrap();
        let mut total = 0;
        while let Some(completion) = completions.next_completion(None).unwrap() {
            match completion {
                Completion::Finished { value, .. } => total += value,
                Completion::Failed { index, message } => {
                    panic!("block {index:?} failed: {message}")
                }
            }
        }
        assert_eq!(total, 6);
        assert_eq!(executor.state(), ExecutorState::Done);
    }

    #[test]
    fn test_zero_queue_capacity_is_clamped() {
        let executor = PooledExecutor::new(|block: ArrayViewD<'_, i64>, _: &()| block.sum(), (), 2)
            .with_queue_capacity(0);
        assert_eq!(executor.queue_capacity(), Some(1));
    }

    #[test]
    fn test_timeout_leaves_slow_worker_detached() {
        let array = ramp(&[2, 2]);
        let grid = windows(array.view(), &[1, 1], 1).unwrap();
        let mut executor = PooledExecutor::with_default_pool(
            |block: ArrayViewD<'_, i64>, _: &()| {
                thread::sleep(Duration::from_millis(300));
                block.sum()
            },
            (),
        );
        executor.submit(&grid, None).unwrap();

        let mut completions = executor.results().unwrap();
        let err = completions
            .next_completion(Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(executor.state(), ExecutorState::Draining);

        // Dropping must not block on the sleeping workers
        let started = std::time::Instant::now();
        drop(completions);
        drop(executor);
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
