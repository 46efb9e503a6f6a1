use crossbeam::channel::{bounded, unbounded};
use ndarray::ArrayViewD;
use rayon::ThreadPool;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::core::{
    Completions, Executor, ExecutorState, Invocation, Plan, SharedBlockFn, Submission, invoke,
    plan_invocations, state_of, take_results,
};
use crate::error::{BlockError, Result};
use crate::grid::ViewGrid;

/// Runs blocks as jobs on a private rayon thread pool.
///
/// Same contract as [`PooledExecutor`](super::PooledExecutor), but scheduling
/// is left to rayon's work-stealing deque. The pool is built per submission
/// and released when the executor is dropped; dropping never waits for jobs.
///
/// Each job owns a copy of its block. With
/// [`with_queue_capacity`](Self::with_queue_capacity), at most that many jobs
/// are outstanding at once and `submit` blocks until the last one is spawned.
pub struct WorkStealingExecutor<A, P, R> {
    func: SharedBlockFn<A, P, R>,
    args: Arc<P>,
    threads: usize,
    queue_capacity: Option<usize>,
    pool: Option<ThreadPool>,
    submission: Option<Submission<R>>,
    abandoned: Arc<AtomicBool>,
}

impl<A, P, R> WorkStealingExecutor<A, P, R>
where
    A: Send + 'static,
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new<F>(func: F, args: P, threads: usize) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> R + Send + Sync + 'static,
    {
        Self::from_shared(
            Arc::new(move |block: ArrayViewD<'_, A>, args: &P| Ok::<R, String>(func(block, args))),
            args,
            threads,
        )
    }

    pub fn try_new<F, E>(func: F, args: P, threads: usize) -> Self
    where
        F: Fn(ArrayViewD<'_, A>, &P) -> std::result::Result<R, E> + Send + Sync + 'static,
        E: Display,
    {
        Self::from_shared(
            Arc::new(move |block: ArrayViewD<'_, A>, args: &P| {
                func(block, args).map_err(|err| err.to_string())
            }),
            args,
            threads,
        )
    }

    fn from_shared(func: SharedBlockFn<A, P, R>, args: P, threads: usize) -> Self {
        Self {
            func,
            args: Arc::new(args),
            threads: threads.max(1),
            queue_capacity: None,
            pool: None,
            submission: None,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Limit the jobs (and block copies) outstanding at once, at least 1
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl<A, P, R> WorkStealingExecutor<A, P, R> {
    fn release_pool(&mut self) {
        if self.pool.take().is_some()
            && !matches!(state_of(self.submission.as_ref()), ExecutorState::Done)
        {
            self.abandoned.store(true, Ordering::Release);
            tracing::debug!("Releasing rayon pool with unfinished blocks");
        }
    }
}

impl<A, P, R> Executor<A, R> for WorkStealingExecutor<A, P, R>
where
    A: Clone + Send + 'static,
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    fn submit(&mut self, grid: &dyn ViewGrid<Elem = A>, grid_dims: Option<usize>) -> Result<()> {
        self.release_pool();
        self.submission = None;

        let Plan {
            grid_shape,
            invocations,
        } = plan_invocations(grid, grid_dims)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("blockproc-rayon-{i}"))
            .build()
            .map_err(|err| BlockError::PoolSetup(err.to_string()))?;

        tracing::debug!(
            "Spawning {} block jobs over grid {:?} on {} rayon threads",
            invocations.len(),
            grid_shape,
            self.threads
        );

        self.abandoned = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = unbounded();
        // One permit per outstanding job; a job hands its permit back when done
        let permits = self.queue_capacity.map(bounded::<()>);
        for Invocation { index, block } in invocations {
            let permit = match &permits {
                Some((acquire, release)) => {
                    if acquire.send(()).is_err() {
                        break;
                    }
                    Some(release.clone())
                }
                None => None,
            };
            let block = block.to_owned();
            let result_tx = result_tx.clone();
            let func = self.func.clone();
            let args = self.args.clone();
            let abandoned = self.abandoned.clone();
            pool.spawn(move || {
                if !abandoned.load(Ordering::Acquire) {
                    let completion = invoke(&*func, index, block.view(), &*args);
                    // A closed channel means the collector is gone
                    let _ = result_tx.send(completion);
                }
                drop(block);
                if let Some(release) = permit {
                    let _ = release.try_recv();
                }
            });
        }

        self.pool = Some(pool);
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

impl<A, P, R> Drop for WorkStealingExecutor<A, P, R> {
    fn drop(&mut self) {
        self.release_pool();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::windows;
    use crate::parallel::Completion;
    use ndarray::{Array, ArrayD, Dimension, IxDyn};

    #[test]
    fn test_work_stealing_matches_block_sums() {
        let array: ArrayD<i64> = Array::from_iter(0..64)
            .into_shape_with_order(IxDyn(&[8, 8]))
            .unwrap();
        let grid = windows(array.view(), &[4, 4], 2).unwrap();
        let mut executor =
            WorkStealingExecutor::new(|block: ArrayViewD<'_, i64>, _: &()| block.sum(), (), 4);
        executor.submit(&grid, None).unwrap();

        let mut completions = executor.results().unwrap();
        assert_eq!(completions.expected(), 9);
        let mut count = 0;
        while let Some(completion) = completions.next_completion(None).unwrap() {
            let Completion::Finished { index, value } = completion else {
                panic!("unexpected failure");
            };
            assert_eq!(value, grid.block(index.slice()).unwrap().sum());
            count += 1;
        }
        assert_eq!(count, 9);
        assert_eq!(executor.state(), ExecutorState::Done);
    }

    #[test]
    fn test_queue_capacity_limits_outstanding_jobs() {
        use std::time::{Duration, Instant};

        let array: ArrayD<i64> = Array::from_iter(0..4)
            .into_shape_with_order(IxDyn(&[2, 2]))
            .unwrap();
        let grid = windows(array.view(), &[1, 1], 1).unwrap();
        let mut executor = WorkStealingExecutor::new(
            |block: ArrayViewD<'_, i64>, _: &()| {
                std::thread::sleep(Duration::from_millis(50));
                block.sum()
            },
            (),
            2,
        )
        .with_queue_capacity(1);

        // One job at a time: spawning the fourth waits for the first three
        let started = Instant::now();
        executor.submit(&grid, None).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(120));

        let mut completions = executor.results().unwrap();
        let mut total = 0;
        while let Some(completion) = completions.next_completion(None).unwrap() {
            let Completion::Finished { value, .. } = completion else {
                panic!("unexpected failure");
            };
            total += value;
        }
        assert_eq!(total, 6);
        assert_eq!(executor.state(), ExecutorState::Done);
    }

    #[test]
    fn test_work_stealing_reports_errors() {
        let array: ArrayD<i64> = Array::from_iter(0..4)
            .into_shape_with_order(IxDyn(&[2, 2]))
            .unwrap();
        let grid = windows(array.view(), &[1, 1], 1).unwrap();
        let mut executor = WorkStealingExecutor::try_new(
            |block: ArrayViewD<'_, i64>, _: &()| {
                if block.sum() == 2 {
                    Err("two")
                } else {
                    Ok(block.sum())
                }
            },
            (),
            2,
        );
        executor.submit(&grid, None).unwrap();

        let mut completions = executor.results().unwrap();
        let mut failures = Vec::new();
        while let Some(completion) = completions.next_completion(None).unwrap() {
            if let Completion::Failed { index, message } = completion {
                failures.push((index.slice().to_vec(), message));
            }
        }
        assert_eq!(failures, vec![(vec![1, 0], "two".to_string())]);
    }
}
