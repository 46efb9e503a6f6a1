//! End-to-end tests for block processing across execution strategies

use blockproc::parallel::{Executor, ExecutorState, PooledExecutor};
use blockproc::{
    BlockError, ExecutionStrategy, ProcessOptions, ResultCollector, process_blocks,
    try_process_blocks, windows,
};
use ndarray::{Array, Array2, ArrayD, ArrayViewD, Axis, Ix2, IxDyn, s};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn ramp(n: usize) -> Array2<f64> {
    Array::from_shape_fn((n, n), |(r, c)| (r * n + c) as f64)
}

fn sum(block: ArrayViewD<'_, f64>, _: &()) -> f64 {
    block.sum()
}

fn all_strategies() -> Vec<ExecutionStrategy> {
    vec![
        ExecutionStrategy::Sequential,
        ExecutionStrategy::Pooled { workers: 3 },
        ExecutionStrategy::WorkStealing { threads: 3 },
    ]
}

/// Distinct 8x8 quadrants of a 16x16 array
#[test]
fn test_sum_of_quadrants() {
    let image = ramp(16);
    let output = process_blocks(&image, &[8, 8], sum, (), 0, &ProcessOptions::default()).unwrap();

    assert_eq!(output.shape(), &[2, 2]);
    assert_eq!(output[[0, 0]], image.slice(s![..8, ..8]).sum());
    assert_eq!(output[[0, 1]], image.slice(s![..8, 8..]).sum());
    assert_eq!(output[[1, 0]], image.slice(s![8.., ..8]).sum());
    assert_eq!(output[[1, 1]], image.slice(s![8.., 8..]).sum());
}

/// Overlap of 4 halves the step and shares borders between neighbours
#[test]
fn test_overlapping_blocks_share_borders() {
    let image = ramp(16);
    let output = process_blocks(&image, &[8, 8], sum, (), 4, &ProcessOptions::default()).unwrap();

    assert_eq!(output.shape(), &[3, 3]);
    assert_eq!(output[[0, 0]], image.slice(s![0..8, 0..8]).sum());
    assert_eq!(output[[0, 1]], image.slice(s![0..8, 4..12]).sum());
    assert_eq!(output[[2, 2]], image.slice(s![8..16, 8..16]).sum());

    let shared = image.slice(s![0..8, 4..8]).sum();
    let left_only = image.slice(s![0..8, 0..4]).sum();
    let right_only = image.slice(s![0..8, 8..12]).sum();
    assert_eq!(output[[0, 0]], left_only + shared);
    assert_eq!(output[[0, 1]], shared + right_only);
}

/// A failing block aborts the run and reports its grid index
#[test]
fn test_worker_failure_is_tagged_with_grid_index() {
    let image = ramp(16);
    let result = try_process_blocks(
        &image,
        &[8, 8],
        |block: ArrayViewD<'_, f64>, _: &()| {
            if block[[0, 0]] == 8.0 * 16.0 + 8.0 {
                Err(format!("cannot process block starting at {}", block[[0, 0]]))
            } else {
                Ok(block.sum())
            }
        },
        (),
        0,
        &ProcessOptions::new(ExecutionStrategy::Pooled { workers: 2 }),
    );

    match result {
        Err(BlockError::WorkerFailure { index, message }) => {
            assert_eq!(index, vec![1, 1]);
            assert!(message.contains("136"));
        }
        other => panic!("expected WorkerFailure, got {:?}", other.map(|a| a.shape().to_vec())),
    }
}

/// Panics inside the block function are captured, not propagated
#[test]
fn test_panicking_block_is_reported_for_every_strategy() {
    for strategy in all_strategies() {
        let err = process_blocks(
            &ramp(4),
            &[2, 2],
            |block: ArrayViewD<'_, f64>, _: &()| {
                assert!(block[[0, 0]] != 0.0, "origin block rejected");
                block.sum()
            },
            (),
            0,
            &ProcessOptions::new(strategy),
        )
        .unwrap_err();

        assert_eq!(err.grid_index(), Some(&[0, 0][..]), "{:?}", strategy);
        assert!(err.to_string().contains("origin block rejected"), "{:?}", strategy);
    }
}

/// A bounded drain gives up on a slow worker long before it finishes
#[test]
fn test_drain_times_out_before_slow_worker_finishes() {
    let image = ramp(4).into_dyn();
    let grid = windows(image.view(), &[4, 4], 4).unwrap();
    let mut executor = PooledExecutor::new(
        |block: ArrayViewD<'_, f64>, _: &()| {
            thread::sleep(Duration::from_secs(1));
            block.sum()
        },
        (),
        1,
    );
    executor.submit(&grid, None).unwrap();

    let mut collector = ResultCollector::new(executor.results().unwrap());
    let started = Instant::now();
    let first = collector.drain(Some(Duration::from_millis(10))).next();

    assert!(started.elapsed() < Duration::from_millis(900));
    match first {
        Some(Err(err)) => assert!(err.is_timeout(), "unexpected error {err}"),
        other => panic!("expected a timeout, got {:?}", other.map(|r| r.is_ok())),
    }
    assert_eq!(executor.state(), ExecutorState::Draining);

    // Dropping the executor must not wait for the sleeping worker
    let dropped = Instant::now();
    drop(executor);
    assert!(dropped.elapsed() < Duration::from_millis(900));
}

/// The whole call returns a timeout instead of waiting for slow blocks
#[test]
fn test_process_blocks_times_out_on_parallel_strategies() {
    let image = ramp(4);
    for strategy in [
        ExecutionStrategy::Pooled { workers: 2 },
        ExecutionStrategy::WorkStealing { threads: 2 },
    ] {
        let started = Instant::now();
        let err = process_blocks(
            &image,
            &[2, 2],
            |block: ArrayViewD<'_, f64>, _: &()| {
                thread::sleep(Duration::from_secs(1));
                block.sum()
            },
            (),
            0,
            &ProcessOptions::new(strategy).with_timeout(Duration::from_millis(10)),
        )
        .unwrap_err();

        assert!(err.is_timeout(), "{strategy:?}: unexpected error {err}");
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "{strategy:?} waited {:?}",
            started.elapsed()
        );
    }
}

#[test]
fn test_strategies_agree() {
    let image = ramp(20);
    let expected =
        process_blocks(&image, &[5, 4], sum, (), 1, &ProcessOptions::default()).unwrap();

    for strategy in all_strategies() {
        let output =
            process_blocks(&image, &[5, 4], sum, (), 1, &ProcessOptions::new(strategy)).unwrap();
        assert_eq!(output, expected, "{:?}", strategy);
    }
}

#[test]
fn test_every_block_runs_exactly_once() {
    for strategy in all_strategies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let output = process_blocks(
            &ramp(12),
            &[3, 3],
            move |block: ArrayViewD<'_, f64>, _: &()| {
                counter.fetch_add(1, Ordering::SeqCst);
                block[[0, 0]]
            },
            (),
            0,
            &ProcessOptions::new(strategy).with_timeout(Duration::from_secs(10)),
        )
        .unwrap();

        assert_eq!(output.shape(), &[4, 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 16, "{:?}", strategy);
        // Each cell holds the origin of its own block
        for ((r, c), value) in output.into_dimensionality::<Ix2>().unwrap().indexed_iter() {
            assert_eq!(*value, (r * 3 * 12 + c * 3) as f64);
        }
    }
}

#[test]
fn test_three_dimensional_volume() {
    let volume = ArrayD::from_shape_fn(IxDyn(&[4, 6, 8]), |_| 1.0);
    let output = process_blocks(
        &volume,
        &[2, 2, 2],
        sum,
        (),
        0,
        &ProcessOptions::new(ExecutionStrategy::pooled()),
    )
    .unwrap();
    assert_eq!(output.shape(), &[2, 3, 4]);
    assert!(output.iter().all(|&v| v == 8.0));
}

#[test]
fn test_block_matching_array_gives_single_cell() {
    let image = ramp(6);
    let output = process_blocks(&image, &[6, 6], sum, (), 0, &ProcessOptions::default()).unwrap();
    assert_eq!(output.shape(), &[1, 1]);
    assert_eq!(output[[0, 0]], image.sum());
}

#[test]
fn test_invalid_arguments_are_rejected_before_running() {
    let image = ramp(8);
    let options = ProcessOptions::new(ExecutionStrategy::pooled());
    let cases: Vec<(Vec<usize>, usize)> = vec![
        (vec![4], 0),       // rank mismatch
        (vec![4, 4], 4),    // overlap leaves no step
        (vec![4, 4], 9),    // overlap larger than block
        (vec![0, 4], 0),    // empty block
        (vec![9, 4], 0),    // block larger than array
    ];

    for (block_shape, overlap) in cases {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = process_blocks(
            &image,
            &block_shape,
            move |block: ArrayViewD<'_, f64>, _: &()| {
                counter.fetch_add(1, Ordering::SeqCst);
                block.sum()
            },
            (),
            overlap,
            &options,
        )
        .unwrap_err();

        assert!(
            matches!(err, BlockError::InvalidArgument(_)),
            "{:?} overlap {}: {:?}",
            block_shape,
            overlap,
            err
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn test_array_valued_results() {
    let image = ramp(8);
    let output = process_blocks(
        &image,
        &[4, 4],
        |block: ArrayViewD<'_, f64>, _: &()| block.sum_axis(Axis(0)),
        (),
        0,
        &ProcessOptions::new(ExecutionStrategy::WorkStealing { threads: 2 }),
    )
    .unwrap();

    let stacked = blockproc::stack_results(&output).unwrap();
    assert_eq!(stacked.shape(), &[2, 2, 4]);
    let first: Vec<f64> = stacked
        .index_axis(Axis(0), 0)
        .index_axis(Axis(0), 0)
        .iter()
        .copied()
        .collect();
    assert_eq!(first, image.slice(s![..4, ..4]).sum_axis(Axis(0)).to_vec());
}
