//! Reassembly of unordered completions into the output array

use ndarray::{ArrayD, Dimension, IxDyn};
use std::time::Duration;

use crate::error::{BlockError, Result};
use crate::grid::GridIndex;
use crate::parallel::{Completion, Completions};

/// Turns a completion stream into a dense array shaped like the grid
pub struct ResultCollector<R> {
    completions: Completions<R>,
}

impl<R> ResultCollector<R> {
    pub fn new(completions: Completions<R>) -> Self {
        Self { completions }
    }

    pub fn grid_shape(&self) -> &[usize] {
        self.completions.grid_shape()
    }

    /// Number of results the collector waits for
    pub fn expected(&self) -> usize {
        self.completions.expected()
    }

    /// Lazily yield `(index, value)` pairs as completions arrive.
    ///
    /// Each wait is bounded by `timeout`. The first failure or timeout is
    /// yielded as an error and ends the iteration.
    pub fn drain(&mut self, timeout: Option<Duration>) -> Drain<'_, R> {
        Drain {
            completions: &mut self.completions,
            timeout,
            finished: false,
        }
    }

    /// Wait for every completion and place each value at its grid index.
    ///
    /// Any error aborts collection; partially filled output is discarded.
    pub fn collect(mut self, timeout: Option<Duration>) -> Result<ArrayD<R>> {
        let shape = IxDyn(self.grid_shape());
        let mut cells: ArrayD<Option<R>> = ArrayD::from_shape_simple_fn(shape.clone(), || None);

        for item in self.drain(timeout) {
            let (index, value) = item?;
            let cell = cells.get_mut(index.slice()).ok_or_else(|| {
                BlockError::Corrupted(format!(
                    "index {:?} lies outside grid {:?}",
                    index.slice(),
                    shape.slice()
                ))
            })?;
            if cell.replace(value).is_some() {
                return Err(BlockError::Corrupted(format!(
                    "block {:?} completed twice",
                    index.slice()
                )));
            }
        }

        let values = cells
            .iter_mut()
            .map(Option::take)
            .collect::<Option<Vec<R>>>()
            .ok_or_else(|| BlockError::Corrupted("some blocks never completed".to_string()))?;

        ArrayD::from_shape_vec(shape, values).map_err(|err| BlockError::Corrupted(err.to_string()))
    }
}

/// Iterator returned by [`ResultCollector::drain`]
pub struct Drain<'c, R> {
    completions: &'c mut Completions<R>,
    timeout: Option<Duration>,
    finished: bool,
}

impl<R> Iterator for Drain<'_, R> {
    type Item = Result<(GridIndex, R)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let item = match self.completions.next_completion(self.timeout) {
            Ok(Some(Completion::Finished { index, value })) => Ok((index, value)),
            Ok(Some(Completion::Failed { index, message })) => Err(BlockError::WorkerFailure {
                index: index.slice().to_vec(),
                message,
            }),
            Ok(None) => {
                self.finished = true;
                return None;
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &item {
            tracing::debug!("Stopping collection: {}", err);
            self.finished = true;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.completions.expected() - self.completions.received();
        (0, Some(remaining))
    }
}

/// Merge array-valued block results into one array.
///
/// The result has shape `grid_shape ++ result_shape` and standard row-major
/// layout, whatever the layout of the individual results. Every result must
/// have the same shape.
pub fn stack_results<T: Clone>(results: &ArrayD<ArrayD<T>>) -> Result<ArrayD<T>> {
    let inner_shape = match results.iter().next() {
        Some(first) => first.shape().to_vec(),
        None => {
            return Err(BlockError::invalid(
                "cannot stack an empty result grid: block result shape is unknown",
            ));
        }
    };

    let mut data = Vec::with_capacity(results.len() * inner_shape.iter().product::<usize>());
    for (index, result) in results.indexed_iter() {
        if result.shape() != inner_shape.as_slice() {
            return Err(BlockError::invalid(format!(
                "result at {:?} has shape {:?}, expected {:?}",
                index.slice(),
                result.shape(),
                inner_shape
            )));
        }
        data.extend(result.iter().cloned());
    }

    let shape: Vec<usize> = results.shape().iter().chain(&inner_shape).copied().collect();
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|err| BlockError::invalid(err.to_string()))
}
