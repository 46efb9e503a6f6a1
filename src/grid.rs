//! Block partitioning
//!
//! A [`ViewGrid`] is a read-only, grid-addressable collection of block views.
//! Its shape lists the grid axes first, followed by the axes internal to each
//! block, so a 2-D array cut into 8x8 blocks on a 2x2 grid has shape
//! `[2, 2, 8, 8]`. Executors only need this trait; [`windows`] is the
//! rolling-window partitioner used by [`process_blocks`](crate::process_blocks).

use ndarray::{ArrayViewD, IxDyn, Slice};

use crate::error::{BlockError, Result};

/// Position of one block in the partition grid, most significant axis first
pub type GridIndex = IxDyn;

/// Grid-indexed collection of block views
pub trait ViewGrid {
    type Elem;

    /// Full shape: grid axes followed by per-block axes
    fn shape(&self) -> &[usize];

    /// Total dimensionality of the collection
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Block view stored at grid coordinate `index`
    fn view_at(&self, index: &[usize]) -> Result<ArrayViewD<'_, Self::Elem>>;
}

/// Step between block origins: `max(block_shape) - overlap`
pub fn block_step(block_shape: &[usize], overlap: usize) -> Result<usize> {
    let largest = block_shape
        .iter()
        .copied()
        .max()
        .ok_or_else(|| BlockError::invalid("block shape must have at least one axis"))?;

    match largest.checked_sub(overlap) {
        Some(step) if step > 0 => Ok(step),
        _ => Err(BlockError::invalid(format!(
            "overlap {overlap} must be smaller than the largest block dimension {largest}"
        ))),
    }
}

/// Rolling windows of `block_shape`, one every `step` elements along each axis
#[derive(Debug, Clone)]
pub struct BlockGrid<'a, A> {
    source: ArrayViewD<'a, A>,
    block_shape: Vec<usize>,
    step: usize,
    shape: Vec<usize>,
}

/// Partition `array` into windows of `block_shape` placed `step` apart
pub fn windows<'a, A>(
    array: ArrayViewD<'a, A>,
    block_shape: &[usize],
    step: usize,
) -> Result<BlockGrid<'a, A>> {
    if block_shape.len() != array.ndim() {
        return Err(BlockError::invalid(format!(
            "block shape {:?} has {} dimensions but the array has {}",
            block_shape,
            block_shape.len(),
            array.ndim()
        )));
    }
    if step == 0 {
        return Err(BlockError::invalid("step must be positive"));
    }

    let mut grid_shape = Vec::with_capacity(block_shape.len());
    for (axis, (&len, &block)) in array.shape().iter().zip(block_shape).enumerate() {
        if block == 0 {
            return Err(BlockError::invalid(format!(
                "block length on axis {axis} must be positive"
            )));
        }
        if block > len {
            return Err(BlockError::invalid(format!(
                "block length {block} exceeds array length {len} on axis {axis}"
            )));
        }
        grid_shape.push((len - block) / step + 1);
    }

    let shape = grid_shape.iter().chain(block_shape).copied().collect();
    Ok(BlockGrid {
        source: array,
        block_shape: block_shape.to_vec(),
        step,
        shape,
    })
}

impl<'a, A> BlockGrid<'a, A> {
    pub fn grid_shape(&self) -> &[usize] {
        &self.shape[..self.block_shape.len()]
    }

    pub fn block_shape(&self) -> &[usize] {
        &self.block_shape
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Number of grid axes
    pub fn grid_ndim(&self) -> usize {
        self.block_shape.len()
    }

    /// Number of blocks in the grid
    pub fn len(&self) -> usize {
        self.grid_shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View of the block at `index`, borrowing from the source array
    pub fn block(&self, index: &[usize]) -> Result<ArrayViewD<'a, A>> {
        if index.len() != self.grid_ndim() {
            return Err(BlockError::invalid(format!(
                "grid index {:?} must have {} coordinates",
                index,
                self.grid_ndim()
            )));
        }
        if let Some(axis) = (0..index.len()).find(|&axis| index[axis] >= self.shape[axis]) {
            return Err(BlockError::invalid(format!(
                "grid index {:?} is out of bounds on axis {} (extent {})",
                index, axis, self.shape[axis]
            )));
        }

        let mut view = self.source.clone();
        view.slice_each_axis_inplace(|description| {
            let axis = description.axis.index();
            let start = index[axis] * self.step;
            Slice::from(start..start + self.block_shape[axis])
        });
        Ok(view)
    }
}

impl<A> ViewGrid for BlockGrid<'_, A> {
    type Elem = A;

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn view_at(&self, index: &[usize]) -> Result<ArrayViewD<'_, A>> {
        self.block(index).map(|view| view.reborrow())
    }
}
