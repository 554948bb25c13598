//! Blockwise builders for concatenated vectors and matrices.
//!
//! Blocks are assigned by half-open ranges of the trailing axis (vectors)
//! or trailing two axes (matrices). Unassigned gaps are zero-filled with
//! the batch shape of an assigned block, then everything is concatenated
//! in interval order.
//!
//! ```
//! use ndarray::{Array, IxDyn};
//! use sumprod::linalg::BlockVector;
//!
//! let mut v = BlockVector::new(&[3, 6]);
//! v.set(0..2, Array::ones(IxDyn(&[3, 2])));
//! v.set(4..6, Array::ones(IxDyn(&[3, 2])));
//! let v = v.finish().unwrap();
//! assert_eq!(v.shape(), &[3, 6]);
//! assert_eq!(v[[0, 2]], 0.0);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use ndarray::{ArrayD, IxDyn};

use super::batched::cat;
use crate::error::{FactorError, Result};

/// Partition `[0, end)` using every endpoint of `intervals`.
fn find_intervals<'a, I>(intervals: I, end: usize) -> Vec<(usize, usize)>
where
    I: IntoIterator<Item = &'a (usize, usize)>,
{
    let mut cuts: BTreeSet<usize> = [0, end].into_iter().collect();
    for &(start, stop) in intervals {
        cuts.insert(start);
        cuts.insert(stop);
    }
    let cuts: Vec<usize> = cuts.into_iter().collect();
    cuts.windows(2).map(|w| (w[0], w[1])).collect()
}

fn zeros_like_batch(prototype: &ArrayD<f64>, event_ndim: usize, event: &[usize]) -> ArrayD<f64> {
    let mut shape = prototype.shape()[..prototype.ndim() - event_ndim].to_vec();
    shape.extend_from_slice(event);
    ArrayD::zeros(IxDyn(&shape))
}

fn check_shape(result: ArrayD<f64>, shape: &[usize], checked: bool) -> Result<ArrayD<f64>> {
    if checked && result.shape() != shape {
        return Err(FactorError::shape(
            format!("{:?}", shape),
            format!("{:?}", result.shape()),
        ));
    }
    Ok(result)
}

// ============================================================================
// BlockVector
// ============================================================================

/// Builder for a batch of vectors assembled from contiguous blocks.
#[derive(Clone, Debug)]
pub struct BlockVector {
    shape: Vec<usize>,
    parts: BTreeMap<(usize, usize), ArrayD<f64>>,
    checked: bool,
}

impl BlockVector {
    /// `shape` is the full result shape, batch axes first.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            parts: BTreeMap::new(),
            checked: true,
        }
    }

    /// Skip the final shape check.
    pub fn fast(mut self) -> Self {
        self.checked = false;
        self
    }

    /// Assign `value` (shape `batch + [range.len()]`) to `range`.
    pub fn set(&mut self, range: Range<usize>, value: ArrayD<f64>) {
        self.parts.insert((range.start, range.end), value);
    }

    pub fn finish(mut self) -> Result<ArrayD<f64>> {
        let end = *self.shape.last().unwrap_or(&0);
        let prototype = match self.parts.values().next() {
            Some(p) => p.clone(),
            None => return Ok(ArrayD::zeros(IxDyn(&self.shape))),
        };
        let intervals = find_intervals(self.parts.keys(), end);
        for key in self.parts.keys() {
            if !intervals.contains(key) {
                return Err(FactorError::Precondition(format!(
                    "overlapping block {:?}",
                    key
                )));
            }
        }
        for &(start, stop) in &intervals {
            self.parts
                .entry((start, stop))
                .or_insert_with(|| zeros_like_batch(&prototype, 1, &[stop - start]));
        }
        let parts: Vec<ArrayD<f64>> = self.parts.into_values().collect();
        check_shape(cat(&parts, 1)?, &self.shape, self.checked)
    }
}

// ============================================================================
// BlockMatrix
// ============================================================================

/// Builder for a batch of matrices assembled from rectangular blocks.
#[derive(Clone, Debug)]
pub struct BlockMatrix {
    shape: Vec<usize>,
    parts: BTreeMap<(usize, usize), BTreeMap<(usize, usize), ArrayD<f64>>>,
    checked: bool,
}

impl BlockMatrix {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            parts: BTreeMap::new(),
            checked: true,
        }
    }

    pub fn fast(mut self) -> Self {
        self.checked = false;
        self
    }

    /// Assign `value` (shape `batch + [rows.len(), cols.len()]`).
    pub fn set(&mut self, rows: Range<usize>, cols: Range<usize>, value: ArrayD<f64>) {
        self.parts
            .entry((rows.start, rows.end))
            .or_default()
            .insert((cols.start, cols.end), value);
    }

    pub fn finish(mut self) -> Result<ArrayD<f64>> {
        let nd = self.shape.len();
        if nd < 2 {
            return Err(FactorError::shape("matrix", format!("{:?}", self.shape)));
        }
        let prototype = match self.parts.values().flat_map(|row| row.values()).next() {
            Some(p) => p.clone(),
            None => return Ok(ArrayD::zeros(IxDyn(&self.shape))),
        };
        let col_keys: BTreeSet<(usize, usize)> = self
            .parts
            .values()
            .flat_map(|row| row.keys().copied())
            .collect();
        let rows = find_intervals(self.parts.keys(), self.shape[nd - 2]);
        let cols = find_intervals(col_keys.iter(), self.shape[nd - 1]);
        let misplaced = self.parts.keys().any(|k| !rows.contains(k))
            || col_keys.iter().any(|k| !cols.contains(k));
        if misplaced {
            return Err(FactorError::Precondition("overlapping matrix blocks".into()));
        }

        let mut row_blocks = Vec::with_capacity(rows.len());
        for &(r0, r1) in &rows {
            let row = self.parts.entry((r0, r1)).or_default();
            for &(c0, c1) in &cols {
                row.entry((c0, c1))
                    .or_insert_with(|| zeros_like_batch(&prototype, 2, &[r1 - r0, c1 - c0]));
            }
            let blocks: Vec<ArrayD<f64>> = row.values().cloned().collect();
            row_blocks.push(cat(&blocks, 1)?);
        }
        check_shape(cat(&row_blocks, 2)?, &self.shape, self.checked)
    }
}
