//! Batched dense linear algebra.
//!
//! Every routine treats the trailing one (vectors) or two (matrices) axes
//! as the event and broadcasts all leading axes numpy style, so a batched
//! call equals the per-element call on each batch entry.

use ndarray::{Array2, Array3, ArrayD, ArrayView2, Axis, IxDyn};

use crate::domain::broadcast_shapes;
use crate::error::{FactorError, Result};

// ============================================================================
// Shape plumbing
// ============================================================================

fn matrix_dims(a: &ArrayD<f64>) -> Result<(usize, usize)> {
    let nd = a.ndim();
    if nd < 2 {
        return Err(FactorError::shape("matrix", format!("{:?}", a.shape())));
    }
    Ok((a.shape()[nd - 2], a.shape()[nd - 1]))
}

fn matrix_batch(a: &ArrayD<f64>) -> &[usize] {
    &a.shape()[..a.ndim().saturating_sub(2)]
}

/// Broadcast `a` to `batch + [rows, cols]` and flatten the batch axes.
fn to_batches(a: &ArrayD<f64>, batch: &[usize], rows: usize, cols: usize) -> Result<Array3<f64>> {
    let mut target = batch.to_vec();
    target.extend([rows, cols]);
    let view = a
        .broadcast(IxDyn(&target))
        .ok_or_else(|| FactorError::shape(format!("{:?}", target), format!("{:?}", a.shape())))?;
    let n: usize = batch.iter().product();
    Array3::from_shape_vec((n, rows, cols), view.iter().copied().collect())
        .map_err(|e| FactorError::Precondition(e.to_string()))
}

fn from_batches(a: Array3<f64>, batch: &[usize]) -> Result<ArrayD<f64>> {
    let (_, rows, cols) = a.dim();
    let mut shape = batch.to_vec();
    shape.extend([rows, cols]);
    ArrayD::from_shape_vec(IxDyn(&shape), a.iter().copied().collect())
        .map_err(|e| FactorError::Precondition(e.to_string()))
}

/// Reshape by logical (row-major) element order.
pub fn reshape(a: &ArrayD<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    ArrayD::from_shape_vec(IxDyn(shape), a.iter().copied().collect())
        .map_err(|_| FactorError::shape(format!("{:?}", shape), format!("{:?}", a.shape())))
}

/// Broadcast to `shape` and materialize.
pub fn expand(a: &ArrayD<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    a.broadcast(IxDyn(shape))
        .map(|v| v.to_owned())
        .ok_or_else(|| FactorError::shape(format!("{:?}", shape), format!("{:?}", a.shape())))
}

/// Apply `f` to every batch entry of a (broadcast) pair of matrices.
fn map_pairs<F>(a: &ArrayD<f64>, b: &ArrayD<f64>, out_dims: (usize, usize), mut f: F) -> Result<ArrayD<f64>>
where
    F: FnMut(ArrayView2<f64>, ArrayView2<f64>) -> Result<Array2<f64>>,
{
    let (ar, ac) = matrix_dims(a)?;
    let (br, bc) = matrix_dims(b)?;
    let batch = broadcast_shapes(&[matrix_batch(a), matrix_batch(b)])?;
    let a3 = to_batches(a, &batch, ar, ac)?;
    let b3 = to_batches(b, &batch, br, bc)?;
    let mut out = Array3::zeros((a3.len_of(Axis(0)), out_dims.0, out_dims.1));
    for (mut o, (x, y)) in out
        .outer_iter_mut()
        .zip(a3.outer_iter().zip(b3.outer_iter()))
    {
        o.assign(&f(x, y)?);
    }
    from_batches(out, &batch)
}

// ============================================================================
// Matrix products
// ============================================================================

/// Batched `a @ b`.
pub fn matmul(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let (m, k) = matrix_dims(a)?;
    let (k2, n) = matrix_dims(b)?;
    if k != k2 {
        return Err(FactorError::shape(
            format!("[.., {}, _]", k),
            format!("{:?}", b.shape()),
        ));
    }
    map_pairs(a, b, (m, n), |x, y| Ok(x.dot(&y)))
}

/// Swap the two trailing axes.
pub fn transpose(a: &ArrayD<f64>) -> ArrayD<f64> {
    let nd = a.ndim();
    let mut view = a.view();
    view.swap_axes(nd - 2, nd - 1);
    view.to_owned()
}

/// `a @ a.T`
pub fn mmt(a: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    matmul(a, &transpose(a))
}

/// `a.T @ a`
pub fn mtm(a: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    matmul(&transpose(a), a)
}

/// Matrix times vector: `(.., n, m) x (.., m) -> (.., n)`.
pub fn mv(mat: &ArrayD<f64>, vec: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let col = vec.view().insert_axis(Axis(vec.ndim())).to_owned();
    let out = matmul(mat, &col)?;
    let last = out.ndim() - 1;
    Ok(out.index_axis(Axis(last), 0).to_owned())
}

/// Vector times matrix: `(.., n) x (.., n, m) -> (.., m)`.
pub fn vm(vec: &ArrayD<f64>, mat: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let row = vec.view().insert_axis(Axis(vec.ndim() - 1)).to_owned();
    let out = matmul(&row, mat)?;
    let axis = out.ndim() - 2;
    Ok(out.index_axis(Axis(axis), 0).to_owned())
}

/// Squared norm over the trailing axis.
pub fn norm2(vec: &ArrayD<f64>) -> ArrayD<f64> {
    let last = vec.ndim() - 1;
    vec.mapv(|x| x * x).sum_axis(Axis(last))
}

/// Identity matrices broadcast over `batch`.
pub fn eye(batch: &[usize], n: usize) -> Result<ArrayD<f64>> {
    let mut shape = batch.to_vec();
    shape.extend([n, n]);
    expand(&Array2::<f64>::eye(n).into_dyn(), &shape)
}

/// Concatenate along `axis`, counted from the end (`1` is the last axis).
pub fn cat(parts: &[ArrayD<f64>], axis_from_end: usize) -> Result<ArrayD<f64>> {
    let first = parts
        .first()
        .ok_or_else(|| FactorError::Precondition("cannot concatenate zero arrays".into()))?;
    let axis = first.ndim() - axis_from_end;
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(axis), &views).map_err(|e| FactorError::Precondition(e.to_string()))
}

/// Gather indices along `axis`, counted from the end.
pub fn select(a: &ArrayD<f64>, axis_from_end: usize, indices: &[usize]) -> ArrayD<f64> {
    a.select(Axis(a.ndim() - axis_from_end), indices)
}

// ============================================================================
// Cholesky and triangular solves
// ============================================================================

fn cholesky_single(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(FactorError::shape("square matrix", format!("{:?}", a.shape())));
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }
            if i == j {
                let diag = a[[j, j]] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return Err(FactorError::NotPositiveDefinite);
                }
                l[[j, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Lower-triangular Cholesky factor `L` with `L @ L.T = a`.
pub fn cholesky(a: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let (n, m) = matrix_dims(a)?;
    if n != m {
        return Err(FactorError::shape("square matrix", format!("{:?}", a.shape())));
    }
    let batch = matrix_batch(a).to_vec();
    let a3 = to_batches(a, &batch, n, n)?;
    let mut out = Array3::zeros((a3.len_of(Axis(0)), n, n));
    for (mut o, x) in out.outer_iter_mut().zip(a3.outer_iter()) {
        o.assign(&cholesky_single(x)?);
    }
    from_batches(out, &batch)
}

/// Solve `L @ X = B` (or `L.T @ X = B` when `transpose`) for lower `L`.
fn solve_lower_single(l: ArrayView2<f64>, b: ArrayView2<f64>, transpose: bool) -> Array2<f64> {
    let n = l.nrows();
    let mut x = b.to_owned();
    for col in 0..x.ncols() {
        if transpose {
            for i in (0..n).rev() {
                let mut sum = x[[i, col]];
                for k in (i + 1)..n {
                    sum -= l[[k, i]] * x[[k, col]];
                }
                x[[i, col]] = sum / l[[i, i]];
            }
        } else {
            for i in 0..n {
                let mut sum = x[[i, col]];
                for k in 0..i {
                    sum -= l[[i, k]] * x[[k, col]];
                }
                x[[i, col]] = sum / l[[i, i]];
            }
        }
    }
    x
}

/// Batched solve of `L @ X = B` for lower-triangular `L`; with
/// `transpose` solves `L.T @ X = B` instead.
pub fn triangular_solve(b: &ArrayD<f64>, l: &ArrayD<f64>, transpose: bool) -> Result<ArrayD<f64>> {
    let (n, n2) = matrix_dims(l)?;
    let (bn, m) = matrix_dims(b)?;
    if n != n2 || bn != n {
        return Err(FactorError::shape(
            format!("[.., {}, {}] and [.., {}, _]", n, n, n),
            format!("{:?} and {:?}", l.shape(), b.shape()),
        ));
    }
    map_pairs(l, b, (n, m), |l, b| Ok(solve_lower_single(l, b, transpose)))
}

/// Inverse of a lower-triangular matrix.
pub fn triangular_inv(l: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let (n, _) = matrix_dims(l)?;
    let identity = eye(matrix_batch(l), n)?;
    triangular_solve(&identity, l, false)
}

/// `(L @ L.T)^-1` from its Cholesky factor.
pub fn cholesky_inverse(l: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let inv = triangular_inv(l)?;
    mtm(&inv)
}

/// Solve `(L @ L.T) x = v` for vectors `v` given the Cholesky factor `L`.
pub fn cholesky_solve_vec(v: &ArrayD<f64>, l: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let col = v.view().insert_axis(Axis(v.ndim())).to_owned();
    let y = triangular_solve(&col, l, false)?;
    let x = triangular_solve(&y, l, true)?;
    let last = x.ndim() - 1;
    Ok(x.index_axis(Axis(last), 0).to_owned())
}

/// `sum(log(diag(L)))` over the trailing two axes.
pub fn log_det_tri(l: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let (n, _) = matrix_dims(l)?;
    let batch = matrix_batch(l).to_vec();
    let l3 = to_batches(l, &batch, n, n)?;
    let values: Vec<f64> = l3
        .outer_iter()
        .map(|m| (0..n).map(|i| m[[i, i]].ln()).sum())
        .collect();
    ArrayD::from_shape_vec(IxDyn(&batch), values).map_err(|e| FactorError::Precondition(e.to_string()))
}
