//! Dense linear-algebra primitives over `ndarray` arrays.
//!
//! - **batched**: broadcasting matmul, Cholesky, triangular solves
//! - **block**: zero-filling block builders for vectors and matrices

mod batched;
mod block;

pub use batched::{
    cat, cholesky, cholesky_inverse, cholesky_solve_vec, expand, eye, log_det_tri, matmul, mmt,
    mtm, mv, norm2, reshape, select, transpose, triangular_inv, triangular_solve, vm,
};
pub use block::{BlockMatrix, BlockVector};
