//! Gaussian factors in square-root information form.
//!
//! A [`Gaussian`] is the log density
//!
//! ```text
//! f(x) = -1/2 || x @ prec_sqrt - white_vec ||^2
//! ```
//!
//! (negated when `negate` is set), where `x` concatenates all real inputs
//! in input order and the integer inputs index a batch of such factors.
//! Factors are canonicalized to evaluate to zero at their maximum, so a
//! rank-deficient `prec_sqrt` is allowed; only full-rank, non-negated
//! factors are normalizable.
//!
//! # Architecture
//!
//! - **align**: embedding into a different or larger input schema
//! - **subs**: substitution by category (rename, integer, real, affine)
//! - **reduce**: marginalization and plate fusion
//! - **fuse**: sums of two Gaussians
//! - **sample**: drawing the real inputs

mod align;
mod fuse;
mod reduce;
mod sample;
mod subs;

use std::cell::OnceCell;
use std::f64::consts::PI;
use std::rc::Rc;

use ndarray::{ArrayD, Axis};
use tracing::debug;

pub use align::align_gaussian;
pub(crate) use fuse::add_gaussians;
pub(crate) use reduce::eager_reduce;
pub(crate) use sample::sample;
pub(crate) use subs::eager_subs;

use crate::domain::{batch_shape, int_inputs, real_offsets, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::{
    cholesky, cholesky_inverse, cholesky_solve_vec, log_det_tri, mmt, mv, norm2, transpose,
    triangular_inv, triangular_solve, vm,
};
use crate::term::Tensor;

/// Ways to specify a Gaussian. Every array is batched over the integer
/// inputs; vectors have length `dim` (or `rank` for `white_vec`).
#[derive(Clone, Debug)]
pub enum GaussianParams {
    /// Square-root information form, `prec_sqrt` of shape `(dim, rank)`.
    Srif {
        white_vec: ArrayD<f64>,
        prec_sqrt: ArrayD<f64>,
    },
    /// Information form: `info_vec = precision @ mean`.
    Info {
        info_vec: ArrayD<f64>,
        precision: ArrayD<f64>,
    },
    MeanPrecision {
        mean: ArrayD<f64>,
        precision: ArrayD<f64>,
    },
    MeanScaleTril {
        mean: ArrayD<f64>,
        scale_tril: ArrayD<f64>,
    },
    MeanCovariance {
        mean: ArrayD<f64>,
        covariance: ArrayD<f64>,
    },
}

/// Memoized quantities derived from `(white_vec, prec_sqrt)`; shared by
/// every factor that reuses the same arrays.
#[derive(Debug, Default)]
struct Cache {
    precision: OnceCell<Result<ArrayD<f64>>>,
    precision_chol: OnceCell<Result<ArrayD<f64>>>,
    covariance: OnceCell<Result<ArrayD<f64>>>,
    scale_tril: OnceCell<Result<ArrayD<f64>>>,
    info_vec: OnceCell<Result<ArrayD<f64>>>,
    mean: OnceCell<Result<ArrayD<f64>>>,
    log_normalizer: OnceCell<Result<ArrayD<f64>>>,
}

fn cached(
    cell: &OnceCell<Result<ArrayD<f64>>>,
    init: impl FnOnce() -> Result<ArrayD<f64>>,
) -> Result<&ArrayD<f64>> {
    cell.get_or_init(init).as_ref().map_err(Clone::clone)
}

/// Solve `l @ x = v` for a batch of vectors.
pub(crate) fn solve_lower_vec(v: &ArrayD<f64>, l: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let col = v.view().insert_axis(Axis(v.ndim())).to_owned();
    let x = triangular_solve(&col, l, false)?;
    let last = x.ndim() - 1;
    Ok(x.index_axis(Axis(last), 0).to_owned())
}

/// A batch of Gaussian log densities over the real inputs.
#[derive(Clone, Debug)]
pub struct Gaussian {
    white_vec: Rc<ArrayD<f64>>,
    prec_sqrt: Rc<ArrayD<f64>>,
    inputs: Inputs,
    negate: bool,
    cache: Rc<Cache>,
}

impl PartialEq for Gaussian {
    fn eq(&self, other: &Self) -> bool {
        self.negate == other.negate
            && self.inputs.iter().eq(other.inputs.iter())
            && self.white_vec == other.white_vec
            && self.prec_sqrt == other.prec_sqrt
    }
}

impl Gaussian {
    /// Checked constructor for already compressed parameters
    /// (`rank <= dim`).
    pub fn new(
        white_vec: ArrayD<f64>,
        prec_sqrt: ArrayD<f64>,
        inputs: Inputs,
        negate: bool,
    ) -> Result<Self> {
        let (_, dim) = real_offsets(&inputs);
        if dim == 0 {
            return Err(FactorError::Precondition(
                "a gaussian needs at least one real input".into(),
            ));
        }
        let batch = batch_shape(&inputs);
        let nb = batch.len();
        if prec_sqrt.ndim() != nb + 2
            || prec_sqrt.shape()[..nb] != batch[..]
            || prec_sqrt.shape()[nb] != dim
        {
            return Err(FactorError::shape(
                format!("{:?} + [{}, rank]", batch, dim),
                format!("{:?}", prec_sqrt.shape()),
            ));
        }
        let rank = prec_sqrt.shape()[nb + 1];
        let mut white_shape = batch.clone();
        white_shape.push(rank);
        if white_vec.shape() != white_shape.as_slice() {
            return Err(FactorError::shape(
                format!("{:?}", white_shape),
                format!("{:?}", white_vec.shape()),
            ));
        }
        if rank > dim {
            return Err(FactorError::Precondition(format!(
                "rank {} exceeds dim {}; use Gaussian::compressed",
                rank, dim
            )));
        }
        Ok(Self {
            white_vec: Rc::new(white_vec),
            prec_sqrt: Rc::new(prec_sqrt),
            inputs,
            negate,
            cache: Rc::default(),
        })
    }

    /// Smart constructor accepting wide parameters (`rank > dim`).
    ///
    /// Wide parameters are replaced by `prec_sqrt = chol(P @ P.T)` and the
    /// matching white vector. The compressed factor differs from the wide
    /// one by a constant over the integer inputs, returned alongside.
    pub fn compressed(
        white_vec: ArrayD<f64>,
        prec_sqrt: ArrayD<f64>,
        inputs: Inputs,
        negate: bool,
    ) -> Result<(Self, Option<Tensor>)> {
        if prec_sqrt.ndim() < 2 {
            return Err(FactorError::shape("matrix", format!("{:?}", prec_sqrt.shape())));
        }
        let nd = prec_sqrt.ndim();
        let (dim, rank) = (prec_sqrt.shape()[nd - 2], prec_sqrt.shape()[nd - 1]);
        if rank <= dim {
            return Ok((Gaussian::new(white_vec, prec_sqrt, inputs, negate)?, None));
        }

        let old_norm2 = norm2(&white_vec);
        let info_vec = mv(&prec_sqrt, &white_vec)?;
        let prec_sqrt = cholesky(&mmt(&prec_sqrt)?)?;
        let white_vec = solve_lower_vec(&info_vec, &prec_sqrt)?;
        let mut shift = (norm2(&white_vec) - old_norm2) * 0.5;
        if negate {
            shift = -shift;
        }
        debug!(dim, rank, "compressed wide gaussian");

        let shift = Tensor::new(shift, int_inputs(&inputs))?;
        let gaussian = Gaussian::new(white_vec, prec_sqrt, inputs, negate)?;
        Ok((gaussian, Some(shift)))
    }

    /// Convert any parametrization, then compress.
    pub fn from_params(
        params: GaussianParams,
        inputs: Inputs,
        negate: bool,
    ) -> Result<(Self, Option<Tensor>)> {
        let (white_vec, prec_sqrt) = match params {
            GaussianParams::Srif {
                white_vec,
                prec_sqrt,
            } => (white_vec, prec_sqrt),
            GaussianParams::Info {
                info_vec,
                precision,
            } => {
                let prec_sqrt = cholesky(&precision)?;
                (solve_lower_vec(&info_vec, &prec_sqrt)?, prec_sqrt)
            }
            GaussianParams::MeanPrecision { mean, precision } => {
                let prec_sqrt = cholesky(&precision)?;
                (vm(&mean, &prec_sqrt)?, prec_sqrt)
            }
            GaussianParams::MeanScaleTril { mean, scale_tril } => {
                let prec_sqrt = transpose(&triangular_inv(&scale_tril)?);
                (vm(&mean, &prec_sqrt)?, prec_sqrt)
            }
            GaussianParams::MeanCovariance { mean, covariance } => {
                let prec_sqrt = transpose(&triangular_inv(&cholesky(&covariance)?)?);
                (vm(&mean, &prec_sqrt)?, prec_sqrt)
            }
        };
        Gaussian::compressed(white_vec, prec_sqrt, inputs, negate)
    }

    /// Same arrays under new input names (a rename).
    pub(crate) fn renamed(&self, inputs: Inputs) -> Gaussian {
        Gaussian {
            inputs,
            ..self.clone()
        }
    }

    /// The negated factor; arrays and derived quantities are shared.
    pub fn negated(&self) -> Gaussian {
        Gaussian {
            negate: !self.negate,
            ..self.clone()
        }
    }

    pub fn white_vec(&self) -> &ArrayD<f64> {
        &self.white_vec
    }

    pub fn prec_sqrt(&self) -> &ArrayD<f64> {
        &self.prec_sqrt
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn negate(&self) -> bool {
        self.negate
    }

    pub fn batch_shape(&self) -> Vec<usize> {
        batch_shape(&self.inputs)
    }

    /// Total size of the real inputs.
    pub fn dim(&self) -> usize {
        self.prec_sqrt.shape()[self.prec_sqrt.ndim() - 2]
    }

    pub fn rank(&self) -> usize {
        self.prec_sqrt.shape()[self.prec_sqrt.ndim() - 1]
    }

    pub fn is_full_rank(&self) -> bool {
        self.rank() == self.dim()
    }

    pub fn is_normalizable(&self) -> bool {
        self.is_full_rank() && !self.negate
    }

    fn require_full_rank(&self) -> Result<()> {
        if self.is_full_rank() {
            Ok(())
        } else {
            Err(FactorError::NotNormalizable {
                rank: self.rank(),
                dim: self.dim(),
                negate: self.negate,
            })
        }
    }

    pub(crate) fn require_normalizable(&self) -> Result<()> {
        if self.is_normalizable() {
            Ok(())
        } else {
            Err(FactorError::NotNormalizable {
                rank: self.rank(),
                dim: self.dim(),
                negate: self.negate,
            })
        }
    }

    // ------------------------------------------------------------------
    // Derived quantities
    // ------------------------------------------------------------------

    /// `prec_sqrt @ prec_sqrt.T`
    pub fn precision(&self) -> Result<&ArrayD<f64>> {
        cached(&self.cache.precision, || mmt(&self.prec_sqrt))
    }

    pub fn precision_chol(&self) -> Result<&ArrayD<f64>> {
        self.require_full_rank()?;
        cached(&self.cache.precision_chol, || cholesky(self.precision()?))
    }

    pub fn covariance(&self) -> Result<&ArrayD<f64>> {
        cached(&self.cache.covariance, || {
            cholesky_inverse(self.precision_chol()?)
        })
    }

    pub fn scale_tril(&self) -> Result<&ArrayD<f64>> {
        cached(&self.cache.scale_tril, || cholesky(self.covariance()?))
    }

    /// `prec_sqrt @ white_vec`
    pub fn info_vec(&self) -> Result<&ArrayD<f64>> {
        cached(&self.cache.info_vec, || mv(&self.prec_sqrt, &self.white_vec))
    }

    /// The maximizer `precision^-1 @ info_vec`.
    pub fn mean(&self) -> Result<&ArrayD<f64>> {
        cached(&self.cache.mean, || {
            cholesky_solve_vec(self.info_vec()?, self.precision_chol()?)
        })
    }

    fn log_normalizer_data(&self) -> Result<&ArrayD<f64>> {
        cached(&self.cache.log_normalizer, || {
            let dim = self.dim() as f64;
            let log_det = log_det_tri(self.precision_chol()?)?;
            Ok(log_det.mapv(|ld| 0.5 * dim * (2.0 * PI).ln() - ld))
        })
    }

    /// `log` of the integral over all real inputs, per batch entry.
    pub fn log_normalizer(&self) -> Result<Tensor> {
        Tensor::new(self.log_normalizer_data()?.clone(), int_inputs(&self.inputs))
    }

    /// Reorder inputs so that `names` come first.
    pub fn align(&self, names: &[&str]) -> Result<Gaussian> {
        let mut inputs = Inputs::new();
        for name in names {
            let domain = self.inputs.get(*name).ok_or_else(|| {
                FactorError::Precondition(format!("cannot align to unknown input '{}'", name))
            })?;
            inputs.insert(name.to_string(), domain.clone());
        }
        for (k, d) in &self.inputs {
            if !inputs.contains_key(k) {
                inputs.insert(k.clone(), d.clone());
            }
        }
        if inputs.keys().eq(self.inputs.keys()) {
            return Ok(self.clone());
        }
        let (white_vec, prec_sqrt) = align_gaussian(&inputs, self, false)?;
        Gaussian::new(white_vec, prec_sqrt, inputs, self.negate)
    }
}
