use std::collections::BTreeSet;
use std::f64::consts::PI;

use ndarray::ArrayD;
use tracing::debug;

use super::{Gaussian, GaussianParams};
use crate::domain::{batch_shape, int_inputs, real_offsets, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::{cholesky, log_det_tri, matmul, mmt, mtm, reshape, select, triangular_solve, vm};
use crate::ops::AssocOp;
use crate::term::{Tensor, Term};

/// Eager reductions of a Gaussian; `None` defers to a lazy node.
pub(crate) fn eager_reduce(
    g: &Gaussian,
    op: AssocOp,
    vars: &BTreeSet<String>,
) -> Result<Option<Term>> {
    match op {
        AssocOp::LogAddExp => marginalize(g, vars),
        AssocOp::Add => fuse_plates(g, vars).map(Some),
        _ => Ok(None),
    }
}

/// Integrate out real inputs.
///
/// With `x = [xa xb]` and `xb` integrated out, the result is the log
/// normalizer of the conditional over `xb` plus a Gaussian over `xa`
/// obtained by projecting out the directions `Pb` explains. Only the two
/// cases arising from proper priors are handled: `rank == dim(b)`, where
/// the Gaussian over `xa` is degenerate and dropped, and
/// `rank == dim(a) + dim(b)`.
fn marginalize(g: &Gaussian, vars: &BTreeSet<String>) -> Result<Option<Term>> {
    let reduced_reals: BTreeSet<&str> = g
        .inputs()
        .iter()
        .filter(|(k, d)| d.is_real() && vars.contains(*k))
        .map(|(k, _)| k.as_str())
        .collect();
    if reduced_reals.is_empty() {
        return Ok(None);
    }
    if g.negate() {
        return Err(FactorError::NotNormalizable {
            rank: g.rank(),
            dim: g.dim(),
            negate: true,
        });
    }
    let reduced_ints: BTreeSet<String> = vars
        .iter()
        .filter(|v| !reduced_reals.contains(v.as_str()))
        .cloned()
        .collect();

    // Row indices of each side; the two sets may interleave.
    let (offsets, _) = real_offsets(g.inputs());
    let mut a = Vec::new();
    let mut b = Vec::new();
    for (k, &offset) in &offsets {
        let size = g.inputs()[k].num_elements();
        let rows = offset..offset + size;
        if reduced_reals.contains(k.as_str()) {
            b.extend(rows);
        } else {
            a.extend(rows);
        }
    }
    let (dim_a, dim_b, rank) = (a.len(), b.len(), g.rank());
    if rank < dim_b {
        return Err(FactorError::InsufficientRank {
            vars: reduced_reals.iter().map(|s| s.to_string()).collect(),
            rank,
            dim: dim_b,
        });
    }

    if dim_a == 0 {
        debug!(vars = ?reduced_reals, "integrated out every real input");
        let result = Term::from_tensor(g.log_normalizer()?);
        return result.reduce_vars(AssocOp::LogAddExp, reduced_ints).map(Some);
    }

    let inputs: Inputs = g
        .inputs()
        .iter()
        .filter(|(k, _)| !reduced_reals.contains(k.as_str()))
        .map(|(k, d)| (k.clone(), d.clone()))
        .collect();
    let ints = int_inputs(&inputs);
    let prec_a = select(g.prec_sqrt(), 2, &a);
    let prec_b = select(g.prec_sqrt(), 2, &b);

    let chol_b = cholesky(&mmt(&prec_b)?)?;
    let log_norm_b = log_det_tri(&chol_b)?
        .mapv(|ld| dim_b as f64 * (2.0 * PI).ln() / 2.0 - ld);
    let log_norm_b = Term::from_tensor(Tensor::new(log_norm_b, ints)?);

    let result = if rank == dim_b {
        debug!(dim_a, dim_b, "marginal is degenerate");
        log_norm_b
    } else if rank == dim_a + dim_b {
        debug!(dim_a, dim_b, "projecting onto remaining inputs");
        let proj_b = mtm(&triangular_solve(&prec_b, &chol_b, false)?)?;
        let prec_sqrt = &prec_a - &matmul(&prec_a, &proj_b)?;
        let white_vec = g.white_vec() - &vm(g.white_vec(), &proj_b)?;
        let marginal = Term::gaussian(
            GaussianParams::Srif {
                white_vec,
                prec_sqrt,
            },
            inputs,
            false,
        )?;
        log_norm_b.add(&marginal)?
    } else {
        return Err(FactorError::NotImplemented(format!(
            "marginalizing with rank {}, marginalized dim {}, remaining dim {}",
            rank, dim_b, dim_a
        )));
    };
    result.reduce_vars(AssocOp::LogAddExp, reduced_ints).map(Some)
}

/// Sum independent copies along integer axes: the reduced batch axes
/// become extra rank columns.
fn fuse_plates(g: &Gaussian, vars: &BTreeSet<String>) -> Result<Term> {
    let mut inputs = Inputs::new();
    let mut kept = Vec::new();
    let mut reduced = Vec::new();
    let mut axis = 0;
    for (k, d) in g.inputs() {
        if !vars.contains(k) {
            inputs.insert(k.clone(), d.clone());
        }
        if d.is_real() {
            if vars.contains(k) {
                return Err(FactorError::Precondition(format!(
                    "cannot sum along real input '{}'",
                    k
                )));
            }
            continue;
        }
        if vars.contains(k) {
            reduced.push(axis);
        } else {
            kept.push(axis);
        }
        axis += 1;
    }
    let n = kept.len() + reduced.len();
    let kept_shape = batch_shape(&int_inputs(&inputs));
    let (rank, dim) = (g.rank(), g.dim());
    let copies: usize = reduced
        .iter()
        .map(|&ax| g.white_vec().shape()[ax])
        .product();

    let white_perm: Vec<usize> = kept.iter().chain(&reduced).copied().chain([n]).collect();
    let white_vec = permute(g.white_vec(), white_perm);
    let mut shape = kept_shape.clone();
    shape.push(copies * rank);
    let white_vec = reshape(&white_vec, &shape)?;

    let prec_perm: Vec<usize> = kept
        .iter()
        .copied()
        .chain([n])
        .chain(reduced.iter().copied())
        .chain([n + 1])
        .collect();
    let prec_sqrt = permute(g.prec_sqrt(), prec_perm);
    let mut shape = kept_shape;
    shape.extend([dim, copies * rank]);
    let prec_sqrt = reshape(&prec_sqrt, &shape)?;

    Term::gaussian(
        GaussianParams::Srif {
            white_vec,
            prec_sqrt,
        },
        inputs,
        g.negate(),
    )
}

fn permute(a: &ArrayD<f64>, perm: Vec<usize>) -> ArrayD<f64> {
    a.view().permuted_axes(perm).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{inputs, Domain};
    use crate::error::ErrorKind;
    use ndarray::array;

    fn scalar(t: &Term) -> f64 {
        t.as_tensor().map(|t| t.data()[[]]).or(t.as_number()).unwrap()
    }

    #[test]
    fn test_marginalize_unit_gaussian() {
        let g = Term::gaussian(
            GaussianParams::Info {
                info_vec: array![0.0].into_dyn(),
                precision: array![[1.0]].into_dyn(),
            },
            inputs([("x", Domain::real())]),
            false,
        )
        .unwrap();
        let r = g.reduce(AssocOp::LogAddExp, &["x"]).unwrap();
        assert!((scalar(&r) - 0.5 * (2.0 * PI).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_marginalize_one_of_two() {
        // independent x ~ N(1, 1/4), y ~ N(0, 1)
        let g = Term::gaussian(
            GaussianParams::MeanPrecision {
                mean: array![1.0, 0.0].into_dyn(),
                precision: array![[4.0, 0.0], [0.0, 1.0]].into_dyn(),
            },
            inputs([("x", Domain::real()), ("y", Domain::real())]),
            false,
        )
        .unwrap();
        let r = g.reduce(AssocOp::LogAddExp, &["y"]).unwrap();
        assert_eq!(r.inputs().keys().collect::<Vec<_>>(), vec!["x"]);
        let v = r.subs([("x", Term::number(1.5))]).unwrap();
        let expected = 0.5 * (2.0 * PI).ln() - 0.5 * 4.0 * 0.25;
        assert!((scalar(&v) - expected).abs() < 1e-9);
    }

    fn rank_one_xy() -> Term {
        Term::gaussian(
            GaussianParams::Srif {
                white_vec: array![1.0].into_dyn(),
                prec_sqrt: array![[1.0], [2.0]].into_dyn(),
            },
            inputs([("x", Domain::real()), ("y", Domain::real())]),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_insufficient_rank() {
        let err = rank_one_xy().reduce_all(AssocOp::LogAddExp).unwrap_err();
        assert!(matches!(err, FactorError::InsufficientRank { rank: 1, dim: 2, .. }));
    }

    #[test]
    fn test_degenerate_marginal_is_dropped() {
        // rank == dim(y): only the normalizer of y survives
        let r = rank_one_xy().reduce(AssocOp::LogAddExp, &["y"]).unwrap();
        assert!(r.inputs().is_empty());
        let expected = 0.5 * (2.0 * PI).ln() - 2f64.ln();
        assert!((scalar(&r) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_unhandled_rank_not_implemented() {
        let g = Term::gaussian(
            GaussianParams::Srif {
                white_vec: array![0.0, 0.0].into_dyn(),
                prec_sqrt: array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]].into_dyn(),
            },
            inputs([("x", Domain::reals(&[2])), ("y", Domain::real())]),
            false,
        )
        .unwrap();
        let err = g.reduce(AssocOp::LogAddExp, &["y"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
    }

    #[test]
    fn test_negated_not_marginalizable() {
        let g = rank_one_xy().neg().unwrap();
        let err = g.reduce(AssocOp::LogAddExp, &["y"]).unwrap_err();
        assert!(matches!(err, FactorError::NotNormalizable { negate: true, .. }));
    }

    #[test]
    fn test_reduce_real_under_add_fails() {
        let g = Term::gaussian(
            GaussianParams::Info {
                info_vec: array![0.0].into_dyn(),
                precision: array![[1.0]].into_dyn(),
            },
            inputs([("x", Domain::real())]),
            false,
        )
        .unwrap();
        let err = g.reduce(AssocOp::Add, &["x"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_plate_fusion_matches_sum() {
        let g = Term::gaussian(
            GaussianParams::Srif {
                white_vec: array![[1.0], [2.0], [-1.0]].into_dyn(),
                prec_sqrt: array![[[1.0]], [[2.0]], [[0.5]]].into_dyn(),
            },
            inputs([("i", Domain::bint(3)), ("x", Domain::real())]),
            false,
        )
        .unwrap();
        let fused = g.reduce(AssocOp::Add, &["i"]).unwrap();
        assert!(!fused.inputs().contains_key("i"));
        let x = 0.3;
        let expected: f64 = [(1.0, 1.0), (2.0, 2.0), (0.5, -1.0)]
            .iter()
            .map(|(p, w)| -0.5 * (x * p - w) * (x * p - w))
            .sum();
        let v = fused.subs([("x", Term::number(x))]).unwrap();
        assert!((scalar(&v) - expected).abs() < 1e-9);
    }
}
