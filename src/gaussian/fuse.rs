use tracing::trace;

use super::{align_gaussian, Gaussian, GaussianParams};
use crate::domain::{merge_inputs, Inputs};
use crate::error::Result;
use crate::linalg::{cat, mmt, mv};
use crate::term::Term;

/// `l + r` for two Gaussians.
///
/// Factors of the same sign are fused by stacking their square roots side
/// by side, which the constructor then compresses. Factors of opposite
/// sign are combined in information form.
pub(crate) fn add_gaussians(l: &Gaussian, r: &Gaussian) -> Result<Term> {
    let mut inputs: Inputs = l.inputs().clone();
    merge_inputs(&mut inputs, r.inputs())?;
    let (white_l, prec_l) = align_gaussian(&inputs, l, true)?;
    let (white_r, prec_r) = align_gaussian(&inputs, r, true)?;

    if l.negate() == r.negate() {
        trace!(rank_l = l.rank(), rank_r = r.rank(), "stacking gaussians");
        let white_vec = cat(&[white_l, white_r], 1)?;
        let prec_sqrt = cat(&[prec_l, prec_r], 1)?;
        return Term::gaussian(
            GaussianParams::Srif {
                white_vec,
                prec_sqrt,
            },
            inputs,
            l.negate(),
        );
    }

    trace!("combining gaussians of opposite sign");
    let info_l = mv(&prec_l, &white_l)?;
    let info_r = mv(&prec_r, &white_r)?;
    let precision_l = mmt(&prec_l)?;
    let precision_r = mmt(&prec_r)?;
    // the concave side minus the convex side
    let (info_vec, precision) = if r.negate() {
        (info_l - info_r, precision_l - precision_r)
    } else {
        (info_r - info_l, precision_r - precision_l)
    };
    Term::gaussian(GaussianParams::Info { info_vec, precision }, inputs, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{inputs, Domain};
    use ndarray::array;

    fn scalar(t: &Term) -> f64 {
        t.as_tensor().map(|t| t.data()[[]]).or(t.as_number()).unwrap()
    }

    fn unit(name: &str, mean: f64, precision: f64) -> Term {
        Term::gaussian(
            GaussianParams::MeanPrecision {
                mean: array![mean].into_dyn(),
                precision: array![[precision]].into_dyn(),
            },
            inputs([(name, Domain::real())]),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_same_variable_fusion() {
        let a = unit("x", 0.0, 1.0);
        let b = unit("x", 2.0, 1.0);
        let s = a.add(&b).unwrap();
        for x in [-1.0, 0.5, 3.0] {
            let lhs = s.subs([("x", Term::number(x))]).unwrap();
            let expected = -0.5 * x * x - 0.5 * (x - 2.0) * (x - 2.0);
            assert!((scalar(&lhs) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_disjoint_fusion() {
        let s = unit("x", 1.0, 2.0).add(&unit("y", -1.0, 0.5)).unwrap();
        let g = s.as_gaussian().unwrap();
        assert_eq!(g.dim(), 2);
        assert_eq!(g.rank(), 2);
    }

    #[test]
    fn test_opposite_signs() {
        let a = unit("x", 0.0, 3.0);
        let b = unit("x", 0.0, 1.0).neg().unwrap();
        let s = a.add(&b).unwrap();
        let g = s.as_gaussian().unwrap();
        assert!(!g.negate());
        assert!((g.precision().unwrap()[[0, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_opposite_signs_convex_result_rejected() {
        let a = unit("x", 0.0, 1.0);
        let b = unit("x", 0.0, 3.0).neg().unwrap();
        assert!(a.add(&b).is_err());
    }
}
