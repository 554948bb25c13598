use std::collections::BTreeSet;
use std::f64::consts::PI;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use rand::Rng;
use tracing::debug;

use super::Gaussian;
use crate::domain::{batch_shape, real_offsets, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::{reshape, triangular_solve};
use crate::ops::AssocOp;
use crate::term::{Delta, Tensor, Term};

/// Standard normal draws by the Box-Muller transform.
fn standard_normal<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f64> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        let u1 = 1.0 - rng.random::<f64>();
        let u2 = rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    })
}

/// Draw every real input of a normalizable Gaussian.
///
/// The result is a sum of point masses at the draws plus the log
/// normalizer, batched over `sample_inputs` and the integer inputs.
pub(crate) fn sample<R: Rng + ?Sized>(
    g: &Gaussian,
    vars: &BTreeSet<String>,
    sample_inputs: &Inputs,
    rng: &mut R,
) -> Result<Term> {
    g.require_normalizable()?;
    if let Some(v) = vars.iter().find(|v| g.inputs().get(*v).is_some_and(|d| d.is_int())) {
        return Err(FactorError::NotImplemented(format!(
            "sampling integer input '{}' of a gaussian mixture; normalize first",
            v
        )));
    }
    let reals: Vec<&String> = g
        .inputs()
        .iter()
        .filter(|(_, d)| d.is_real())
        .map(|(k, _)| k)
        .collect();
    if reals.iter().any(|k| !vars.contains(*k)) {
        return Err(FactorError::NotImplemented(format!(
            "sampling a subset {:?} of the real inputs {:?}",
            vars, reals
        )));
    }

    let mut inputs: Inputs = sample_inputs
        .iter()
        .filter(|(k, _)| !g.inputs().contains_key(*k))
        .map(|(k, d)| (k.clone(), d.clone()))
        .collect();
    let sample_shape = batch_shape(&inputs);
    for (k, d) in g.inputs() {
        if d.is_int() {
            inputs.insert(k.clone(), d.clone());
        }
    }

    let mut shape = sample_shape.clone();
    shape.extend_from_slice(g.white_vec().shape());
    let noise = standard_normal(&shape, rng);
    let noise = noise.insert_axis(Axis(shape.len()));
    let offset = triangular_solve(&noise, g.precision_chol()?, true)?;
    let last = offset.ndim() - 1;
    let draws = &offset.index_axis(Axis(last), 0) + g.mean()?;
    debug!(vars = ?reals, sample_shape = ?sample_shape, "sampled gaussian");

    let (offsets, _) = real_offsets(g.inputs());
    let batch_rank = shape.len() - 1;
    let mut terms = Vec::with_capacity(reals.len() + 1);
    for name in reals {
        let domain = &g.inputs()[name];
        let start = offsets[name];
        let slice = draws
            .slice_axis(Axis(batch_rank), Slice::from(start..start + domain.num_elements()))
            .to_owned();
        let mut point_shape = shape[..batch_rank].to_vec();
        point_shape.extend_from_slice(domain.shape());
        let point = Tensor::new(reshape(&slice, &point_shape)?, inputs.clone())?;
        terms.push(Term::from_delta(Delta::new(name, point)?));
    }
    terms.push(Term::from_tensor(g.log_normalizer()?));
    Term::contraction(AssocOp::Null, AssocOp::Add, BTreeSet::new(), terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{inputs, Domain};
    use crate::gaussian::GaussianParams;
    use crate::error::ErrorKind;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn prior() -> Term {
        Term::gaussian(
            GaussianParams::MeanCovariance {
                mean: array![[1.0, -1.0], [3.0, 0.0]].into_dyn(),
                covariance: array![[[1.0, 0.0], [0.0, 4.0]], [[0.25, 0.0], [0.0, 1.0]]].into_dyn(),
            },
            inputs([
                ("i", Domain::bint(2)),
                ("x", Domain::real()),
                ("y", Domain::real()),
            ]),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let s = prior()
            .sample(&["x", "y"], &inputs([("n", Domain::bint(5))]), &mut rng)
            .unwrap();
        let c = s.as_contraction().unwrap();
        assert_eq!(c.terms().len(), 3);
        let delta = c.terms().iter().find_map(|t| t.as_delta()).unwrap();
        assert_eq!(delta.point().data().shape(), &[5, 2]);
        assert!(s.inputs().contains_key("n") && s.inputs().contains_key("x"));
    }

    #[test]
    fn test_sample_moments() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 4000;
        let s = prior()
            .sample(&["x", "y"], &inputs([("n", Domain::bint(n))]), &mut rng)
            .unwrap();
        let c = s.as_contraction().unwrap();
        let x = c
            .terms()
            .iter()
            .filter_map(|t| t.as_delta())
            .find(|d| d.name() == "x")
            .unwrap();
        let data = x.point().data();
        let mean_0 = data.index_axis(Axis(1), 0).mean().unwrap();
        let mean_1 = data.index_axis(Axis(1), 1).mean().unwrap();
        assert!((mean_0 - 1.0).abs() < 0.1);
        assert!((mean_1 - 3.0).abs() < 0.05);
    }

    #[test]
    fn test_partial_sample_not_implemented() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = prior().sample(&["x"], &Inputs::new(), &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        let err = prior().sample(&["i", "x", "y"], &Inputs::new(), &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
    }
}
