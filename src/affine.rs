//! Affine expressions of real variables.
//!
//! An expression is affine when it is built from constants and variables
//! by sums, negation, and products in which at most one factor depends on
//! a real variable. Such expressions can be substituted into a Gaussian in
//! closed form once their constant and linear coefficients are known.

use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, IxDyn};

use crate::domain::{batch_shape, real_inputs, Domain};
use crate::error::{FactorError, Result};
use crate::linalg::reshape;
use crate::ops::{AssocOp, UnaryOp};
use crate::term::{align_tensors, Tensor, Term, TermKind};

/// `value = constant + sum_k x_k @ coeffs[k]`.
///
/// Each coefficient maps the domain of input `x_k` into the output domain;
/// its data has shape `batch + input shape + output shape`.
#[derive(Clone, Debug)]
pub struct Affine {
    pub constant: Tensor,
    pub coeffs: IndexMap<String, (Domain, Tensor)>,
}

fn depends_on_reals(term: &Term) -> bool {
    term.inputs().values().any(Domain::is_real)
}

/// Structural check; does not evaluate anything.
pub fn is_affine(term: &Term) -> bool {
    match term.kind() {
        TermKind::Number(_) | TermKind::Tensor(_) | TermKind::Variable(_) => true,
        TermKind::Unary {
            op: UnaryOp::Neg,
            arg,
        } => is_affine(arg),
        TermKind::Contraction(c) => {
            let reduces_ints_only = c.red_op().is_null()
                || (c.red_op() == AssocOp::Add
                    && c.reduced_vars().iter().all(|v| {
                        c.terms()
                            .iter()
                            .filter_map(|t| t.inputs().get(v))
                            .all(Domain::is_int)
                    }));
            let terms_affine = c.terms().iter().all(is_affine);
            reduces_ints_only
                && terms_affine
                && match c.bin_op() {
                    AssocOp::Add | AssocOp::Null => true,
                    AssocOp::Mul => c.terms().iter().filter(|t| depends_on_reals(t)).count() <= 1,
                    _ => false,
                }
        }
        _ => false,
    }
}

fn zeros(domain: &Domain) -> Result<Term> {
    Term::tensor(ArrayD::zeros(IxDyn(domain.shape())), Default::default())
}

fn unit(domain: &Domain, index: usize) -> Result<Term> {
    let mut data = vec![0.0; domain.num_elements()];
    data[index] = 1.0;
    let data = ArrayD::from_shape_vec(IxDyn(domain.shape()), data)
        .map_err(|e| FactorError::Precondition(e.to_string()))?;
    Term::tensor(data, Default::default())
}

/// Recover the affine form of `term` by evaluating it at zero and at unit
/// vectors. Returns `None` when some probe does not evaluate to a tensor.
pub fn extract_affine(term: &Term) -> Result<Option<Affine>> {
    let reals = real_inputs(term.inputs());
    let zero_subs = reals
        .iter()
        .map(|(k, d)| Ok((k.clone(), zeros(d)?)))
        .collect::<Result<Vec<_>>>()?;
    let Some(constant) = term.substitute(zero_subs.clone())?.to_tensor() else {
        return Ok(None);
    };
    let neg_constant = constant.unary(UnaryOp::Neg);

    let mut coeffs = IndexMap::new();
    for (name, domain) in &reals {
        let mut columns = Vec::with_capacity(domain.num_elements());
        for j in 0..domain.num_elements() {
            let mut subs = zero_subs.clone();
            for (k, v) in subs.iter_mut() {
                if k == name {
                    *v = unit(domain, j)?;
                }
            }
            let Some(probe) = term.substitute(subs)?.to_tensor() else {
                return Ok(None);
            };
            columns.push(Tensor::binary(AssocOp::Add, &probe, &neg_constant)?);
        }
        let refs: Vec<&Tensor> = columns.iter().collect();
        let (ints, arrays) = align_tensors(&refs, true)?;
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        let stacked = ndarray::stack(Axis(ints.len()), &views)
            .map_err(|e| FactorError::Precondition(e.to_string()))?;

        let mut output_shape = domain.shape().to_vec();
        output_shape.extend_from_slice(constant.output().shape());
        let mut shape = batch_shape(&ints);
        shape.extend_from_slice(&output_shape);
        let data = reshape(&stacked, &shape)?;
        let coeff = Tensor::with_output(data, ints, Domain::Real(output_shape))?;
        coeffs.insert(name.clone(), (domain.clone(), coeff));
    }
    Ok(Some(Affine { constant, coeffs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::inputs;
    use ndarray::array;

    #[test]
    fn test_is_affine() {
        let x = Term::variable("x", Domain::real());
        let y = Term::variable("y", Domain::real());
        assert!(is_affine(&x.add(&Term::number(1.0)).unwrap()));
        assert!(is_affine(&x.mul(&Term::number(3.0)).unwrap()));
        assert!(!is_affine(&x.mul(&y).unwrap()));
        assert!(!is_affine(&x.exp().unwrap()));
        assert!(is_affine(&x.sub(&y).unwrap()));
    }

    #[test]
    fn test_extract_scalar() {
        let x = Term::variable("x", Domain::real());
        let y = Term::variable("y", Domain::real());
        // 2x - y + 3
        let e = x
            .mul(&Term::number(2.0))
            .unwrap()
            .sub(&y)
            .unwrap()
            .add(&Term::number(3.0))
            .unwrap();
        let a = extract_affine(&e).unwrap().unwrap();
        assert_eq!(a.constant.data()[[]], 3.0);
        assert_eq!(a.coeffs["x"].1.data()[[]], 2.0);
        assert_eq!(a.coeffs["y"].1.data()[[]], -1.0);
    }

    #[test]
    fn test_extract_batched_vector() {
        // x[2] * t_i, with t_i a per-batch scale
        let x = Term::variable("x", Domain::reals(&[2]));
        let t = Term::tensor(array![1.0, 5.0].into_dyn(), inputs([("i", Domain::bint(2))])).unwrap();
        let e = x.mul(&t).unwrap();
        let a = extract_affine(&e).unwrap().unwrap();
        let (domain, coeff) = &a.coeffs["x"];
        assert_eq!(domain, &Domain::reals(&[2]));
        assert_eq!(coeff.output(), &Domain::reals(&[2, 2]));
        assert_eq!(coeff.data().shape(), &[2, 2, 2]);
        assert_eq!(coeff.data()[[1, 0, 0]], 5.0);
        assert_eq!(coeff.data()[[1, 0, 1]], 0.0);
        assert_eq!(coeff.data()[[1, 1, 1]], 5.0);
    }
}
