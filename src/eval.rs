//! The contraction evaluator.
//!
//! Most closed forms are binary, so an n-ary contraction is evaluated as a
//! sequence of pairwise steps:
//!
//! 1. **Push-down**: a reduced variable mentioned by exactly one term is
//!    reduced inside that term.
//! 2. **Pairwise search**: pairs `(i, j)` are tried in order, each with the
//!    reduced variables both mention and no other term does. A variable
//!    only one of them mentions stays pending on the outer node. The first
//!    pair that evaluates to something other than its own lazy form
//!    replaces the two terms, and evaluation restarts on the shorter list.
//!
//! When nothing makes progress the node stays lazy.

use std::collections::BTreeSet;

use tracing::debug;

use crate::domain::Domain;
use crate::error::Result;
use crate::gaussian::{self, add_gaussians};
use crate::ops::{AssocOp, UnaryOp};
use crate::term::{binary_output, int_value, Tensor, Term, TermKind};

/// Evaluate a normalized contraction, or `None` to keep it lazy.
pub(crate) fn contraction(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    if let [term] = terms {
        return eager_reduce(red, vars, term);
    }
    // reducing inside a term would change how often it is counted
    if red == bin {
        return Ok(None);
    }
    if let Some(result) = push_down(red, bin, vars, terms)? {
        return Ok(Some(result));
    }
    if let [lhs, rhs] = terms {
        return match eager_binary(bin, lhs, rhs)? {
            Some(result) => result.reduce_vars(red, vars.clone()).map(Some),
            None => Ok(None),
        };
    }
    pairwise(red, bin, vars, terms)
}

/// Whether `result` is just the lazy node for `operands` again.
fn is_unevaluated(result: &Term, operands: &[&Term]) -> bool {
    match result.as_contraction() {
        Some(c) => {
            c.terms().len() == operands.len()
                && c.terms().iter().all(|t| operands.iter().any(|o| o.ptr_eq(t)))
        }
        None => false,
    }
}

fn push_down(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    if red.is_null() {
        return Ok(None);
    }
    let mut remaining = vars.clone();
    let mut new_terms = terms.to_vec();
    let mut progress = false;
    for (i, term) in terms.iter().enumerate() {
        let unique: BTreeSet<String> = vars
            .iter()
            .filter(|v| term.inputs().contains_key(*v))
            .filter(|v| {
                terms
                    .iter()
                    .enumerate()
                    .all(|(j, t)| j == i || !t.inputs().contains_key(*v))
            })
            .cloned()
            .collect();
        if unique.is_empty() {
            continue;
        }
        let reduced = term.reduce_vars(red, unique.clone())?;
        if is_unevaluated(&reduced, &[term]) {
            continue;
        }
        debug!(%red, vars = ?unique, "pushed reduction into a term");
        for v in &unique {
            remaining.remove(v);
        }
        new_terms[i] = reduced;
        progress = true;
    }
    if !progress {
        return Ok(None);
    }
    Term::contraction(red, bin, remaining, new_terms).map(Some)
}

fn pairwise(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    for i in 0..terms.len() {
        for j in i + 1..terms.len() {
            let (a, b) = (&terms[i], &terms[j]);
            let pair_vars: BTreeSet<String> = vars
                .iter()
                .filter(|v| a.inputs().contains_key(*v) && b.inputs().contains_key(*v))
                .filter(|v| {
                    terms
                        .iter()
                        .enumerate()
                        .all(|(k, t)| k == i || k == j || !t.inputs().contains_key(*v))
                })
                .cloned()
                .collect();
            let pair_red = if pair_vars.is_empty() { AssocOp::Null } else { red };
            let combined =
                Term::contraction(pair_red, bin, pair_vars.clone(), vec![a.clone(), b.clone()])?;
            if is_unevaluated(&combined, &[a, b]) {
                continue;
            }
            debug!(i, j, %bin, vars = ?pair_vars, "combined a pair of terms");
            let mut rest = terms.to_vec();
            rest.remove(j);
            rest[i] = combined;
            let remaining = vars.difference(&pair_vars).cloned().collect();
            return Term::contraction(red, bin, remaining, rest).map(Some);
        }
    }
    Ok(None)
}

// ============================================================================
// Single-term reductions
// ============================================================================

fn eager_reduce(red: AssocOp, vars: &BTreeSet<String>, term: &Term) -> Result<Option<Term>> {
    match term.kind() {
        TermKind::Tensor(t) => Ok(Some(Term::from_tensor(t.reduce(red, vars)?))),
        TermKind::Gaussian(g) => gaussian::eager_reduce(g, red, vars),
        TermKind::Delta(d) if red == AssocOp::LogAddExp => {
            Ok(d.reduce_logaddexp(vars)?.map(Term::from_tensor))
        }
        _ => Ok(None),
    }
}

// ============================================================================
// Binary operations
// ============================================================================

/// Closed forms for `lhs op rhs`.
pub(crate) fn eager_binary(op: AssocOp, lhs: &Term, rhs: &Term) -> Result<Option<Term>> {
    match (lhs.kind(), rhs.kind()) {
        (TermKind::Number(x), TermKind::Number(y)) => {
            let value = op.apply(*x, *y);
            Ok(Some(match binary_output(lhs.output(), rhs.output())? {
                Domain::Bint(size) => Term::int(int_value(value, size)?, size),
                _ => Term::number(value),
            }))
        }
        (TermKind::Number(_) | TermKind::Tensor(_), TermKind::Number(_) | TermKind::Tensor(_)) => {
            match (lhs.to_tensor(), rhs.to_tensor()) {
                (Some(l), Some(r)) => Ok(Some(Term::from_tensor(Tensor::binary(op, &l, &r)?))),
                _ => Ok(None),
            }
        }
        (TermKind::Gaussian(l), TermKind::Gaussian(r)) if op == AssocOp::Add => {
            add_gaussians(l, r).map(Some)
        }
        (TermKind::Delta(d), _) if op == AssocOp::Add && rhs.inputs().contains_key(d.name()) => {
            add_delta(lhs, d.name(), d.point(), rhs)
        }
        (_, TermKind::Delta(d)) if op == AssocOp::Add && lhs.inputs().contains_key(d.name()) => {
            add_delta(rhs, d.name(), d.point(), lhs)
        }
        _ => Ok(None),
    }
}

/// `delta + other`: the point is substituted into `other`.
fn add_delta(delta: &Term, name: &str, point: &Tensor, other: &Term) -> Result<Option<Term>> {
    let value = Term::from_tensor(point.clone());
    let other = other.substitute(vec![(name.to_string(), value)])?;
    delta.add(&other).map(Some)
}

// ============================================================================
// Unary operations
// ============================================================================

pub(crate) fn unary(op: UnaryOp, arg: &Term) -> Result<Option<Term>> {
    match arg.kind() {
        TermKind::Number(x) if arg.output().is_real() => Ok(Some(Term::number(op.apply(*x)))),
        TermKind::Tensor(t) if t.output().is_real() => Ok(Some(Term::from_tensor(t.unary(op)))),
        TermKind::Gaussian(g) if op == UnaryOp::Neg => Ok(Some(Term::from_gaussian(g.negated()))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{inputs, Domain};
    use crate::gaussian::GaussianParams;
    use ndarray::array;

    fn vars(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn tensor(data: ndarray::ArrayD<f64>, names: &[(&str, usize)]) -> Term {
        let ins = inputs(names.iter().map(|(n, s)| (*n, Domain::bint(*s))));
        Term::tensor(data, ins).unwrap()
    }

    #[test]
    fn test_matrix_chain() {
        // sum_{j,k} a[i,j] b[j,k] c[k,l]
        let a = tensor(array![[1.0, 2.0], [3.0, 4.0]].into_dyn(), &[("i", 2), ("j", 2)]);
        let b = tensor(array![[1.0, 0.0], [1.0, 1.0]].into_dyn(), &[("j", 2), ("k", 2)]);
        let c = tensor(array![[2.0, 0.0], [0.0, 3.0]].into_dyn(), &[("k", 2), ("l", 2)]);
        let r = Term::contraction(AssocOp::Add, AssocOp::Mul, vars(&["j", "k"]), vec![a, b, c])
            .unwrap();
        let r = r.as_tensor().unwrap().align(&["i", "l"]).unwrap();
        // a @ b = [[3, 2], [7, 4]]
        assert_eq!(r.data(), &array![[6.0, 6.0], [14.0, 12.0]].into_dyn());
    }

    #[test]
    fn test_push_down_unique_variable() {
        // logsumexp_{i,j} (a[i] + b[j]) = logsumexp a + logsumexp b
        let a = tensor(array![0.0, 1.0].into_dyn(), &[("i", 2)]);
        let b = tensor(array![2.0, -1.0, 0.5].into_dyn(), &[("j", 3)]);
        let r = Term::contraction(AssocOp::LogAddExp, AssocOp::Add, vars(&["i", "j"]), vec![a, b])
            .unwrap();
        let lse = |xs: &[f64]| xs.iter().map(|x| x.exp()).sum::<f64>().ln();
        let expected = lse(&[0.0, 1.0]) + lse(&[2.0, -1.0, 0.5]);
        assert!((r.as_tensor().unwrap().data()[[]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_gaussian_mixture_stays_lazy() {
        let g = Term::gaussian(
            GaussianParams::Info {
                info_vec: array![[0.0], [1.0]].into_dyn(),
                precision: array![[[1.0]], [[2.0]]].into_dyn(),
            },
            inputs([("i", Domain::bint(2)), ("x", Domain::real())]),
            false,
        )
        .unwrap();
        let w = tensor(array![0.5, -0.5].into_dyn(), &[("i", 2)]);
        let m = w.add(&g).unwrap();
        let c = m.as_contraction().unwrap();
        assert!(c.is_gaussian_mixture());
        // marginalizing x resolves it
        let r = m.reduce(AssocOp::LogAddExp, &["x"]).unwrap();
        assert!(r.as_tensor().is_some());
    }

    #[test]
    fn test_delta_substitutes_into_sibling() {
        let point = Term::tensor(array![2.0].into_dyn(), Default::default()).unwrap();
        let d = Term::delta("x", point).unwrap();
        let x = Term::variable("x", Domain::reals(&[1]));
        let e = x.exp().unwrap();
        let s = d.add(&e).unwrap();
        let c = s.as_contraction().unwrap();
        assert!(c.terms()[0].as_delta().is_some());
        let t = c.terms()[1].as_tensor().unwrap();
        assert!((t.data()[[0]] - 2f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn test_int_arithmetic_keeps_domain() {
        let r = eager_binary(AssocOp::Add, &Term::int(1, 3), &Term::int(1, 3))
            .unwrap()
            .unwrap();
        assert_eq!(r.output(), &Domain::bint(3));
        assert_eq!(r.as_number(), Some(2.0));
    }

    #[test]
    fn test_int_arithmetic_out_of_range() {
        let err = Term::int(2, 3).add(&Term::int(2, 3)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
        let m = Term::int(2, 3).binary(AssocOp::Max, &Term::int(1, 3)).unwrap();
        assert_eq!(m.as_number(), Some(2.0));
    }

    fn unit_gaussian(name: &str) -> Term {
        Term::gaussian(
            GaussianParams::Info {
                info_vec: array![0.0].into_dyn(),
                precision: array![[1.0]].into_dyn(),
            },
            inputs([(name, Domain::real())]),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_pair_leaves_unshared_variable_pending() {
        // max over x has no closed form for a Gaussian, so x is mentioned by
        // one operand of the only pair that evaluates and must stay outside it
        let t = tensor(array![0.0, 1.0].into_dyn(), &[("k", 2)]);
        let r = Term::contraction(
            AssocOp::Max,
            AssocOp::Add,
            vars(&["x"]),
            vec![unit_gaussian("x"), unit_gaussian("y"), t],
        )
        .unwrap();
        let c = r.as_contraction().unwrap();
        assert_eq!((c.red_op(), c.bin_op()), (AssocOp::Max, AssocOp::Add));
        assert_eq!(c.reduced_vars(), &vars(&["x"]));
        assert_eq!(c.terms().len(), 2);
        assert!(c.terms()[0].as_tensor().is_some());
        let g = c.terms()[1].as_gaussian().unwrap();
        assert_eq!(g.inputs().keys().collect::<Vec<_>>(), vec!["x", "y"]);
    }
}
