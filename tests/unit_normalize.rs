//! Scenario tests for the rewrite rules applied to new contraction nodes


use std::collections::BTreeSet;

use generators::{assert_close, random_gaussian, random_tensor, rng};
use ndarray::array;
use sumprod::domain::inputs;
use sumprod::{AssocOp, Domain, ErrorKind, FactorError, Term};

fn names(vars: &[&str]) -> BTreeSet<String> {
    vars.iter().map(|s| s.to_string()).collect()
}

fn tensor(data: ndarray::ArrayD<f64>, ins: &[(&str, usize)]) -> Term {
    Term::tensor(data, inputs(ins.iter().map(|(n, s)| (*n, Domain::bint(*s))))).unwrap()
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_non_distributive_pair_is_rejected() {
    let t = tensor(array![1.0, 2.0].into_dyn(), &[("i", 2)]);
    let u = tensor(array![3.0, 4.0].into_dyn(), &[("i", 2)]);
    let err = Term::contraction(AssocOp::Add, AssocOp::LogAddExp, names(&["i"]), vec![t, u])
        .unwrap_err();
    assert_eq!(
        err,
        FactorError::NonDistributive {
            red: AssocOp::Add,
            bin: AssocOp::LogAddExp
        }
    );
    assert_eq!(err.kind(), ErrorKind::Precondition);
}

#[test]
fn test_null_binary_needs_one_term() {
    let t = tensor(array![1.0, 2.0].into_dyn(), &[("i", 2)]);
    let err = Term::contraction(AssocOp::Add, AssocOp::Null, names(&["i"]), vec![t.clone(), t])
        .unwrap_err();
    assert!(matches!(err, FactorError::InvalidContraction(_)));
}

#[test]
fn test_unknown_reduced_vars_are_dropped() {
    let t = tensor(array![1.0, 2.0].into_dyn(), &[("i", 2)]);
    let r = Term::contraction(AssocOp::Add, AssocOp::Null, names(&["j"]), vec![t.clone()]).unwrap();
    assert!(r.ptr_eq(&t));
}

// ============================================================================
// Canonical form
// ============================================================================

#[test]
fn test_ground_operands_sort_canonically() {
    let g = random_gaussian(&mut rng(4), &inputs([("x", Domain::real())]));
    let point = Term::tensor(array![0.5].into_dyn(), Default::default()).unwrap();
    let d = Term::delta("z", point).unwrap();

    let lhs = d.add(&g).unwrap();
    let rhs = g.add(&d).unwrap();
    assert_eq!(lhs, rhs);
    let c = lhs.as_contraction().unwrap();
    assert!(c.terms()[0].as_delta().is_some());
    assert!(c.terms()[1].as_gaussian().is_some());
}

#[test]
fn test_lazy_node_display() {
    let t = tensor(array![1.0, 2.0].into_dyn(), &[("i", 2)]);
    let x = Term::variable("x", Domain::real());
    let s = t.add(&x).unwrap();
    assert_eq!(
        s.to_string(),
        "Contraction(null, add, {}, [Tensor(i; Real), x])"
    );
    assert_eq!(s.inputs().keys().collect::<Vec<_>>(), vec!["i", "x"]);
}

// ============================================================================
// Joining mixtures
// ============================================================================

#[test]
fn test_constant_joins_gaussian_mixture() {
    let mut rng = rng(6);
    let ins = inputs([("i", Domain::bint(2)), ("x", Domain::real())]);
    let t = random_tensor(&mut rng, &ins);
    let t2 = random_tensor(&mut rng, &ins);
    let g = random_gaussian(&mut rng, &ins);

    let joined = t.add(&g).unwrap().add(&t2).unwrap();
    let c = joined.as_contraction().expect("mixture stays lazy");
    assert!(c.is_gaussian_mixture());
    assert_close(&c.terms()[0], &t.add(&t2).unwrap(), 1e-14);
    assert!(c.terms()[1].ptr_eq(&g));
}

#[test]
fn test_constant_joins_marginalized_mixture() {
    let mut rng = rng(7);
    let ins = inputs([("i", Domain::bint(2)), ("x", Domain::real())]);
    let t = random_tensor(&mut rng, &ins);
    let g = random_gaussian(&mut rng, &ins);
    let c0 = Term::number(1.5);

    // the constant does not mention i, so it moves inside the reduction
    let lazy = t.add(&g).unwrap().reduce(AssocOp::LogAddExp, &["i"]).unwrap();
    let joined = lazy.add(&c0).unwrap();
    let c = joined.as_contraction().expect("still lazy");
    assert_eq!(c.red_op(), AssocOp::LogAddExp);
    assert!(c.is_gaussian_mixture());

    let value = Term::number(0.25);
    let actual = joined.subs([("x", value.clone())]).unwrap();
    let expected = lazy.subs([("x", value)]).unwrap().add(&c0).unwrap();
    assert_close(&actual, &expected, 1e-12);
}

// ============================================================================
// Self-reduction
// ============================================================================

#[test]
fn test_logaddexp_over_logaddexp_counts_copies() {
    // lse_i (a[i] lse b[j]) = lse(a) lse (b[j] + ln 2)
    let a = tensor(array![0.0, 1.0].into_dyn(), &[("i", 2)]);
    let b = tensor(array![-1.0, 2.0, 0.5].into_dyn(), &[("j", 3)]);
    let r = Term::contraction(
        AssocOp::LogAddExp,
        AssocOp::LogAddExp,
        names(&["i"]),
        vec![a, b],
    )
    .unwrap();
    let lse_a = (0f64.exp() + 1f64.exp()).ln();
    let expected: Vec<f64> = [-1.0f64, 2.0, 0.5]
        .iter()
        .map(|bj| (lse_a.exp() + 2.0 * bj.exp()).ln())
        .collect();
    let expected = tensor(ndarray::Array1::from(expected).into_dyn(), &[("j", 3)]);
    assert_close(&r, &expected, 1e-12);
}

#[test]
fn test_min_over_min_is_idempotent() {
    let a = tensor(array![[3.0, 1.0], [4.0, 5.0]].into_dyn(), &[("i", 2), ("j", 2)]);
    let b = tensor(array![2.0, 0.5].into_dyn(), &[("j", 2)]);
    let r = Term::contraction(AssocOp::Min, AssocOp::Min, names(&["i", "j"]), vec![a, b])
        .unwrap();
    assert_eq!(r.as_number().or_else(|| r.to_tensor().map(|t| t.data()[[]])), Some(0.5));
}

#[test]
fn test_mul_over_mul_stays_lazy() {
    let a = tensor(array![2.0, 3.0].into_dyn(), &[("i", 2)]);
    let b = tensor(array![5.0, 7.0].into_dyn(), &[("j", 2)]);
    let r = Term::contraction(AssocOp::Mul, AssocOp::Mul, names(&["i"]), vec![a, b]).unwrap();
    let c = r.as_contraction().expect("no closed form for repeated products");
    assert_eq!(c.red_op(), AssocOp::Mul);
    assert_eq!(c.bin_op(), AssocOp::Mul);
}
