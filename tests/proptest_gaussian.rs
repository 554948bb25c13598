//! Property tests for the Gaussian algebra
//!
//! Each property builds random factors from a seed and checks an algebraic
//! identity by evaluating both sides at random real values.


use generators::{
    assert_close, random_gaussian, random_srif, random_tensor, random_values, rng, scalar,
    schema_ixy,
};
use ndarray::Array1;
use proptest::prelude::*;
use sumprod::domain::inputs;
use sumprod::{AssocOp, Domain, GaussianParams, Term};

// ============================================================================
// Construction
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Compressing a wide factor keeps its log density, shift included
    #[test]
    fn compression_preserves_density(seed in any::<u64>(), extra in 1usize..4) {
        let mut rng = rng(seed);
        let ins = schema_ixy();
        let (white_vec, prec_sqrt) = random_srif(&mut rng, &ins, extra);
        let values = random_values(&mut rng, &ins);

        let x: Vec<f64> = values
            .iter()
            .flat_map(|(_, v)| v.to_tensor().unwrap().data().iter().copied().collect::<Vec<_>>())
            .collect();
        let (dim, rank) = (x.len(), prec_sqrt.shape()[2]);
        let expected: Vec<f64> = (0..3)
            .map(|b| {
                -0.5 * (0..rank)
                    .map(|r| {
                        let proj: f64 = (0..dim).map(|d| x[d] * prec_sqrt[[b, d, r]]).sum();
                        (proj - white_vec[[b, r]]).powi(2)
                    })
                    .sum::<f64>()
            })
            .collect();
        let expected = Term::tensor(
            Array1::from(expected).into_dyn(),
            inputs([("i", Domain::bint(3))]),
        )
        .unwrap();

        let g = Term::gaussian(GaussianParams::Srif { white_vec, prec_sqrt }, ins, false).unwrap();
        prop_assert!(g.as_gaussian().is_none(), "a wide factor carries a shift");
        assert_close(&g.subs(values).unwrap(), &expected, 1e-8);
    }

    /// Ground operands of addition normalize to the same tree in either order
    #[test]
    fn addition_commutes_syntactically(seed in any::<u64>()) {
        let mut rng = rng(seed);
        let ins = schema_ixy();
        let t = random_tensor(&mut rng, &ins);
        let g = random_gaussian(&mut rng, &ins);
        prop_assert_eq!(t.add(&g).unwrap(), g.add(&t).unwrap());
    }
}

// ============================================================================
// Reductions
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Log-sum-exp over a mixture index matches explicit enumeration
    #[test]
    fn mixture_index_marginalizes(seed in any::<u64>()) {
        let mut rng = rng(seed);
        let ins = schema_ixy();
        let g = random_gaussian(&mut rng, &ins);
        let w = random_tensor(&mut rng, &ins);
        let joint = w.add(&g).unwrap();
        let values = random_values(&mut rng, &ins);

        let actual = joint
            .reduce(AssocOp::LogAddExp, &["i"])
            .unwrap()
            .subs(values.clone())
            .unwrap();
        let parts: Vec<f64> = (0..3)
            .map(|k| {
                let at_k = joint.subs([("i", Term::int(k, 3))]).unwrap();
                scalar(&at_k.subs(values.clone()).unwrap())
            })
            .collect();
        let max = parts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let expected = max + parts.iter().map(|p| (p - max).exp()).sum::<f64>().ln();
        prop_assert!((scalar(&actual) - expected).abs() < 1e-8 * (1.0 + expected.abs()));
    }

    /// Summing along a plate equals adding the per-index factors
    #[test]
    fn plate_sum_matches_explicit_sum(seed in any::<u64>()) {
        let mut rng = rng(seed);
        let ins = schema_ixy();
        let g = random_gaussian(&mut rng, &ins);
        let fused = g.reduce(AssocOp::Add, &["i"]).unwrap();
        prop_assert!(!fused.inputs().contains_key("i"));

        let mut explicit = g.subs([("i", Term::int(0, 3))]).unwrap();
        for k in 1..3 {
            explicit = explicit.add(&g.subs([("i", Term::int(k, 3))]).unwrap()).unwrap();
        }
        let values = random_values(&mut rng, &ins);
        assert_close(
            &fused.subs(values.clone()).unwrap(),
            &explicit.subs(values).unwrap(),
            1e-8,
        );
    }

    /// Integrating real inputs one at a time matches integrating all at once
    #[test]
    fn marginalize_in_two_steps(seed in any::<u64>()) {
        let mut rng = rng(seed);
        let g = random_gaussian(&mut rng, &schema_ixy());
        let joint = g.reduce(AssocOp::LogAddExp, &["x", "y"]).unwrap();
        let stepwise = g
            .reduce(AssocOp::LogAddExp, &["y"])
            .unwrap()
            .reduce(AssocOp::LogAddExp, &["x"])
            .unwrap();
        assert_close(&stepwise, &joint, 1e-8);
    }
}

// ============================================================================
// Fusion and substitution
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Adding factors over disjoint real inputs adds their densities
    #[test]
    fn fusion_round_trip(seed in any::<u64>()) {
        let mut rng = rng(seed);
        let ins1 = inputs([("i", Domain::bint(3)), ("x", Domain::reals(&[2]))]);
        let ins2 = inputs([("y", Domain::real()), ("i", Domain::bint(3))]);
        let g1 = random_gaussian(&mut rng, &ins1);
        let g2 = random_gaussian(&mut rng, &ins2);
        let v1 = random_values(&mut rng, &ins1);
        let v2 = random_values(&mut rng, &ins2);

        let sum = g1.add(&g2).unwrap();
        prop_assert!(sum.as_gaussian().is_some());
        let lhs = sum.subs(v1.iter().chain(&v2).cloned()).unwrap();
        let rhs = g1.subs(v1).unwrap().add(&g2.subs(v2).unwrap()).unwrap();
        assert_close(&lhs, &rhs, 1e-8);
    }

    /// Swapping two inputs by renaming is undone by swapping their values
    #[test]
    fn swap_rename_is_inverse(seed in any::<u64>(), x0 in -3.0f64..3.0, y0 in -3.0f64..3.0) {
        let mut rng = rng(seed);
        let ins = inputs([
            ("i", Domain::bint(3)),
            ("x", Domain::real()),
            ("y", Domain::real()),
        ]);
        let g = random_gaussian(&mut rng, &ins);
        let swapped = g
            .subs([
                ("x", Term::variable("y", Domain::real())),
                ("y", Term::variable("x", Domain::real())),
            ])
            .unwrap();
        let lhs = swapped
            .subs([("x", Term::number(x0)), ("y", Term::number(y0))])
            .unwrap();
        let rhs = g
            .subs([("x", Term::number(y0)), ("y", Term::number(x0))])
            .unwrap();
        assert_close(&lhs, &rhs, 1e-10);
    }
}
