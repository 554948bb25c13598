//! The rule table: structural rewrites applied to every new node.
//!
//! Each rule inspects the operator pair and the operand variants of a node
//! about to be built and either returns an equivalent, simpler term or
//! `None` to let the evaluator have a go. Rules rebuild their output through
//! the public constructors, so rewriting continues until no rule fires.
//!
//! Key rewrites (`C(red, bin, vars, terms)` is a contraction):
//! - C(red, bin, {}, ts) → C(null, bin, {}, ts)
//! - C(red, bin, vars, [t]) → C(red, null, vars, [t])
//! - C(null, null, {}, [t]) → t
//! - C(op, op, vars, ts) → C(null, op, {}, [t.reduce(op, vars) for t in ts])
//! - C(red, bin, vars, [.., unit(bin), ..]) → C(red, bin, vars, [..])
//! - C(red, bin, vars, [.., C(red', bin', vars', ts'), ..]) → C(red, bin, vars ∪ vars', [.., ts', ..])
//! - ground terms under a commutative operator are sorted Delta < Number < Tensor < Gaussian
//! - -(-x) → x, 1/(1/x) → x, exp(log x) → x, log(exp x) → x
//! - unary operators distribute through matching contractions
//! - substitution distributes through contractions; nested substitutions fuse

use std::collections::BTreeSet;

use tracing::trace;

use crate::domain::Inputs;
use crate::error::Result;
use crate::ops::{AssocOp, UnaryOp};
use crate::term::{Contraction, Term, TermKind};

// ============================================================================
// Contraction rules
// ============================================================================

/// Rewrite a contraction about to be built. Operands are already validated
/// and `vars` mentions only names some term has.
pub(crate) fn contraction(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    // C(red, bin, {}, ts) → C(null, bin, {}, ts)
    if vars.is_empty() && !red.is_null() {
        trace!(rule = "trivial_reduce");
        return Term::contraction(AssocOp::Null, bin, BTreeSet::new(), terms.to_vec()).map(Some);
    }

    if let [term] = terms {
        // C(red, bin, vars, [t]) → C(red, null, vars, [t])
        if !bin.is_null() {
            trace!(rule = "trivial_binary");
            return Term::contraction(red, AssocOp::Null, vars.clone(), terms.to_vec()).map(Some);
        }
        // C(null, null, {}, [t]) → t
        if red.is_null() {
            trace!(rule = "identity");
            return Ok(Some(term.clone()));
        }
    }

    if let Some(result) = canonical_order(red, bin, vars, terms)? {
        return Ok(Some(result));
    }
    if let Some(result) = commute_join(red, bin, vars, terms)? {
        return Ok(Some(result));
    }
    if red == bin {
        return self_reduce(red, vars, terms);
    }
    if let Some(result) = absorb_units(red, bin, vars, terms)? {
        return Ok(Some(result));
    }
    fuse(red, bin, vars, terms)
}

/// Sort ground operands of a commutative operator into a fixed type order;
/// the sort is stable so equal kinds keep their relative order.
fn canonical_order(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    if bin.is_null() {
        return Ok(None);
    }
    let Some(ranks) = terms.iter().map(Term::ground_rank).collect::<Option<Vec<_>>>() else {
        return Ok(None);
    };
    if ranks.windows(2).all(|w| w[0] <= w[1]) {
        return Ok(None);
    }
    trace!(rule = "canonical_order");
    let mut sorted = terms.to_vec();
    sorted.sort_by_key(|t| t.ground_rank());
    Term::contraction(red, bin, vars.clone(), sorted).map(Some)
}

/// A Gaussian mixture joined with another ground term under addition
/// absorbs it, so the Gaussian stays paired with its co-factors.
fn commute_join(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    if bin != AssocOp::Add || !matches!(red, AssocOp::Null | AssocOp::LogAddExp) {
        return Ok(None);
    }
    let [a, b] = terms else {
        return Ok(None);
    };
    let (mixture, other) = match (a.as_contraction(), b.as_contraction()) {
        (Some(m), None) if m.is_gaussian_mixture() && b.ground_rank().is_some() => (m, b),
        (None, Some(m)) if m.is_gaussian_mixture() && a.ground_rank().is_some() => (m, a),
        _ => return Ok(None),
    };
    if other.inputs().keys().any(|k| mixture.reduced_vars().contains(k)) {
        return Ok(None);
    }
    let joined_red = match (red, mixture.red_op()) {
        (AssocOp::Null, inner) => inner,
        (outer, AssocOp::Null) => outer,
        (outer, inner) if outer == inner => outer,
        _ => return Ok(None),
    };
    trace!(rule = "commute_join");
    let mut joined_vars = vars.clone();
    joined_vars.extend(mixture.reduced_vars().iter().cloned());
    let mut joined_terms = mixture.terms().to_vec();
    joined_terms.push(other.clone());
    Term::contraction(joined_red, AssocOp::Add, joined_vars, joined_terms).map(Some)
}

/// `op` over `vars` of `op` over terms: reduce each term on its own.
///
/// Exact when `op` is idempotent or every term mentions every reduced
/// variable. Otherwise a term missing some integer variables stands for
/// that many identical copies, which [`AssocOp::repeat`] accounts for.
fn self_reduce(op: AssocOp, vars: &BTreeSet<String>, terms: &[Term]) -> Result<Option<Term>> {
    let mut all_inputs = Inputs::new();
    for term in terms {
        for (k, d) in term.inputs() {
            all_inputs.entry(k.clone()).or_insert_with(|| d.clone());
        }
    }
    let mut reduced = Vec::with_capacity(terms.len());
    for term in terms {
        let own: BTreeSet<String> = vars
            .iter()
            .filter(|v| term.inputs().contains_key(*v))
            .cloned()
            .collect();
        let mut result = term.reduce_vars(op, own)?;
        if !op.is_idempotent() {
            let mut copies = 1;
            for v in vars.iter().filter(|v| !term.inputs().contains_key(*v)) {
                match all_inputs.get(v).and_then(|d| d.size()) {
                    Some(size) => copies *= size,
                    None => return Ok(None),
                }
            }
            if copies > 1 {
                let Some((scale_op, factor)) = op.repeat(copies) else {
                    return Ok(None);
                };
                result = result.binary(scale_op, &Term::number(factor))?;
            }
        }
        reduced.push(result);
    }
    trace!(rule = "self_reduce", %op);
    Term::contraction(AssocOp::Null, op, BTreeSet::new(), reduced).map(Some)
}

/// Drop numbers equal to the unit of `bin`, keeping at least one operand.
fn absorb_units(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    let Some(unit) = bin.unit() else {
        return Ok(None);
    };
    let is_unit = |t: &Term| t.output().is_real() && t.as_number() == Some(unit);
    if !terms.iter().any(is_unit) {
        return Ok(None);
    }
    let mut kept: Vec<Term> = terms.iter().filter(|t| !is_unit(t)).cloned().collect();
    if kept.is_empty() {
        kept.push(terms[0].clone());
    }
    trace!(rule = "absorb_units", %bin, dropped = terms.len() - kept.len());
    Term::contraction(red, bin, vars.clone(), kept).map(Some)
}

/// The operator pair of `outer` after splicing in `inner`, if the splice
/// is sound. An inner reduction hoisted over siblings needs its operator
/// to distribute over the product.
fn fused_ops(
    outer: (AssocOp, AssocOp),
    inner: &Contraction,
    has_siblings: bool,
) -> Option<(AssocOp, AssocOp)> {
    let (red, bin) = outer;
    let red = match (red, inner.red_op()) {
        (r, AssocOp::Null) => r,
        (AssocOp::Null, r) => r,
        (r, s) if r == s => r,
        _ => return None,
    };
    let bin = match (bin, inner.bin_op()) {
        (b, AssocOp::Null) => b,
        (AssocOp::Null, b) => b,
        (b, c) if b == c => b,
        _ => return None,
    };
    let hoisted = has_siblings && !inner.reduced_vars().is_empty();
    let valid = if hoisted {
        AssocOp::distributes(red, bin)
    } else {
        red.is_null() || bin.is_null() || red == bin || AssocOp::distributes(red, bin)
    };
    valid.then_some((red, bin))
}

/// Splice the first nested contraction whose operators are compatible.
fn fuse(
    red: AssocOp,
    bin: AssocOp,
    vars: &BTreeSet<String>,
    terms: &[Term],
) -> Result<Option<Term>> {
    for (i, term) in terms.iter().enumerate() {
        let Some(inner) = term.as_contraction() else {
            continue;
        };
        let Some((new_red, new_bin)) = fused_ops((red, bin), inner, terms.len() > 1) else {
            continue;
        };
        // the inner reduction must not capture a sibling's variable
        let captures = terms
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .any(|(_, t)| t.inputs().keys().any(|k| inner.reduced_vars().contains(k)));
        if captures {
            continue;
        }
        let mut fused_terms = Vec::with_capacity(terms.len() + inner.terms().len());
        fused_terms.extend_from_slice(&terms[..i]);
        fused_terms.extend_from_slice(inner.terms());
        fused_terms.extend_from_slice(&terms[i + 1..]);
        if new_bin.is_null() && fused_terms.len() != 1 {
            continue;
        }
        let mut fused_vars = vars.clone();
        fused_vars.extend(inner.reduced_vars().iter().cloned());
        trace!(rule = "fuse", %new_red, %new_bin);
        return Term::contraction(new_red, new_bin, fused_vars, fused_terms).map(Some);
    }
    Ok(None)
}

// ============================================================================
// Unary rules
// ============================================================================

/// Rewrite `op(arg)` before evaluation.
pub(crate) fn unary(op: UnaryOp, arg: &Term) -> Result<Option<Term>> {
    // op(inverse(op)(x)) → x
    if let TermKind::Unary { op: inner, arg: x } = arg.kind() {
        if *inner == op.inverse() {
            trace!(rule = "cancel_inverse", %op);
            return Ok(Some(x.clone()));
        }
    }

    let Some(c) = arg.as_contraction() else {
        // -x → x * -1
        if op == UnaryOp::Neg && arg.is_variable() && arg.output().is_real() {
            trace!(rule = "neg_as_mul");
            return arg.mul(&Term::number(-1.0)).map(Some);
        }
        return Ok(None);
    };

    let distributed = match (op, c.red_op(), c.bin_op()) {
        // -(a + b) → -a + -b
        (UnaryOp::Neg, AssocOp::Null, AssocOp::Add) => Some((AssocOp::Null, AssocOp::Add)),
        // 1 / (a * b) → 1/a * 1/b
        (UnaryOp::Reciprocal, AssocOp::Null, AssocOp::Mul) => Some((AssocOp::Null, AssocOp::Mul)),
        // log(sum(a * b)) → logsumexp(log a + log b)
        (UnaryOp::Log, AssocOp::Null, AssocOp::Mul) => Some((AssocOp::Null, AssocOp::Add)),
        (UnaryOp::Log, AssocOp::Add, AssocOp::Mul) => Some((AssocOp::LogAddExp, AssocOp::Add)),
        // exp(logsumexp(a + b)) → sum(exp a * exp b)
        (UnaryOp::Exp, AssocOp::Null, AssocOp::Add) => Some((AssocOp::Null, AssocOp::Mul)),
        (UnaryOp::Exp, AssocOp::LogAddExp, AssocOp::Add) => Some((AssocOp::Add, AssocOp::Mul)),
        _ => None,
    };
    if let Some((red, bin)) = distributed {
        trace!(rule = "distribute_unary", %op);
        let terms = c
            .terms()
            .iter()
            .map(|t| t.unary(op))
            .collect::<Result<Vec<_>>>()?;
        return Term::contraction(red, bin, c.reduced_vars().clone(), terms).map(Some);
    }

    // -(a * b) → a * b * -1
    if op == UnaryOp::Neg && c.red_op().is_null() && c.bin_op() == AssocOp::Mul {
        trace!(rule = "neg_as_mul");
        return arg.mul(&Term::number(-1.0)).map(Some);
    }
    Ok(None)
}

// ============================================================================
// Substitution rules
// ============================================================================

/// Rewrite `term(subs)`; every key of `subs` is an input of `term`.
pub(crate) fn subs(term: &Term, subs: &[(String, Term)]) -> Result<Option<Term>> {
    match term.kind() {
        TermKind::Contraction(c) => {
            // values mentioning a reduced variable would be captured
            let captures = subs
                .iter()
                .any(|(_, v)| v.inputs().keys().any(|k| c.reduced_vars().contains(k)));
            if captures {
                return Ok(None);
            }
            trace!(rule = "distribute_subs", names = subs.len());
            let terms = c
                .terms()
                .iter()
                .map(|t| t.substitute(subs.to_vec()))
                .collect::<Result<Vec<_>>>()?;
            Term::contraction(c.red_op(), c.bin_op(), c.reduced_vars().clone(), terms).map(Some)
        }
        // a(b)(c) → a(b(c), c)
        TermKind::Subs { arg, subs: inner } => {
            trace!(rule = "fuse_subs");
            let mut fused = inner
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.substitute(subs.to_vec())?)))
                .collect::<Result<Vec<_>>>()?;
            for (k, v) in subs {
                if !inner.iter().any(|(name, _)| name == k) {
                    fused.push((k.clone(), v.clone()));
                }
            }
            arg.substitute(fused).map(Some)
        }
        _ => Ok(None),
    }
}
