//! Operators of the sum-product algebra.
//!
//! Binary operators are associative and commutative. A reduction operator
//! `red` pairs with a binary operator `bin` when the two form a semiring
//! (`red` plays ⊕, `bin` plays ⊗). `Null` is the identity operator used by
//! contractions that only reduce or only combine.

use std::fmt;

/// Associative binary operators usable as reduce or bin operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssocOp {
    /// The identity ("no-op") operator.
    Null,
    Add,
    Mul,
    LogAddExp,
    Max,
    Min,
}

/// `(red, bin)` pairs forming a semiring: `red` is ⊕, `bin` is ⊗.
const DISTRIBUTIVE: &[(AssocOp, AssocOp)] = &[
    (AssocOp::LogAddExp, AssocOp::Add),
    (AssocOp::Add, AssocOp::Mul),
    (AssocOp::Max, AssocOp::Mul),
    (AssocOp::Min, AssocOp::Mul),
    (AssocOp::Max, AssocOp::Add),
    (AssocOp::Min, AssocOp::Add),
];

impl AssocOp {
    pub fn is_null(self) -> bool {
        self == AssocOp::Null
    }

    /// Whether `red` distributes over `bin`, i.e. the pair may appear in a
    /// contraction that both reduces and combines.
    pub fn distributes(red: AssocOp, bin: AssocOp) -> bool {
        DISTRIBUTIVE.contains(&(red, bin))
    }

    /// `x op x = x`.
    pub fn is_idempotent(self) -> bool {
        matches!(self, AssocOp::Max | AssocOp::Min)
    }

    /// The unit element, if the operator has one.
    pub fn unit(self) -> Option<f64> {
        match self {
            AssocOp::Null => None,
            AssocOp::Add => Some(0.0),
            AssocOp::Mul => Some(1.0),
            AssocOp::LogAddExp | AssocOp::Max => Some(f64::NEG_INFINITY),
            AssocOp::Min => Some(f64::INFINITY),
        }
    }

    /// Apply to two scalars. `Null` keeps the left operand.
    #[inline]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            AssocOp::Null => lhs,
            AssocOp::Add => lhs + rhs,
            AssocOp::Mul => lhs * rhs,
            AssocOp::LogAddExp => logaddexp(lhs, rhs),
            AssocOp::Max => lhs.max(rhs),
            AssocOp::Min => lhs.min(rhs),
        }
    }

    /// Reduce a sequence of scalars; log-sum-exp is computed stably.
    pub fn fold<I>(self, values: I) -> f64
    where
        I: IntoIterator<Item = f64>,
        I::IntoIter: Clone,
    {
        let values = values.into_iter();
        match self {
            AssocOp::LogAddExp => {
                let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
                if !max.is_finite() {
                    return max;
                }
                max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
            }
            AssocOp::Null => values.into_iter().next().unwrap_or(f64::NAN),
            op => values.fold(op.unit().unwrap_or(0.0), |acc, v| op.apply(acc, v)),
        }
    }

    /// Reducing `n` copies of the same value `x` under this operator, if
    /// expressible as `x ⊗ c` for the returned `(bin, c)`.
    pub(crate) fn repeat(self, n: usize) -> Option<(AssocOp, f64)> {
        match self {
            AssocOp::Add => Some((AssocOp::Mul, n as f64)),
            AssocOp::LogAddExp => Some((AssocOp::Add, (n as f64).ln())),
            _ => None,
        }
    }
}

impl fmt::Display for AssocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssocOp::Null => "null",
            AssocOp::Add => "add",
            AssocOp::Mul => "mul",
            AssocOp::LogAddExp => "logaddexp",
            AssocOp::Max => "max",
            AssocOp::Min => "min",
        };
        f.write_str(name)
    }
}

/// Pointwise unary transforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Reciprocal,
    Log,
    Exp,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Reciprocal => x.recip(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Exp => x.exp(),
        }
    }

    /// The operator that undoes this one.
    pub fn inverse(self) -> UnaryOp {
        match self {
            UnaryOp::Neg => UnaryOp::Neg,
            UnaryOp::Reciprocal => UnaryOp::Reciprocal,
            UnaryOp::Log => UnaryOp::Exp,
            UnaryOp::Exp => UnaryOp::Log,
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Reciprocal => "reciprocal",
            UnaryOp::Log => "log",
            UnaryOp::Exp => "exp",
        };
        f.write_str(name)
    }
}

/// `log(exp(a) + exp(b))` without overflow.
#[inline]
pub fn logaddexp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if !max.is_finite() {
        return max;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_absorb() {
        for op in [
            AssocOp::Add,
            AssocOp::Mul,
            AssocOp::LogAddExp,
            AssocOp::Max,
            AssocOp::Min,
        ] {
            let unit = op.unit().unwrap();
            assert!((op.apply(unit, 2.5) - 2.5).abs() < 1e-12, "{}", op);
        }
        assert_eq!(AssocOp::Null.unit(), None);
    }

    #[test]
    fn test_distributive_table() {
        assert!(AssocOp::distributes(AssocOp::LogAddExp, AssocOp::Add));
        assert!(AssocOp::distributes(AssocOp::Add, AssocOp::Mul));
        assert!(!AssocOp::distributes(AssocOp::Add, AssocOp::LogAddExp));
        assert!(!AssocOp::distributes(AssocOp::Mul, AssocOp::Add));
    }

    #[test]
    fn test_logsumexp_stable() {
        let big = [1000.0, 1000.0];
        let lse = AssocOp::LogAddExp.fold(big.iter().copied());
        assert!((lse - (1000.0 + 2f64.ln())).abs() < 1e-9);

        let empty: [f64; 0] = [];
        assert_eq!(AssocOp::LogAddExp.fold(empty.iter().copied()), f64::NEG_INFINITY);
        assert_eq!(logaddexp(f64::NEG_INFINITY, 0.5), 0.5);
    }

    #[test]
    fn test_fold_sum_product() {
        let xs = [1.0, 2.0, 3.0];
        assert_eq!(AssocOp::Add.fold(xs.iter().copied()), 6.0);
        assert_eq!(AssocOp::Mul.fold(xs.iter().copied()), 6.0);
        assert_eq!(AssocOp::Max.fold(xs.iter().copied()), 3.0);
        assert_eq!(AssocOp::Min.fold(xs.iter().copied()), 1.0);
    }

    #[test]
    fn test_unary_inverse() {
        for op in [UnaryOp::Neg, UnaryOp::Reciprocal, UnaryOp::Log, UnaryOp::Exp] {
            let x = 0.7;
            let y = op.inverse().apply(op.apply(x));
            assert!((x - y).abs() < 1e-12, "{}", op);
        }
    }
}
