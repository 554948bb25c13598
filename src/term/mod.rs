//! Terms of the sum-product algebra.
//!
//! A [`Term`] is an immutable, reference-counted expression node with named
//! `inputs` (its free variables) and an `output` domain. Every constructor
//! goes through the rule table in [`crate::normalize`] and the evaluator in
//! [`crate::eval`], so a term is always in the most evaluated form its
//! inputs allow; whatever cannot be evaluated yet is kept as a lazy node.
//!
//! # Architecture
//!
//! - **tensor**: dense arrays over integer inputs
//! - **delta**: point masses
//! - **contraction**: the n-ary sum-of-products node
//! - **subs**: the substitution entry point

mod contraction;
mod delta;
mod subs;
mod tensor;

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use ndarray::ArrayD;
use rand::Rng;
use tracing::trace;

pub use contraction::Contraction;
pub use delta::{Delta, DELTA_ATOL};
pub use tensor::{align_tensors, Tensor};

pub(crate) use tensor::{binary_output, int_value};

use crate::domain::{merge_inputs, Domain, Inputs};
use crate::error::{FactorError, Result};
use crate::gaussian::{Gaussian, GaussianParams};
use crate::ops::{AssocOp, UnaryOp};
use crate::{eval, normalize};

/// A shared, immutable expression node.
#[derive(Clone, Debug)]
pub struct Term(Rc<Node>);

#[derive(Debug)]
struct Node {
    inputs: Inputs,
    output: Domain,
    kind: TermKind,
}

/// The closed set of term variants.
#[derive(Clone, Debug, PartialEq)]
pub enum TermKind {
    /// A scalar constant; its domain is the term's output.
    Number(f64),
    Tensor(Tensor),
    /// A free variable named by the string; its domain is the output.
    Variable(String),
    Delta(Delta),
    Gaussian(Gaussian),
    Contraction(Contraction),
    /// An unevaluated pointwise transform.
    Unary { op: UnaryOp, arg: Term },
    /// An unevaluated substitution.
    Subs { arg: Term, subs: Vec<(String, Term)> },
}

impl PartialEq for Term {
    /// Syntactic equality, including input order.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
            || (self.0.output == other.0.output
                && self.0.inputs.iter().eq(other.0.inputs.iter())
                && self.0.kind == other.0.kind)
    }
}

// ============================================================================
// Construction
// ============================================================================

impl Term {
    fn reflect(kind: TermKind, inputs: Inputs, output: Domain) -> Term {
        Term(Rc::new(Node {
            inputs,
            output,
            kind,
        }))
    }

    /// Real scalar constant.
    pub fn number(value: f64) -> Term {
        Term::reflect(TermKind::Number(value), Inputs::new(), Domain::real())
    }

    /// Integer constant in `[0, size)`.
    pub fn int(value: usize, size: usize) -> Term {
        Term::reflect(
            TermKind::Number(value as f64),
            Inputs::new(),
            Domain::Bint(size),
        )
    }

    /// Real tensor over integer `inputs`; see [`Tensor::new`].
    pub fn tensor(data: ArrayD<f64>, inputs: Inputs) -> Result<Term> {
        Ok(Term::from_tensor(Tensor::new(data, inputs)?))
    }

    pub fn from_tensor(tensor: Tensor) -> Term {
        let inputs = tensor.inputs().clone();
        let output = tensor.output().clone();
        Term::reflect(TermKind::Tensor(tensor), inputs, output)
    }

    pub fn variable(name: &str, domain: Domain) -> Term {
        let mut inputs = Inputs::new();
        inputs.insert(name.to_string(), domain.clone());
        Term::reflect(TermKind::Variable(name.to_string()), inputs, domain)
    }

    /// Point mass of the real variable `name` at `point`.
    pub fn delta(name: &str, point: Term) -> Result<Term> {
        let point = point.to_tensor().ok_or_else(|| {
            FactorError::Precondition(format!("delta point for '{}' must be a tensor", name))
        })?;
        Ok(Term::from_delta(Delta::new(name, point)?))
    }

    pub(crate) fn from_delta(delta: Delta) -> Term {
        let inputs = delta.inputs();
        Term::reflect(TermKind::Delta(delta), inputs, Domain::real())
    }

    /// Gaussian factor from any parametrization.
    ///
    /// Wide square-root parameters are compressed; the normalization
    /// difference this introduces is added back as a tensor over the
    /// integer inputs.
    pub fn gaussian(params: GaussianParams, inputs: Inputs, negate: bool) -> Result<Term> {
        let (gaussian, shift) = Gaussian::from_params(params, inputs, negate)?;
        let term = Term::from_gaussian(gaussian);
        match shift {
            Some(shift) => term.add(&Term::from_tensor(shift)),
            None => Ok(term),
        }
    }

    pub(crate) fn from_gaussian(gaussian: Gaussian) -> Term {
        let inputs = gaussian.inputs().clone();
        Term::reflect(TermKind::Gaussian(gaussian), inputs, Domain::real())
    }

    /// A sum-of-products over `terms`.
    ///
    /// `reduced_vars` not mentioned by any term are dropped. The node is
    /// normalized and evaluated as far as possible before it is returned.
    pub fn contraction(
        red_op: AssocOp,
        bin_op: AssocOp,
        reduced_vars: BTreeSet<String>,
        terms: Vec<Term>,
    ) -> Result<Term> {
        if terms.is_empty() {
            return Err(FactorError::InvalidContraction("no terms".into()));
        }
        let mut all_inputs = Inputs::new();
        for term in &terms {
            merge_inputs(&mut all_inputs, term.inputs())?;
        }
        let reduced_vars: BTreeSet<String> = reduced_vars
            .into_iter()
            .filter(|v| all_inputs.contains_key(v))
            .collect();
        if red_op.is_null() && !reduced_vars.is_empty() {
            return Err(FactorError::InvalidContraction(
                "null reduction cannot reduce variables".into(),
            ));
        }
        if bin_op.is_null() && terms.len() != 1 {
            return Err(FactorError::InvalidContraction(format!(
                "null binary operator needs exactly one term, got {}",
                terms.len()
            )));
        }
        if !red_op.is_null() && !bin_op.is_null() && red_op != bin_op
            && !AssocOp::distributes(red_op, bin_op)
        {
            return Err(FactorError::NonDistributive {
                red: red_op,
                bin: bin_op,
            });
        }
        let output = contraction_output(bin_op, &terms)?;

        if let Some(result) = normalize::contraction(red_op, bin_op, &reduced_vars, &terms)? {
            return Ok(result);
        }
        if let Some(result) = eval::contraction(red_op, bin_op, &reduced_vars, &terms)? {
            return Ok(result);
        }

        all_inputs.retain(|k, _| !reduced_vars.contains(k));
        trace!(%red_op, %bin_op, terms = terms.len(), "lazy contraction");
        Ok(Term::reflect(
            TermKind::Contraction(Contraction::new(red_op, bin_op, reduced_vars, terms)),
            all_inputs,
            output,
        ))
    }

    pub(crate) fn reflect_unary(op: UnaryOp, arg: Term) -> Term {
        let inputs = arg.inputs().clone();
        let output = arg.output().clone();
        Term::reflect(TermKind::Unary { op, arg }, inputs, output)
    }

    pub(crate) fn reflect_subs(arg: Term, subs: Vec<(String, Term)>) -> Result<Term> {
        let mut inputs: Inputs = arg
            .inputs()
            .iter()
            .filter(|(k, _)| !subs.iter().any(|(name, _)| name == *k))
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();
        for (_, value) in &subs {
            merge_inputs(&mut inputs, value.inputs())?;
        }
        let output = arg.output().clone();
        Ok(Term::reflect(TermKind::Subs { arg, subs }, inputs, output))
    }
}

fn contraction_output(bin_op: AssocOp, terms: &[Term]) -> Result<Domain> {
    let (first, rest) = match terms.split_first() {
        Some(split) => split,
        None => return Err(FactorError::InvalidContraction("no terms".into())),
    };
    if bin_op.is_null() {
        return Ok(first.output().clone());
    }
    rest.iter()
        .try_fold(first.output().clone(), |acc, t| binary_output(&acc, t.output()))
}

// ============================================================================
// Accessors
// ============================================================================

impl Term {
    pub fn inputs(&self) -> &Inputs {
        &self.0.inputs
    }

    pub fn output(&self) -> &Domain {
        &self.0.output
    }

    pub fn kind(&self) -> &TermKind {
        &self.0.kind
    }

    /// Same node, not merely equal.
    pub fn ptr_eq(&self, other: &Term) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.kind() {
            TermKind::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self.kind() {
            TermKind::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_gaussian(&self) -> Option<&Gaussian> {
        match self.kind() {
            TermKind::Gaussian(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_delta(&self) -> Option<&Delta> {
        match self.kind() {
            TermKind::Delta(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_contraction(&self) -> Option<&Contraction> {
        match self.kind() {
            TermKind::Contraction(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind(), TermKind::Variable(_))
    }

    /// Numbers and tensors as a tensor.
    pub fn to_tensor(&self) -> Option<Tensor> {
        match self.kind() {
            TermKind::Tensor(t) => Some(t.clone()),
            TermKind::Number(v) => Tensor::with_output(
                ndarray::arr0(*v).into_dyn(),
                Inputs::new(),
                self.output().clone(),
            )
            .ok(),
            _ => None,
        }
    }

    /// Position in the canonical order of commutative operands, for ground
    /// leaves only.
    pub(crate) fn ground_rank(&self) -> Option<u8> {
        match self.kind() {
            TermKind::Delta(_) => Some(0),
            TermKind::Number(_) => Some(1),
            TermKind::Tensor(_) => Some(2),
            TermKind::Gaussian(_) => Some(3),
            _ => None,
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

impl Term {
    /// Pointwise `self op other`.
    pub fn binary(&self, op: AssocOp, other: &Term) -> Result<Term> {
        Term::contraction(
            AssocOp::Null,
            op,
            BTreeSet::new(),
            vec![self.clone(), other.clone()],
        )
    }

    pub fn add(&self, other: &Term) -> Result<Term> {
        self.binary(AssocOp::Add, other)
    }

    pub fn sub(&self, other: &Term) -> Result<Term> {
        self.add(&other.neg()?)
    }

    pub fn mul(&self, other: &Term) -> Result<Term> {
        self.binary(AssocOp::Mul, other)
    }

    pub fn div(&self, other: &Term) -> Result<Term> {
        self.mul(&other.reciprocal()?)
    }

    pub fn logaddexp(&self, other: &Term) -> Result<Term> {
        self.binary(AssocOp::LogAddExp, other)
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Term> {
        if let Some(result) = normalize::unary(op, self)? {
            return Ok(result);
        }
        if let Some(result) = eval::unary(op, self)? {
            return Ok(result);
        }
        Ok(Term::reflect_unary(op, self.clone()))
    }

    pub fn neg(&self) -> Result<Term> {
        self.unary(UnaryOp::Neg)
    }

    pub fn reciprocal(&self) -> Result<Term> {
        self.unary(UnaryOp::Reciprocal)
    }

    pub fn log(&self) -> Result<Term> {
        self.unary(UnaryOp::Log)
    }

    pub fn exp(&self) -> Result<Term> {
        self.unary(UnaryOp::Exp)
    }

    /// Reduce over the named inputs; names this term does not mention are
    /// ignored.
    pub fn reduce(&self, op: AssocOp, names: &[&str]) -> Result<Term> {
        let vars = names
            .iter()
            .filter(|n| self.inputs().contains_key(**n))
            .map(|n| n.to_string())
            .collect();
        self.reduce_vars(op, vars)
    }

    /// Reduce over every input.
    pub fn reduce_all(&self, op: AssocOp) -> Result<Term> {
        self.reduce_vars(op, self.inputs().keys().cloned().collect())
    }

    pub(crate) fn reduce_vars(&self, op: AssocOp, vars: BTreeSet<String>) -> Result<Term> {
        let vars: BTreeSet<String> = vars
            .into_iter()
            .filter(|v| self.inputs().contains_key(v))
            .collect();
        if vars.is_empty() {
            return Ok(self.clone());
        }
        Term::contraction(op, AssocOp::Null, vars, vec![self.clone()])
    }

    /// Substitute terms for named inputs, simultaneously.
    pub fn subs<K: AsRef<str>>(&self, bindings: impl IntoIterator<Item = (K, Term)>) -> Result<Term> {
        let subs = bindings
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v))
            .collect();
        self.substitute(subs)
    }

    /// Rename inputs; each new name keeps the old name's domain.
    pub fn rename(&self, pairs: &[(&str, &str)]) -> Result<Term> {
        let mut subs = Vec::with_capacity(pairs.len());
        for (old, new) in pairs {
            if let Some(domain) = self.inputs().get(*old) {
                subs.push((old.to_string(), Term::variable(new, domain.clone())));
            }
        }
        self.substitute(subs)
    }

    /// Reorder inputs so that `names` come first, where the variant
    /// supports it.
    pub fn align(&self, names: &[&str]) -> Result<Term> {
        for name in names {
            if !self.inputs().contains_key(*name) {
                return Err(FactorError::Precondition(format!(
                    "cannot align to unknown input '{}'",
                    name
                )));
            }
        }
        match self.kind() {
            TermKind::Tensor(t) => Ok(Term::from_tensor(t.align(names)?)),
            TermKind::Gaussian(g) => Ok(Term::from_gaussian(g.align(names)?)),
            TermKind::Delta(d) => Ok(Term::from_delta(d.align(names)?)),
            TermKind::Contraction(c) => {
                let terms = c
                    .terms()
                    .iter()
                    .map(|t| {
                        let own: Vec<&str> = names
                            .iter()
                            .copied()
                            .filter(|n| t.inputs().contains_key(*n))
                            .collect();
                        t.align(&own)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Term::contraction(c.red_op(), c.bin_op(), c.reduced_vars().clone(), terms)
            }
            TermKind::Unary { op, arg } => Ok(Term::reflect_unary(*op, arg.align(names)?)),
            TermKind::Number(_) | TermKind::Variable(_) | TermKind::Subs { .. } => {
                Ok(self.clone())
            }
        }
    }

    /// Draw the named real variables, returning point masses at the draws
    /// plus the log normalizer that accounts for them.
    ///
    /// `sample_inputs` adds independent sample axes; names this term
    /// already has are ignored.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        sampled_vars: &[&str],
        sample_inputs: &Inputs,
        rng: &mut R,
    ) -> Result<Term> {
        let vars: BTreeSet<String> = sampled_vars
            .iter()
            .filter(|n| self.inputs().contains_key(**n))
            .map(|n| n.to_string())
            .collect();
        if vars.is_empty() {
            return Ok(self.clone());
        }
        match self.kind() {
            TermKind::Gaussian(g) => crate::gaussian::sample(g, &vars, sample_inputs, rng),
            TermKind::Contraction(c) => c.sample(&vars, sample_inputs, rng),
            _ => Err(FactorError::NotImplemented(format!(
                "sampling {:?} from {}",
                vars, self
            ))),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            TermKind::Number(v) => write!(f, "{}", v),
            TermKind::Tensor(t) => write!(
                f,
                "Tensor({}; {})",
                t.inputs().keys().cloned().collect::<Vec<_>>().join(", "),
                t.output()
            ),
            TermKind::Variable(name) => write!(f, "{}", name),
            TermKind::Delta(d) => write!(f, "Delta({})", d.name()),
            TermKind::Gaussian(g) => write!(
                f,
                "Gaussian({}; rank {}{})",
                g.inputs().keys().cloned().collect::<Vec<_>>().join(", "),
                g.rank(),
                if g.negate() { ", negated" } else { "" }
            ),
            TermKind::Contraction(c) => {
                write!(f, "Contraction({}, {}, {:?}, [", c.red_op(), c.bin_op(), c.reduced_vars())?;
                for (i, t) in c.terms().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, "])")
            }
            TermKind::Unary { op, arg } => write!(f, "{}({})", op, arg),
            TermKind::Subs { arg, subs } => {
                write!(f, "{}(", arg)?;
                for (i, (k, v)) in subs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                write!(f, ")")
            }
        }
    }
}
