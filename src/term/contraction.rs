//! The n-ary sum-of-products node.

use std::collections::BTreeSet;

use rand::Rng;

use super::Term;
use crate::domain::Inputs;
use crate::error::{FactorError, Result};
use crate::ops::AssocOp;

/// `red_op` over `reduced_vars` of `bin_op` over `terms`.
///
/// A lazy contraction is only ever built by [`Term::contraction`], after
/// the rule table and the evaluator found nothing more to do.
#[derive(Clone, Debug, PartialEq)]
pub struct Contraction {
    red_op: AssocOp,
    bin_op: AssocOp,
    reduced_vars: BTreeSet<String>,
    terms: Vec<Term>,
}

impl Contraction {
    pub(crate) fn new(
        red_op: AssocOp,
        bin_op: AssocOp,
        reduced_vars: BTreeSet<String>,
        terms: Vec<Term>,
    ) -> Self {
        Self {
            red_op,
            bin_op,
            reduced_vars,
            terms,
        }
    }

    pub fn red_op(&self) -> AssocOp {
        self.red_op
    }

    pub fn bin_op(&self) -> AssocOp {
        self.bin_op
    }

    pub fn reduced_vars(&self) -> &BTreeSet<String> {
        &self.reduced_vars
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// A sum of a constant term and a Gaussian, possibly reduced under
    /// log-sum-exp: the shape of a Gaussian mixture.
    pub fn is_gaussian_mixture(&self) -> bool {
        matches!(self.red_op, AssocOp::Null | AssocOp::LogAddExp)
            && self.bin_op == AssocOp::Add
            && self.terms.len() == 2
            && matches!(self.terms[0].ground_rank(), Some(1) | Some(2))
            && self.terms[1].as_gaussian().is_some()
    }

    /// Sample each variable from the one term that mentions it.
    pub(crate) fn sample<R: Rng + ?Sized>(
        &self,
        vars: &BTreeSet<String>,
        sample_inputs: &Inputs,
        rng: &mut R,
    ) -> Result<Term> {
        if self.bin_op != AssocOp::Add || !self.red_op.is_null() {
            return Err(FactorError::NotImplemented(format!(
                "sampling through a ({}, {}) contraction",
                self.red_op, self.bin_op
            )));
        }
        let mut remaining = vars.clone();
        let mut terms = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let own: Vec<&str> = remaining
                .iter()
                .filter(|v| term.inputs().contains_key(*v))
                .map(String::as_str)
                .collect();
            if own.is_empty() {
                terms.push(term.clone());
                continue;
            }
            let sampled = term.sample(&own, sample_inputs, rng)?;
            let taken: Vec<String> = own.iter().map(|s| s.to_string()).collect();
            for name in taken {
                remaining.remove(&name);
            }
            terms.push(sampled);
        }
        Term::contraction(self.red_op, self.bin_op, BTreeSet::new(), terms)
    }
}
