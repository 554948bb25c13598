//! Substitution of terms for named inputs.

use tracing::trace;

use super::tensor::Tensor;
use super::{Term, TermKind};
use crate::error::{FactorError, Result};
use crate::{gaussian, normalize};

impl Term {
    /// Simultaneous substitution; bindings for names this term does not
    /// have are ignored.
    pub(crate) fn substitute(&self, subs: Vec<(String, Term)>) -> Result<Term> {
        let subs: Vec<(String, Term)> = subs
            .into_iter()
            .filter(|(k, _)| self.inputs().contains_key(k))
            .collect();
        if subs.is_empty() {
            return Ok(self.clone());
        }
        for (name, value) in &subs {
            let expected = &self.inputs()[name];
            if value.output() != expected {
                return Err(FactorError::DomainMismatch {
                    name: name.clone(),
                    expected: expected.clone(),
                    actual: value.output().clone(),
                });
            }
        }
        if let Some(result) = normalize::subs(self, &subs)? {
            return Ok(result);
        }
        eager_subs(self, subs)
    }
}

/// An integer index: a constant, a tensor, or a renamed integer variable.
fn as_index(value: &Term) -> Option<Tensor> {
    if !value.output().is_int() {
        return None;
    }
    match value.kind() {
        TermKind::Variable(name) => value.output().size().map(|n| Tensor::arange(name, n)),
        TermKind::Number(_) | TermKind::Tensor(_) => value.to_tensor(),
        _ => None,
    }
}

fn eager_subs(term: &Term, subs: Vec<(String, Term)>) -> Result<Term> {
    match term.kind() {
        TermKind::Number(_) => Ok(term.clone()),
        TermKind::Variable(name) => Ok(subs
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
            .unwrap_or_else(|| term.clone())),
        TermKind::Tensor(t) => {
            let mut index = Vec::new();
            let mut lazy = Vec::new();
            for (k, v) in subs {
                match as_index(&v) {
                    Some(ix) => index.push((k, ix)),
                    None => lazy.push((k, v)),
                }
            }
            let result = if index.is_empty() {
                term.clone()
            } else {
                Term::from_tensor(t.index(&index)?)
            };
            finish(result, lazy)
        }
        TermKind::Delta(d) => {
            let mut index = Vec::new();
            let mut own = None;
            let mut lazy = Vec::new();
            for (k, v) in subs {
                if k == d.name() {
                    own = Some(v);
                } else if let Some(ix) = as_index(&v) {
                    index.push((k, ix));
                } else {
                    lazy.push((k, v));
                }
            }
            let mut delta = d.clone();
            if !index.is_empty() {
                delta = delta.index(&index)?;
            }
            let result = match own {
                None => Term::from_delta(delta),
                Some(value) => match value.kind() {
                    TermKind::Variable(new_name) => Term::from_delta(delta.rename(new_name)?),
                    TermKind::Number(_) | TermKind::Tensor(_) => match value.to_tensor() {
                        Some(v) => Term::from_tensor(delta.log_density(&v)?),
                        None => Term::from_delta(delta),
                    },
                    _ => {
                        lazy.push((delta.name().to_string(), value));
                        Term::from_delta(delta)
                    }
                },
            };
            finish(result, lazy)
        }
        TermKind::Gaussian(g) => gaussian::eager_subs(g, subs),
        TermKind::Unary { op, arg } => arg.substitute(subs)?.unary(*op),
        TermKind::Contraction(_) | TermKind::Subs { .. } => {
            trace!(term = %term, "lazy substitution");
            Term::reflect_subs(term.clone(), subs)
        }
    }
}

/// Apply what could not be done eagerly as a lazy substitution.
pub(crate) fn finish(result: Term, lazy: Vec<(String, Term)>) -> Result<Term> {
    if lazy.is_empty() {
        Ok(result)
    } else {
        Term::reflect_subs(result, lazy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{inputs, Domain};
    use ndarray::array;

    fn tensor_ij() -> Term {
        Term::tensor(
            array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]].into_dyn(),
            inputs([("i", Domain::bint(2)), ("j", Domain::bint(3))]),
        )
        .unwrap()
    }

    #[test]
    fn test_tensor_int_subs() {
        let t = tensor_ij().subs([("i", Term::int(1, 2))]).unwrap();
        assert_eq!(t.as_tensor().unwrap().data(), &array![3.0, 4.0, 5.0].into_dyn());
    }

    #[test]
    fn test_tensor_rename() {
        let t = tensor_ij().rename(&[("j", "k")]).unwrap();
        assert_eq!(t.inputs().keys().collect::<Vec<_>>(), vec!["i", "k"]);
        assert_eq!(t.as_tensor().unwrap().data()[[1, 2]], 5.0);
    }

    #[test]
    fn test_domain_mismatch() {
        let err = tensor_ij().subs([("i", Term::int(1, 3))]).unwrap_err();
        assert!(matches!(err, FactorError::DomainMismatch { .. }));
    }

    #[test]
    fn test_delta_subs() {
        let point = Term::tensor(array![1.0, 2.0].into_dyn(), Default::default()).unwrap();
        let d = Term::delta("x", point).unwrap();
        let hit = Term::tensor(array![1.0, 2.0].into_dyn(), Default::default()).unwrap();
        let miss = Term::tensor(array![1.0, 0.0].into_dyn(), Default::default()).unwrap();
        assert_eq!(d.subs([("x", hit)]).unwrap().as_tensor().unwrap().data()[[]], 0.0);
        assert_eq!(
            d.subs([("x", miss)]).unwrap().as_tensor().unwrap().data()[[]],
            f64::NEG_INFINITY
        );
        let renamed = d.rename(&[("x", "y")]).unwrap();
        assert_eq!(renamed.as_delta().unwrap().name(), "y");
    }

    #[test]
    fn test_variable_subs_returns_value() {
        let x = Term::variable("x", Domain::real());
        let y = x.subs([("x", Term::variable("z", Domain::real()))]).unwrap();
        assert!(matches!(y.kind(), TermKind::Variable(name) if name == "z"));
    }
}
