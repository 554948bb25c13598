//! Domains of inputs and outputs.
//!
//! A domain is either a finite integer range `[0, k)` or a real tensor of
//! fixed shape. Inputs of a term are an ordered map from name to domain;
//! the order fixes the layout of batch axes (integer inputs) and of the
//! concatenated real dimension (real inputs).

use std::fmt;

use indexmap::IndexMap;

use crate::error::{FactorError, Result};

/// The type of a named input or of a term's value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Integers in `[0, size)`.
    Bint(usize),
    /// Real tensors of the given shape (`[]` for scalars).
    Real(Vec<usize>),
}

/// Ordered mapping from input name to domain.
pub type Inputs = IndexMap<String, Domain>;

impl Domain {
    pub fn bint(size: usize) -> Self {
        Domain::Bint(size)
    }

    /// Real scalar.
    pub fn real() -> Self {
        Domain::Real(Vec::new())
    }

    pub fn reals(shape: &[usize]) -> Self {
        Domain::Real(shape.to_vec())
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Domain::Real(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Domain::Bint(_))
    }

    /// Event shape; integer domains are scalar.
    pub fn shape(&self) -> &[usize] {
        match self {
            Domain::Bint(_) => &[],
            Domain::Real(shape) => shape,
        }
    }

    /// Number of scalar elements in one value of this domain.
    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// Cardinality of an integer domain.
    pub fn size(&self) -> Option<usize> {
        match self {
            Domain::Bint(size) => Some(*size),
            Domain::Real(_) => None,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Bint(size) => write!(f, "Bint[{}]", size),
            Domain::Real(shape) if shape.is_empty() => write!(f, "Real"),
            Domain::Real(shape) => write!(f, "Reals{:?}", shape),
        }
    }
}

/// Build an `Inputs` map from `(name, domain)` pairs.
pub fn inputs<'a>(pairs: impl IntoIterator<Item = (&'a str, Domain)>) -> Inputs {
    pairs
        .into_iter()
        .map(|(name, domain)| (name.to_string(), domain))
        .collect()
}

/// Integer-valued inputs, in order.
pub fn int_inputs(inputs: &Inputs) -> Inputs {
    inputs
        .iter()
        .filter(|(_, d)| d.is_int())
        .map(|(k, d)| (k.clone(), d.clone()))
        .collect()
}

/// Real-valued inputs, in order.
pub fn real_inputs(inputs: &Inputs) -> Inputs {
    inputs
        .iter()
        .filter(|(_, d)| d.is_real())
        .map(|(k, d)| (k.clone(), d.clone()))
        .collect()
}

/// Sizes of the integer inputs, i.e. the batch shape.
pub fn batch_shape(inputs: &Inputs) -> Vec<usize> {
    inputs.values().filter_map(Domain::size).collect()
}

/// Offsets of each real input into the concatenated real dimension,
/// together with the total dimension. Integer inputs are skipped.
pub fn real_offsets(inputs: &Inputs) -> (IndexMap<String, usize>, usize) {
    let mut offsets = IndexMap::new();
    let mut total = 0;
    for (name, domain) in inputs {
        if domain.is_real() {
            offsets.insert(name.clone(), total);
            total += domain.num_elements();
        }
    }
    (offsets, total)
}

/// Merge `extra` into `base`, failing when a shared name disagrees on
/// its domain. New names are appended in the order they appear.
pub fn merge_inputs(base: &mut Inputs, extra: &Inputs) -> Result<()> {
    for (name, domain) in extra {
        match base.get(name) {
            Some(existing) if existing != domain => {
                return Err(FactorError::DomainMismatch {
                    name: name.clone(),
                    expected: existing.clone(),
                    actual: domain.clone(),
                });
            }
            Some(_) => {}
            None => {
                base.insert(name.clone(), domain.clone());
            }
        }
    }
    Ok(())
}

/// Broadcast shapes right-aligned, numpy style.
pub fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut result = vec![1; ndim];
    for shape in shapes {
        let pad = ndim - shape.len();
        for (i, &size) in shape.iter().enumerate() {
            let slot = &mut result[pad + i];
            if *slot == 1 {
                *slot = size;
            } else if size != 1 && size != *slot {
                return Err(FactorError::shape(
                    format!("{:?}", &result),
                    format!("{:?}", shape),
                ));
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_skip_ints() {
        let ins = inputs([
            ("i", Domain::bint(3)),
            ("x", Domain::reals(&[2])),
            ("j", Domain::bint(4)),
            ("y", Domain::reals(&[2, 3])),
        ]);
        let (offsets, total) = real_offsets(&ins);
        assert_eq!(offsets["x"], 0);
        assert_eq!(offsets["y"], 2);
        assert_eq!(total, 8);
        assert_eq!(batch_shape(&ins), vec![3, 4]);
        assert_eq!(int_inputs(&ins).len(), 2);
        assert_eq!(real_inputs(&ins).keys().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_merge_conflict() {
        let mut a = inputs([("x", Domain::real())]);
        let b = inputs([("x", Domain::reals(&[2]))]);
        assert!(matches!(
            merge_inputs(&mut a, &b),
            Err(FactorError::DomainMismatch { .. })
        ));
    }

    #[test]
    fn test_broadcast() {
        assert_eq!(broadcast_shapes(&[&[3, 1], &[4]]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[&[], &[2]]).unwrap(), vec![2]);
        assert!(broadcast_shapes(&[&[3], &[4]]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Domain::bint(3).to_string(), "Bint[3]");
        assert_eq!(Domain::real().to_string(), "Real");
        assert_eq!(Domain::reals(&[2]).to_string(), "Reals[2]");
    }
}
