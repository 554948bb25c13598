//! Point masses.

use std::collections::BTreeSet;

use ndarray::{ArrayD, Axis};

use super::tensor::Tensor;
use crate::domain::{Domain, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::reshape;
use crate::ops::{AssocOp, UnaryOp};

/// Absolute tolerance when comparing a value against a delta's point.
pub const DELTA_ATOL: f64 = 1e-6;

/// Log density of a Dirac mass: `0` at `point`, `-inf` elsewhere.
///
/// Inputs are the variable `name` followed by the point's integer inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct Delta {
    name: String,
    point: Tensor,
}

impl Delta {
    pub fn new(name: &str, point: Tensor) -> Result<Self> {
        if !point.output().is_real() {
            return Err(FactorError::Precondition(format!(
                "delta '{}' needs a real point, found {}",
                name,
                point.output()
            )));
        }
        if point.inputs().contains_key(name) {
            return Err(FactorError::NameConflict(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            point,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn point(&self) -> &Tensor {
        &self.point
    }

    pub fn inputs(&self) -> Inputs {
        let mut inputs = Inputs::new();
        inputs.insert(self.name.clone(), self.point.output().clone());
        for (k, d) in self.point.inputs() {
            inputs.insert(k.clone(), d.clone());
        }
        inputs
    }

    pub fn align(&self, names: &[&str]) -> Result<Delta> {
        let own: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| *n != self.name)
            .collect();
        Ok(Self {
            name: self.name.clone(),
            point: self.point.align(&own)?,
        })
    }

    pub fn rename(&self, name: &str) -> Result<Delta> {
        Delta::new(name, self.point.clone())
    }

    /// Index the point's integer inputs.
    pub fn index(&self, subs: &[(String, Tensor)]) -> Result<Delta> {
        Delta::new(&self.name, self.point.index(subs)?)
    }

    /// `0` where `value` matches the point, `-inf` elsewhere.
    pub fn log_density(&self, value: &Tensor) -> Result<Tensor> {
        let diff = Tensor::binary(AssocOp::Add, value, &self.point.unary(UnaryOp::Neg))?;
        let nb = diff.inputs().len();
        let batch = diff.batch_shape();
        let mut flat_shape = batch.clone();
        flat_shape.push(self.point.output().num_elements());
        let flat = reshape(diff.data(), &flat_shape)?;
        let data: ArrayD<f64> = flat.map_axis(Axis(nb), |lane| {
            if lane.iter().all(|d| d.abs() <= DELTA_ATOL) {
                0.0
            } else {
                f64::NEG_INFINITY
            }
        });
        Tensor::new(data, diff.inputs().clone())
    }

    /// Integrate out `vars` under log-sum-exp.
    ///
    /// The mass integrates to one over its own variable, leaving zero over
    /// the point's integer inputs; those left in `vars` are then reduced
    /// like any tensor (each contributes `log size`). Returns `None` when
    /// `name` is not among `vars`.
    pub fn reduce_logaddexp(&self, vars: &BTreeSet<String>) -> Result<Option<Tensor>> {
        if !vars.contains(&self.name) {
            return Ok(None);
        }
        let zeros = ArrayD::zeros(ndarray::IxDyn(&self.point.batch_shape()));
        let zero = Tensor::with_output(zeros, self.point.inputs().clone(), Domain::real())?;
        let rest: BTreeSet<String> = vars
            .iter()
            .filter(|v| zero.inputs().contains_key(*v))
            .cloned()
            .collect();
        if rest.is_empty() {
            return Ok(Some(zero));
        }
        Ok(Some(zero.reduce(AssocOp::LogAddExp, &rest)?))
    }
}
