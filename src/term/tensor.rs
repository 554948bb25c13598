//! Dense tensors indexed by integer inputs.
//!
//! A tensor's data has shape `batch + event`, where `batch` lists the sizes
//! of its integer inputs (in input order) and `event` is the shape of its
//! output domain. All inputs of a tensor are integer valued.

use std::collections::{BTreeSet, HashMap};

use ndarray::{Array1, ArrayD, Axis, IxDyn, Zip};

use crate::domain::{batch_shape, broadcast_shapes, merge_inputs, Domain, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::expand;
use crate::ops::{AssocOp, UnaryOp};

/// A dense array over named integer inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: ArrayD<f64>,
    inputs: Inputs,
    output: Domain,
}

fn position(inputs: &Inputs, name: &str) -> Result<usize> {
    inputs
        .get_index_of(name)
        .ok_or_else(|| FactorError::Precondition(format!("unknown input '{}'", name)))
}

/// Output domain of a pointwise binary operation.
pub(crate) fn binary_output(lhs: &Domain, rhs: &Domain) -> Result<Domain> {
    match (lhs, rhs) {
        (Domain::Bint(a), Domain::Bint(b)) => Ok(Domain::Bint(*a.max(b))),
        _ => Ok(Domain::Real(broadcast_shapes(&[lhs.shape(), rhs.shape()])?)),
    }
}

/// `value` as an element of `Bint[size]`.
pub(crate) fn int_value(value: f64, size: usize) -> Result<usize> {
    if !(value >= 0.0 && value.fract() == 0.0 && value < size as f64) {
        return Err(FactorError::Precondition(format!(
            "integer value {} outside Bint[{}]",
            value, size
        )));
    }
    Ok(value as usize)
}

impl Tensor {
    /// Real-valued tensor; the output shape is whatever trails the batch axes.
    pub fn new(data: ArrayD<f64>, inputs: Inputs) -> Result<Self> {
        let nb = inputs.len();
        if data.ndim() < nb {
            return Err(FactorError::shape(
                format!("at least {} axes", nb),
                format!("{:?}", data.shape()),
            ));
        }
        let output = Domain::Real(data.shape()[nb..].to_vec());
        Self::with_output(data, inputs, output)
    }

    /// Tensor with an explicit output domain (e.g. integer-valued indices).
    pub fn with_output(data: ArrayD<f64>, inputs: Inputs, output: Domain) -> Result<Self> {
        if let Some((name, domain)) = inputs.iter().find(|(_, d)| d.is_real()) {
            return Err(FactorError::Precondition(format!(
                "tensor input '{}' must be integer valued, found {}",
                name, domain
            )));
        }
        let mut expected = batch_shape(&inputs);
        expected.extend_from_slice(output.shape());
        if data.shape() != expected.as_slice() {
            return Err(FactorError::shape(
                format!("{:?}", expected),
                format!("{:?}", data.shape()),
            ));
        }
        Ok(Self {
            data,
            inputs,
            output,
        })
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            data: ndarray::arr0(value).into_dyn(),
            inputs: Inputs::new(),
            output: Domain::real(),
        }
    }

    /// `[0, 1, .., size)` indexed by `name` itself; renaming an integer
    /// input is substitution of this tensor.
    pub fn arange(name: &str, size: usize) -> Self {
        let data = Array1::from_iter((0..size).map(|i| i as f64)).into_dyn();
        let mut inputs = Inputs::new();
        inputs.insert(name.to_string(), Domain::Bint(size));
        Self {
            data,
            inputs,
            output: Domain::Bint(size),
        }
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn output(&self) -> &Domain {
        &self.output
    }

    pub fn batch_shape(&self) -> Vec<usize> {
        batch_shape(&self.inputs)
    }

    /// Data permuted to the order of `union` (a superset of this tensor's
    /// inputs); missing inputs become size-1 axes, or full size with `expand`.
    pub fn data_aligned_to(&self, union: &Inputs, expand_batch: bool) -> Result<ArrayD<f64>> {
        let n_old = self.inputs.len();
        let event_ndim = self.output.shape().len();
        let mut perm: Vec<usize> = union
            .keys()
            .filter_map(|k| self.inputs.get_index_of(k))
            .collect();
        if perm.len() != n_old {
            return Err(FactorError::Precondition(format!(
                "cannot align inputs {:?} to {:?}",
                self.inputs.keys().collect::<Vec<_>>(),
                union.keys().collect::<Vec<_>>()
            )));
        }
        perm.extend(n_old..n_old + event_ndim);
        let mut data = self.data.view().permuted_axes(perm).to_owned();
        for (pos, name) in union.keys().enumerate() {
            if !self.inputs.contains_key(name) {
                data = data.insert_axis(Axis(pos));
            }
        }
        if expand_batch {
            let mut shape = batch_shape(union);
            shape.extend_from_slice(self.output.shape());
            data = expand(&data, &shape)?;
        }
        Ok(data)
    }

    /// Reorder inputs so that `names` come first.
    pub fn align(&self, names: &[&str]) -> Result<Tensor> {
        let mut inputs = Inputs::new();
        for name in names {
            let domain = self.inputs.get(*name).ok_or_else(|| {
                FactorError::Precondition(format!("cannot align to unknown input '{}'", name))
            })?;
            inputs.insert(name.to_string(), domain.clone());
        }
        for (name, domain) in &self.inputs {
            if !inputs.contains_key(name) {
                inputs.insert(name.clone(), domain.clone());
            }
        }
        if inputs.keys().eq(self.inputs.keys()) {
            return Ok(self.clone());
        }
        let data = self.data_aligned_to(&inputs, false)?;
        Tensor::with_output(data, inputs, self.output.clone())
    }

    /// Pointwise `op` with broadcasting over inputs and event shapes.
    pub fn binary(op: AssocOp, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        let mut union = lhs.inputs.clone();
        merge_inputs(&mut union, &rhs.inputs)?;
        let mut a = lhs.data_aligned_to(&union, false)?;
        let mut b = rhs.data_aligned_to(&union, false)?;

        // Pad the shorter event so batch axes stay left aligned.
        let nb = union.len();
        let (ea, eb) = (lhs.output.shape().len(), rhs.output.shape().len());
        for _ in ea..eb {
            a = a.insert_axis(Axis(nb));
        }
        for _ in eb..ea {
            b = b.insert_axis(Axis(nb));
        }

        let shape = broadcast_shapes(&[a.shape(), b.shape()])?;
        let av = a
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| FactorError::shape(format!("{:?}", shape), format!("{:?}", a.shape())))?;
        let bv = b
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| FactorError::shape(format!("{:?}", shape), format!("{:?}", b.shape())))?;
        let data = Zip::from(av).and(bv).map_collect(|&x, &y| op.apply(x, y));
        let output = binary_output(&lhs.output, &rhs.output)?;
        if let Domain::Bint(size) = output {
            for &v in data.iter() {
                int_value(v, size)?;
            }
        }
        Tensor::with_output(data, union, output)
    }

    pub fn unary(&self, op: UnaryOp) -> Tensor {
        Tensor {
            data: self.data.mapv(|x| op.apply(x)),
            inputs: self.inputs.clone(),
            output: self.output.clone(),
        }
    }

    /// Reduce over a subset of inputs.
    pub fn reduce(&self, op: AssocOp, vars: &BTreeSet<String>) -> Result<Tensor> {
        if op.is_null() {
            return Err(FactorError::InvalidContraction(
                "cannot reduce with the null operator".into(),
            ));
        }
        let mut axes = Vec::with_capacity(vars.len());
        for name in vars {
            axes.push(position(&self.inputs, name)?);
        }
        axes.sort_unstable_by(|a, b| b.cmp(a));
        let mut data = self.data.clone();
        for axis in axes {
            data = data.map_axis(Axis(axis), |lane| op.fold(lane.iter().copied()));
        }
        let inputs: Inputs = self
            .inputs
            .iter()
            .filter(|(k, _)| !vars.contains(*k))
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();
        Tensor::with_output(data, inputs, self.output.clone())
    }

    /// Advanced indexing of integer inputs by integer-valued tensors.
    ///
    /// Each index tensor may carry its own inputs; these join the result's
    /// inputs, and an index input that coincides with a remaining input of
    /// `self` is shared (a diagonal).
    pub fn index(&self, subs: &[(String, Tensor)]) -> Result<Tensor> {
        let by_name: HashMap<&str, &Tensor> =
            subs.iter().map(|(k, v)| (k.as_str(), v)).collect();
        for (name, index) in subs {
            let domain = self.inputs.get(name).ok_or_else(|| {
                FactorError::Precondition(format!("cannot index unknown input '{}'", name))
            })?;
            if index.output != *domain {
                return Err(FactorError::DomainMismatch {
                    name: name.clone(),
                    expected: domain.clone(),
                    actual: index.output.clone(),
                });
            }
        }

        let mut new_inputs: Inputs = self
            .inputs
            .iter()
            .filter(|(k, _)| !by_name.contains_key(k.as_str()))
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();
        for (_, index) in subs {
            merge_inputs(&mut new_inputs, &index.inputs)?;
        }

        // Where each old axis reads its coordinate from.
        enum Source<'a> {
            Axis(usize),
            Index(&'a Tensor, Vec<usize>),
        }
        let mut sources = Vec::with_capacity(self.inputs.len());
        for name in self.inputs.keys() {
            match by_name.get(name.as_str()) {
                Some(index) => {
                    let positions = index
                        .inputs
                        .keys()
                        .map(|k| position(&new_inputs, k))
                        .collect::<Result<Vec<_>>>()?;
                    sources.push(Source::Index(index, positions));
                }
                None => sources.push(Source::Axis(position(&new_inputs, name)?)),
            }
        }

        let old_batch = self.batch_shape();
        let new_batch = batch_shape(&new_inputs);
        let event = self.output.num_elements();
        let flat: Vec<f64> = self.data.iter().copied().collect();
        let mut out = Vec::with_capacity(new_batch.iter().product::<usize>() * event);
        let mut old_idx = vec![0usize; old_batch.len()];
        let mut index_idx = Vec::new();

        for idx in ndarray::indices(IxDyn(&new_batch)) {
            for (slot, ((name, domain), source)) in
                old_idx.iter_mut().zip(self.inputs.iter().zip(&sources))
            {
                *slot = match source {
                    Source::Axis(p) => idx[*p],
                    Source::Index(index, positions) => {
                        index_idx.clear();
                        index_idx.extend(positions.iter().map(|&p| idx[p]));
                        let raw = index.data[IxDyn(&index_idx)];
                        let size = domain.size().unwrap_or(0);
                        if raw < 0.0 || raw.fract() != 0.0 || raw as usize >= size {
                            return Err(FactorError::IndexOutOfRange {
                                name: name.clone(),
                                index: raw as i64,
                                size,
                            });
                        }
                        raw as usize
                    }
                };
            }
            let offset = old_idx
                .iter()
                .zip(&old_batch)
                .fold(0, |acc, (&i, &n)| acc * n + i);
            out.extend_from_slice(&flat[offset * event..(offset + 1) * event]);
        }

        let mut shape = new_batch;
        shape.extend_from_slice(self.output.shape());
        let data = ArrayD::from_shape_vec(IxDyn(&shape), out)
            .map_err(|e| FactorError::Precondition(e.to_string()))?;
        Tensor::with_output(data, new_inputs, self.output.clone())
    }
}

/// Align several tensors to the union of their inputs.
///
/// Returns the union and each tensor's data laid out as
/// `union batch + own event`, broadcast to full size when `expand`.
pub fn align_tensors(tensors: &[&Tensor], expand_batch: bool) -> Result<(Inputs, Vec<ArrayD<f64>>)> {
    let mut union = Inputs::new();
    for t in tensors {
        merge_inputs(&mut union, &t.inputs)?;
    }
    let data = tensors
        .iter()
        .map(|t| t.data_aligned_to(&union, expand_batch))
        .collect::<Result<Vec<_>>>()?;
    Ok((union, data))
}
