use ndarray::{ArrayD, Axis, Slice};

use super::Gaussian;
use crate::domain::{int_inputs, real_offsets, Domain, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::{transpose, BlockVector};
use crate::term::Tensor;

/// Lay out a Gaussian's arrays for `new_inputs`, a superset of its inputs.
///
/// Integer inputs are aligned like tensor batch axes (size one unless
/// `expand`). Real inputs absent from the Gaussian get zero rows in
/// `prec_sqrt`, so the factor is constant along them.
pub fn align_gaussian(
    new_inputs: &Inputs,
    old: &Gaussian,
    expand: bool,
) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
    let mut white_vec = old.white_vec().clone();
    let mut prec_sqrt = old.prec_sqrt().clone();
    let rank = old.rank();
    let dim = old.dim();

    let new_ints = int_inputs(new_inputs);
    let old_ints = int_inputs(old.inputs());
    if !new_ints.iter().eq(old_ints.iter()) || expand {
        let white = Tensor::with_output(white_vec, old_ints.clone(), Domain::reals(&[rank]))?;
        let prec = Tensor::with_output(prec_sqrt, old_ints, Domain::reals(&[dim, rank]))?;
        white_vec = white.data_aligned_to(&new_ints, expand)?;
        prec_sqrt = prec.data_aligned_to(&new_ints, expand)?;
    }

    let (new_offsets, new_dim) = real_offsets(new_inputs);
    let (old_offsets, _) = real_offsets(old.inputs());
    if !new_offsets.iter().eq(old_offsets.iter()) {
        let old_pt = transpose(&prec_sqrt);
        let last = old_pt.ndim() - 1;
        let mut shape = old_pt.shape()[..last].to_vec();
        shape.push(new_dim);
        let mut block = BlockVector::new(&shape);
        for (name, &new_offset) in &new_offsets {
            let Some(&offset) = old_offsets.get(name) else {
                continue;
            };
            let size = old.inputs()[name].num_elements();
            if new_inputs[name] != old.inputs()[name] {
                return Err(FactorError::DomainMismatch {
                    name: name.clone(),
                    expected: new_inputs[name].clone(),
                    actual: old.inputs()[name].clone(),
                });
            }
            let part = old_pt
                .slice_axis(Axis(last), Slice::from(offset..offset + size))
                .to_owned();
            block.set(new_offset..new_offset + size, part);
        }
        prec_sqrt = transpose(&block.finish()?);
    }
    Ok((white_vec, prec_sqrt))
}
