//! Substitution into a Gaussian.
//!
//! Values are bucketed by category and the first non-empty bucket is
//! handled here, in the order: variables (renames), integer values, real
//! values, affine expressions. Whatever is left is substituted into the
//! result, so later buckets see the already transformed factor. Values in
//! no bucket stay as a lazy substitution.

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, Axis, Slice};

use super::{Gaussian, GaussianParams};
use crate::affine::{extract_affine, is_affine, Affine};
use crate::domain::{batch_shape, int_inputs, real_inputs, real_offsets, Domain, Inputs};
use crate::error::{FactorError, Result};
use crate::linalg::{cat, eye, matmul, norm2, reshape, vm, BlockMatrix, BlockVector};
use crate::term::{align_tensors, Tensor, Term, TermKind};

type Bindings = Vec<(String, Term)>;

pub(crate) fn eager_subs(g: &Gaussian, subs: Bindings) -> Result<Term> {
    let mut var = Vec::new();
    let mut int = Vec::new();
    let mut real = Vec::new();
    let mut affine = Vec::new();
    let mut lazy = Vec::new();
    for (k, v) in subs {
        match v.kind() {
            TermKind::Variable(_) => var.push((k, v)),
            TermKind::Number(_) | TermKind::Tensor(_) if v.output().is_int() => int.push((k, v)),
            TermKind::Number(_) | TermKind::Tensor(_) => real.push((k, v)),
            _ if is_affine(&v) && !real_inputs(v.inputs()).is_empty() => affine.push((k, v)),
            _ => lazy.push((k, v)),
        }
    }

    if !var.is_empty() {
        let result = subs_var(g, &var)?;
        return then(result, [int, real, affine, lazy].concat());
    }
    if !int.is_empty() {
        let result = subs_int(g, &int)?;
        return then(result, [real, affine, lazy].concat());
    }
    if !real.is_empty() {
        let result = subs_real(g, &real)?;
        return then(result, [affine, lazy].concat());
    }
    if !affine.is_empty() {
        return subs_affine(g, affine, lazy);
    }
    Term::reflect_subs(Term::from_gaussian(g.clone()), lazy)
}

fn then(result: Term, remaining: Bindings) -> Result<Term> {
    if remaining.is_empty() {
        Ok(result)
    } else {
        result.substitute(remaining)
    }
}

fn value_tensor(name: &str, value: &Term) -> Result<Tensor> {
    value.to_tensor().ok_or_else(|| {
        FactorError::Precondition(format!("value for '{}' is not a tensor", name))
    })
}

/// Rename inputs, keeping the arrays.
fn subs_var(g: &Gaussian, subs: &[(String, Term)]) -> Result<Term> {
    let rename: HashMap<&str, &str> = subs
        .iter()
        .filter_map(|(k, v)| match v.kind() {
            TermKind::Variable(name) => Some((k.as_str(), name.as_str())),
            _ => None,
        })
        .collect();
    let inputs: Inputs = g
        .inputs()
        .iter()
        .map(|(k, d)| {
            let name = rename.get(k.as_str()).copied().unwrap_or(k.as_str());
            (name.to_string(), d.clone())
        })
        .collect();
    if inputs.len() != g.inputs().len() {
        let mut seen = HashSet::new();
        let clash = g
            .inputs()
            .keys()
            .map(|k| rename.get(k.as_str()).copied().unwrap_or(k.as_str()))
            .find(|name| !seen.insert(*name))
            .unwrap_or_default();
        return Err(FactorError::NameConflict(clash.to_string()));
    }
    Ok(Term::from_gaussian(g.renamed(inputs)))
}

/// Slice batch axes as if the arrays were tensors over the integer inputs.
fn subs_int(g: &Gaussian, subs: &[(String, Term)]) -> Result<Term> {
    let index = subs
        .iter()
        .map(|(k, v)| Ok((k.clone(), value_tensor(k, v)?)))
        .collect::<Result<Vec<_>>>()?;
    let ints = int_inputs(g.inputs());
    let (rank, dim) = (g.rank(), g.dim());
    let white = Tensor::with_output(g.white_vec().clone(), ints.clone(), Domain::reals(&[rank]))?
        .index(&index)?;
    let prec = Tensor::with_output(g.prec_sqrt().clone(), ints, Domain::reals(&[dim, rank]))?
        .index(&index)?;
    let mut inputs = white.inputs().clone();
    inputs.extend(real_inputs(g.inputs()));
    let gaussian = Gaussian::new(white.into_data(), prec.into_data(), inputs, g.negate())?;
    Ok(Term::from_gaussian(gaussian))
}

/// Rows of `prec_sqrt` belonging to `range` of the real dimension.
fn rows(prec_sqrt: &ArrayD<f64>, start: usize, size: usize) -> ArrayD<f64> {
    let axis = prec_sqrt.ndim() - 2;
    prec_sqrt
        .slice_axis(Axis(axis), Slice::from(start..start + size))
        .to_owned()
}

/// Plug in concrete real values: a tensor when every real input is given,
/// otherwise a Gaussian over the rest.
fn subs_real(g: &Gaussian, subs: &[(String, Term)]) -> Result<Term> {
    let ints = int_inputs(g.inputs());
    let (rank, dim) = (g.rank(), g.dim());
    let white = Tensor::with_output(g.white_vec().clone(), ints.clone(), Domain::reals(&[rank]))?;
    let prec = Tensor::with_output(g.prec_sqrt().clone(), ints, Domain::reals(&[dim, rank]))?;
    let values = subs
        .iter()
        .map(|(k, v)| value_tensor(k, v))
        .collect::<Result<Vec<_>>>()?;

    let mut refs = vec![&white, &prec];
    refs.extend(values.iter());
    let (new_ints, arrays) = align_tensors(&refs, true)?;
    let batch = batch_shape(&new_ints);
    let mut arrays = arrays.into_iter();
    let (white_vec, prec_sqrt) = match (arrays.next(), arrays.next()) {
        (Some(w), Some(p)) => (w, p),
        _ => return Err(FactorError::Precondition("missing gaussian arrays".into())),
    };
    let mut flat: HashMap<&str, ArrayD<f64>> = HashMap::new();
    for ((k, _), value) in subs.iter().zip(arrays) {
        let mut shape = batch.clone();
        shape.push(g.inputs()[k].num_elements());
        flat.insert(k.as_str(), reshape(&value, &shape)?);
    }

    let (offsets, event_size) = real_offsets(g.inputs());
    if offsets.keys().all(|k| flat.contains_key(k.as_str())) {
        let mut shape = batch.clone();
        shape.push(event_size);
        let mut value = BlockVector::new(&shape);
        for (k, &offset) in &offsets {
            let size = g.inputs()[k].num_elements();
            if let Some(v) = flat.remove(k.as_str()) {
                value.set(offset..offset + size, v);
            }
        }
        let residual = vm(&value.finish()?, &prec_sqrt)? - &white_vec;
        let scale = if g.negate() { 0.5 } else { -0.5 };
        let log_density = norm2(&residual) * scale;
        return Ok(Term::from_tensor(Tensor::new(log_density, new_ints)?));
    }

    // -1/2 || xa Pa + xb Pb - w ||^2 = G(xa; w - xb Pb, Pa)
    let mut prec_a = Vec::new();
    let mut prec_b = Vec::new();
    let mut value_b = Vec::new();
    for (k, &offset) in &offsets {
        let size = g.inputs()[k].num_elements();
        match flat.remove(k.as_str()) {
            Some(v) => {
                prec_b.push(rows(&prec_sqrt, offset, size));
                value_b.push(v);
            }
            None => prec_a.push(rows(&prec_sqrt, offset, size)),
        }
    }
    let prec_a = cat(&prec_a, 2)?;
    let prec_b = cat(&prec_b, 2)?;
    let value_b = cat(&value_b, 1)?;
    let white_a = white_vec - vm(&value_b, &prec_b)?;

    let mut inputs = new_ints;
    for (k, d) in g.inputs() {
        if d.is_real() && !subs.iter().any(|(name, _)| name == k) {
            inputs.insert(k.clone(), d.clone());
        }
    }
    Term::gaussian(
        GaussianParams::Srif {
            white_vec: white_a,
            prec_sqrt: prec_a,
        },
        inputs,
        g.negate(),
    )
}

/// Substitute `x = b + y A` for affine expressions of other reals.
///
/// `G(y A + b; w, P) = G(y; w - b P, A P)`.
fn subs_affine(g: &Gaussian, subs: Bindings, mut lazy: Bindings) -> Result<Term> {
    let mut affine: Vec<(String, Affine)> = Vec::new();
    for (k, v) in subs {
        match extract_affine(&v)? {
            Some(a) => affine.push((k, a)),
            None => lazy.push((k, v)),
        }
    }
    if affine.is_empty() {
        return Term::reflect_subs(Term::from_gaussian(g.clone()), lazy);
    }

    // Integer axes.
    let ints = int_inputs(g.inputs());
    let (rank, dim) = (g.rank(), g.dim());
    let white = Tensor::with_output(g.white_vec().clone(), ints.clone(), Domain::reals(&[rank]))?;
    let prec = Tensor::with_output(g.prec_sqrt().clone(), ints, Domain::reals(&[dim, rank]))?;
    let mut refs = vec![&white, &prec];
    for (_, a) in &affine {
        refs.push(&a.constant);
        refs.extend(a.coeffs.values().map(|(_, c)| c));
    }
    let (new_ints, arrays) = align_tensors(&refs, true)?;
    let batch = batch_shape(&new_ints);
    let mut arrays = arrays.into_iter();
    let (white_vec, prec_sqrt) = match (arrays.next(), arrays.next()) {
        (Some(w), Some(p)) => (w, p),
        _ => return Err(FactorError::Precondition("missing gaussian arrays".into())),
    };
    let mut constants = HashMap::new();
    let mut coeffs: HashMap<(String, String), ArrayD<f64>> = HashMap::new();
    for (old_k, a) in &affine {
        if let Some(c) = arrays.next() {
            constants.insert(old_k.clone(), c);
        }
        for new_k in a.coeffs.keys() {
            if let Some(c) = arrays.next() {
                coeffs.insert((old_k.clone(), new_k.clone()), c);
            }
        }
    }

    // Real dimensions.
    let old_real = real_inputs(g.inputs());
    let substituted: HashSet<&str> = affine.iter().map(|(k, _)| k.as_str()).collect();
    let mut new_real = old_real.clone();
    for (old_k, _) in &affine {
        new_real.shift_remove(old_k);
    }
    for (_, a) in &affine {
        for (new_k, (domain, _)) in &a.coeffs {
            match new_real.get(new_k) {
                Some(existing) if existing != domain => {
                    return Err(FactorError::DomainMismatch {
                        name: new_k.clone(),
                        expected: existing.clone(),
                        actual: domain.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    new_real.insert(new_k.clone(), domain.clone());
                }
            }
        }
    }
    let (old_offsets, old_dim) = real_offsets(&old_real);
    let (new_offsets, new_dim) = real_offsets(&new_real);

    let mut vector_shape = batch.clone();
    vector_shape.push(old_dim);
    let mut matrix_shape = batch.clone();
    matrix_shape.extend([new_dim, old_dim]);
    let mut subs_vector = BlockVector::new(&vector_shape);
    let mut subs_matrix = BlockMatrix::new(&matrix_shape);
    for (old_k, &old_offset) in &old_offsets {
        let old_size = old_real[old_k].num_elements();
        let old_range = old_offset..old_offset + old_size;
        if !substituted.contains(old_k.as_str()) {
            let new_offset = new_offsets[old_k];
            subs_matrix.set(new_offset..new_offset + old_size, old_range, eye(&batch, old_size)?);
            continue;
        }
        if let Some(c) = constants.remove(old_k) {
            let mut shape = batch.clone();
            shape.push(old_size);
            subs_vector.set(old_range.clone(), reshape(&c, &shape)?);
        }
        for (new_k, &new_offset) in &new_offsets {
            if let Some(c) = coeffs.remove(&(old_k.clone(), new_k.clone())) {
                let new_size = new_real[new_k].num_elements();
                let mut shape = batch.clone();
                shape.extend([new_size, old_size]);
                subs_matrix.set(
                    new_offset..new_offset + new_size,
                    old_range.clone(),
                    reshape(&c, &shape)?,
                );
            }
        }
    }

    let white_vec = white_vec - vm(&subs_vector.finish()?, &prec_sqrt)?;
    let prec_sqrt = matmul(&subs_matrix.finish()?, &prec_sqrt)?;
    let mut inputs = new_ints;
    inputs.extend(new_real);
    let result = Term::gaussian(GaussianParams::Srif { white_vec, prec_sqrt }, inputs, g.negate())?;
    then(result, lazy)
}
