//! Frame-level diarization error rate and cross-entropy with optimal
//! speaker mapping.

use ndarray::{Array2, ArrayView2};

use crate::linalg::argmax;
use crate::DiarizeError;

/// Expected (soft) or hard DER of posteriors `gamma` (T × S) against
/// 0-based reference speaker ids.
///
/// With `expected = false` each row is replaced by the one-hot of its
/// argmax first.
pub fn der(gamma: ArrayView2<f64>, reference: &[usize], expected: bool) -> Result<f64, DiarizeError> {
    check_lengths(gamma, reference)?;
    if reference.is_empty() {
        return Ok(0.0);
    }
    let gamma = if expected { gamma.to_owned() } else { one_hot(&hard_labels(gamma), gamma.ncols()) };
    let err = error_matrix(gamma.view(), reference, |q| q);
    let best = best_mapping(&err, f64::max, f64::NEG_INFINITY);
    let t = reference.len() as f64;
    Ok((t - best) / t)
}

/// Mean per-frame cross-entropy `−ln q` of the reference speaker under the
/// best speaker mapping.
pub fn xentropy(gamma: ArrayView2<f64>, reference: &[usize]) -> Result<f64, DiarizeError> {
    check_lengths(gamma, reference)?;
    if reference.is_empty() {
        return Ok(0.0);
    }
    let err = error_matrix(gamma, reference, |q| -q.max(f64::MIN_POSITIVE).ln());
    let best = best_mapping(&err, f64::min, f64::INFINITY);
    Ok(best / reference.len() as f64)
}

/// Argmax speaker per frame.
pub fn hard_labels(gamma: ArrayView2<f64>) -> Vec<usize> {
    gamma.rows().into_iter().map(argmax).collect()
}

/// `labels.len() × speakers` indicator matrix.
pub fn one_hot(labels: &[usize], speakers: usize) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((labels.len(), speakers));
    for (t, &l) in labels.iter().enumerate() {
        if l < speakers {
            out[[t, l]] = 1.0;
        }
    }
    out
}

fn check_lengths(gamma: ArrayView2<f64>, reference: &[usize]) -> Result<(), DiarizeError> {
    if gamma.nrows() != reference.len() {
        return Err(DiarizeError::DimensionMismatch {
            expected: reference.len(),
            got: gamma.nrows(),
        });
    }
    Ok(())
}

/// Reference × hypothesis matrix of `f(q)` summed over frames, transposed
/// when needed so that rows ≥ columns.
fn error_matrix(gamma: ArrayView2<f64>, reference: &[usize], f: impl Fn(f64) -> f64) -> Array2<f64> {
    let refs = reference.iter().copied().max().map_or(0, |m| m + 1);
    let mut err = Array2::<f64>::zeros((refs, gamma.ncols()));
    for (row, &r) in gamma.rows().into_iter().zip(reference) {
        for (h, &q) in row.iter().enumerate() {
            err[[r, h]] += f(q);
        }
    }
    if err.nrows() < err.ncols() { err.t().to_owned() } else { err }
}

/// Best total over injective assignments of columns to rows, by depth-first
/// search over all of them.
fn best_mapping(err: &Array2<f64>, pick: fn(f64, f64) -> f64, init: f64) -> f64 {
    fn walk(err: &Array2<f64>, col: usize, used: &mut [bool], acc: f64, pick: fn(f64, f64) -> f64, best: &mut f64) {
        if col == err.ncols() {
            *best = pick(*best, acc);
            return;
        }
        for r in 0..err.nrows() {
            if used[r] {
                continue;
            }
            used[r] = true;
            walk(err, col + 1, used, acc + err[[r, col]], pick, best);
            used[r] = false;
        }
    }
    let mut best = init;
    let mut used = vec![false; err.nrows()];
    walk(err, 0, &mut used, 0.0, pick, &mut best);
    best
}
