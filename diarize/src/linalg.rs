//! Small dense linear-algebra and log-domain primitives.
//!
//! Everything here works on `f64` ndarray matrices of the sizes that show
//! up in diarization: affinity matrices of a few thousand rows at most,
//! and R×R subspace precisions with R ≤ a few hundred.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::DiarizeError;

/// Smallest pivot accepted by [`cholesky`]. Smaller (or negative) pivots
/// from rank-deficient input are clamped to this value.
const PIVOT_FLOOR: f64 = 1e-300;

/// Maximum QL iterations per eigenvalue before giving up.
const MAX_QL_ITERS: usize = 60;

/// Computes `ln(sum(exp(xs)))` without overflow.
///
/// `-inf` entries are valid "impossible" events: an all `-inf` input
/// returns `-inf` instead of NaN.
pub fn logsumexp<I>(xs: I) -> f64
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let iter = xs.into_iter();
    let max = iter.clone().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = iter.map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// [`logsumexp`] over a 1-D view.
pub fn logsumexp_view(xs: ArrayView1<f64>) -> f64 {
    logsumexp(xs.iter().copied())
}

/// Natural log that maps zero to `-inf` instead of producing a warning value.
pub fn ln_or_neg_inf(x: f64) -> f64 {
    if x > 0.0 { x.ln() } else { f64::NEG_INFINITY }
}

/// Lower Cholesky factor `L` with `A = L·Lᵀ`.
///
/// Non-positive pivots (singular or slightly indefinite input) are floored
/// so callers get a finite, very negative log-determinant instead of NaN.
pub fn cholesky(a: ArrayView2<f64>) -> Result<Array2<f64>, DiarizeError> {
    let n = square_dim(a)?;
    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if diag.is_nan() {
            return Err(DiarizeError::Numerical("NaN pivot in cholesky".into()));
        }
        let ljj = diag.max(PIVOT_FLOOR).sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / ljj;
        }
    }
    Ok(l)
}

/// Log-determinant of a symmetric positive-definite matrix.
pub fn logdet(a: ArrayView2<f64>) -> Result<f64, DiarizeError> {
    let l = cholesky(a)?;
    Ok(2.0 * l.diag().iter().map(|d| d.ln()).sum::<f64>())
}

/// Inverse of a lower-triangular matrix by forward substitution.
pub fn lower_triangular_inverse(l: ArrayView2<f64>) -> Result<Array2<f64>, DiarizeError> {
    let n = square_dim(l)?;
    let mut inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        for i in col..n {
            let mut s = if i == col { 1.0 } else { 0.0 };
            for k in col..i {
                s -= l[[i, k]] * inv[[k, col]];
            }
            inv[[i, col]] = s / l[[i, i]];
        }
    }
    Ok(inv)
}

/// Inverse of a symmetric positive-definite matrix via its Cholesky factor.
pub fn spd_inverse(a: ArrayView2<f64>) -> Result<Array2<f64>, DiarizeError> {
    let l = cholesky(a)?;
    let li = lower_triangular_inverse(l.view())?;
    Ok(li.t().dot(&li))
}

/// Eigen-decomposition of a symmetric matrix.
pub struct SymmetricEigen {
    /// Eigenvalues in ascending order.
    pub values: Array1<f64>,
    /// Orthonormal eigenvectors, one per column, matching `values`.
    pub vectors: Array2<f64>,
}

/// Symmetric eigen-decomposition by Householder tridiagonalisation followed
/// by implicit QL iterations.
///
/// Only the lower triangle is trusted; the input is symmetrised first so
/// near-symmetric PLDA score matrices are accepted.
pub fn symmetric_eigen(a: ArrayView2<f64>) -> Result<SymmetricEigen, DiarizeError> {
    let n = square_dim(a)?;
    if n == 0 {
        return Ok(SymmetricEigen {
            values: Array1::zeros(0),
            vectors: Array2::zeros((0, 0)),
        });
    }
    let mut v = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            v[[i, j]] = 0.5 * (a[[i, j]] + a[[j, i]]);
        }
    }
    let mut d = vec![0.0; n];
    let mut e = vec![0.0; n];
    tridiagonalize(&mut v, &mut d, &mut e);
    tridiagonal_ql(&mut v, &mut d, &mut e)?;
    Ok(SymmetricEigen {
        values: Array1::from(d),
        vectors: v,
    })
}

/// Solves the generalised problem `B·x = λ·W·x` for symmetric `B` and
/// symmetric positive-definite `W`.
///
/// Eigenvectors are W-orthonormal (`Xᵀ·W·X = I`), eigenvalues ascending.
pub fn generalized_symmetric_eigen(
    b: ArrayView2<f64>,
    w: ArrayView2<f64>,
) -> Result<SymmetricEigen, DiarizeError> {
    let n = square_dim(b)?;
    let nw = square_dim(w)?;
    if n != nw {
        return Err(DiarizeError::DimensionMismatch {
            expected: n,
            got: nw,
        });
    }
    let l = cholesky(w)?;
    let li = lower_triangular_inverse(l.view())?;
    let c = li.dot(&b).dot(&li.t());
    let eig = symmetric_eigen(c.view())?;
    Ok(SymmetricEigen {
        values: eig.values,
        vectors: li.t().dot(&eig.vectors),
    })
}

/// Row-wise softmax of `scale · x`.
pub fn softmax_rows(x: ArrayView2<f64>, scale: f64) -> Array2<f64> {
    let mut out = x.mapv(|v| v * scale);
    for mut row in out.axis_iter_mut(Axis(0)) {
        let lse = logsumexp(row.iter().copied());
        row.mapv_inplace(|v| (v - lse).exp());
    }
    out
}

/// Scales each row to unit L2 norm. Zero rows are left untouched.
pub fn l2_normalize_rows(x: &mut Array2<f64>) {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(xs: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate() {
        if x > xs[best] {
            best = i;
        }
    }
    best
}

fn square_dim(a: ArrayView2<f64>) -> Result<usize, DiarizeError> {
    let (r, c) = a.dim();
    if r != c {
        return Err(DiarizeError::DimensionMismatch {
            expected: r,
            got: c,
        });
    }
    Ok(r)
}

// Householder reduction to tridiagonal form. On return `d` holds the
// diagonal, `e[1..]` the sub-diagonal and `v` the accumulated transform.
fn tridiagonalize(v: &mut Array2<f64>, d: &mut [f64], e: &mut [f64]) {
    let n = d.len();
    for j in 0..n {
        d[j] = v[[n - 1, j]];
    }

    for i in (1..n).rev() {
        let mut scale = 0.0;
        let mut h = 0.0;
        for dk in d.iter().take(i) {
            scale += dk.abs();
        }
        if scale == 0.0 {
            e[i] = d[i - 1];
            for j in 0..i {
                d[j] = v[[i - 1, j]];
                v[[i, j]] = 0.0;
                v[[j, i]] = 0.0;
            }
        } else {
            for dk in d.iter_mut().take(i) {
                *dk /= scale;
                h += *dk * *dk;
            }
            let mut f = d[i - 1];
            let mut g = h.sqrt();
            if f > 0.0 {
                g = -g;
            }
            e[i] = scale * g;
            h -= f * g;
            d[i - 1] = f - g;
            for ej in e.iter_mut().take(i) {
                *ej = 0.0;
            }

            for j in 0..i {
                f = d[j];
                v[[j, i]] = f;
                g = e[j] + v[[j, j]] * f;
                for k in (j + 1)..i {
                    g += v[[k, j]] * d[k];
                    e[k] += v[[k, j]] * f;
                }
                e[j] = g;
            }
            f = 0.0;
            for j in 0..i {
                e[j] /= h;
                f += e[j] * d[j];
            }
            let hh = f / (h + h);
            for j in 0..i {
                e[j] -= hh * d[j];
            }
            for j in 0..i {
                f = d[j];
                g = e[j];
                for k in j..i {
                    v[[k, j]] -= f * e[k] + g * d[k];
                }
                d[j] = v[[i - 1, j]];
                v[[i, j]] = 0.0;
            }
        }
        d[i] = h;
    }

    for i in 0..(n - 1) {
        v[[n - 1, i]] = v[[i, i]];
        v[[i, i]] = 1.0;
        let h = d[i + 1];
        if h != 0.0 {
            for k in 0..=i {
                d[k] = v[[k, i + 1]] / h;
            }
            for j in 0..=i {
                let mut g = 0.0;
                for k in 0..=i {
                    g += v[[k, i + 1]] * v[[k, j]];
                }
                for k in 0..=i {
                    v[[k, j]] -= g * d[k];
                }
            }
        }
        for k in 0..=i {
            v[[k, i + 1]] = 0.0;
        }
    }
    for j in 0..n {
        d[j] = v[[n - 1, j]];
        v[[n - 1, j]] = 0.0;
    }
    v[[n - 1, n - 1]] = 1.0;
    e[0] = 0.0;
}

// Implicit QL on the tridiagonal matrix, then ascending sort.
fn tridiagonal_ql(v: &mut Array2<f64>, d: &mut [f64], e: &mut [f64]) -> Result<(), DiarizeError> {
    let n = d.len();
    for i in 1..n {
        e[i - 1] = e[i];
    }
    e[n - 1] = 0.0;

    let eps = f64::EPSILON;
    let mut f = 0.0;
    let mut tst1: f64 = 0.0;
    for l in 0..n {
        tst1 = tst1.max(d[l].abs() + e[l].abs());
        let mut m = l;
        while m < n {
            if e[m].abs() <= eps * tst1 {
                break;
            }
            m += 1;
        }
        if m == n {
            m = n - 1;
        }

        if m > l {
            let mut iter = 0;
            loop {
                iter += 1;
                if iter > MAX_QL_ITERS {
                    return Err(DiarizeError::Numerical(
                        "symmetric eigen decomposition did not converge".into(),
                    ));
                }
                let mut g = d[l];
                let mut p = (d[l + 1] - g) / (2.0 * e[l]);
                let mut r = p.hypot(1.0);
                if p < 0.0 {
                    r = -r;
                }
                d[l] = e[l] / (p + r);
                d[l + 1] = e[l] * (p + r);
                let dl1 = d[l + 1];
                let mut h = g - d[l];
                for di in d.iter_mut().skip(l + 2) {
                    *di -= h;
                }
                f += h;

                p = d[m];
                let mut c = 1.0;
                let mut c2 = c;
                let mut c3 = c;
                let el1 = e[l + 1];
                let mut s = 0.0;
                let mut s2 = 0.0;
                for i in (l..m).rev() {
                    c3 = c2;
                    c2 = c;
                    s2 = s;
                    g = c * e[i];
                    h = c * p;
                    r = p.hypot(e[i]);
                    e[i + 1] = s * r;
                    s = e[i] / r;
                    c = p / r;
                    p = c * d[i] - s * g;
                    d[i + 1] = h + s * (c * g + s * d[i]);
                    for k in 0..n {
                        h = v[[k, i + 1]];
                        v[[k, i + 1]] = s * v[[k, i]] + c * h;
                        v[[k, i]] = c * v[[k, i]] - s * h;
                    }
                }
                p = -s * s2 * c3 * el1 * e[l] / dl1;
                e[l] = s * p;
                d[l] = c * p;
                if e[l].abs() <= eps * tst1 || e[l].is_nan() {
                    break;
                }
            }
        }
        d[l] += f;
        e[l] = 0.0;
    }

    for i in 0..n.saturating_sub(1) {
        let mut k = i;
        let mut p = d[i];
        for (j, &dj) in d.iter().enumerate().skip(i + 1) {
            if dj < p {
                k = j;
                p = dj;
            }
        }
        if k != i {
            d[k] = d[i];
            d[i] = p;
            for row in 0..n {
                v.swap([row, i], [row, k]);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn logsumexp_matches_naive() {
        let xs = [0.1, -2.0, 3.5];
        let naive = xs.iter().map(|x: &f64| x.exp()).sum::<f64>().ln();
        assert!((logsumexp(xs) - naive).abs() < 1e-12);
    }

    #[test]
    fn logsumexp_handles_neg_inf() {
        assert_eq!(logsumexp([f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        let v = logsumexp([f64::NEG_INFINITY, 0.0]);
        assert!(v.abs() < 1e-12, "got {v}");
        assert_eq!(logsumexp(std::iter::empty::<f64>()), f64::NEG_INFINITY);
    }

    #[test]
    fn logsumexp_large_values_do_not_overflow() {
        let v = logsumexp([1000.0, 1000.0]);
        assert!((v - (1000.0 + 2f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn cholesky_reconstructs() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]];
        let l = cholesky(a.view()).unwrap();
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn logdet_diagonal() {
        let a = array![[2.0, 0.0], [0.0, 8.0]];
        assert!((logdet(a.view()).unwrap() - 16f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn logdet_singular_is_finite() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let ld = logdet(a.view()).unwrap();
        assert!(ld.is_finite());
        assert!(ld < -100.0);
    }

    #[test]
    fn spd_inverse_identity_product() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = spd_inverse(a.view()).unwrap();
        let prod = a.dot(&inv);
        assert!((prod[[0, 0]] - 1.0).abs() < 1e-12);
        assert!(prod[[0, 1]].abs() < 1e-12);
        assert!((prod[[1, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn eigen_of_known_matrix() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let eig = symmetric_eigen(a.view()).unwrap();
        assert!((eig.values[0] - 1.0).abs() < 1e-10);
        assert!((eig.values[1] - 3.0).abs() < 1e-10);
        for k in 0..2 {
            let v = eig.vectors.column(k);
            let av = a.dot(&v);
            for i in 0..2 {
                assert!((av[i] - eig.values[k] * v[i]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn eigen_reconstructs_random_symmetric() {
        let n = 7;
        let mut a = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..=i {
                let v = ((i * 31 + j * 17) % 11) as f64 / 5.0 - 1.0;
                a[[i, j]] = v;
                a[[j, i]] = v;
            }
        }
        let eig = symmetric_eigen(a.view()).unwrap();
        let lambda = Array2::from_diag(&eig.values);
        let back = eig.vectors.dot(&lambda).dot(&eig.vectors.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-9, "{x} vs {y}");
        }
        for w in eig.values.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn eigen_single_element() {
        let a = array![[5.0]];
        let eig = symmetric_eigen(a.view()).unwrap();
        assert_eq!(eig.values[0], 5.0);
        assert_eq!(eig.vectors[[0, 0]], 1.0);
    }

    #[test]
    fn generalized_eigen_satisfies_equation() {
        let b = array![[2.0, 0.5], [0.5, 1.0]];
        let w = array![[3.0, 0.2], [0.2, 1.5]];
        let eig = generalized_symmetric_eigen(b.view(), w.view()).unwrap();
        for k in 0..2 {
            let x = eig.vectors.column(k);
            let lhs = b.dot(&x);
            let rhs = w.dot(&x) * eig.values[k];
            for i in 0..2 {
                assert!((lhs[i] - rhs[i]).abs() < 1e-10);
            }
        }
        let gram = eig.vectors.t().dot(&w).dot(&eig.vectors);
        assert!((gram[[0, 0]] - 1.0).abs() < 1e-10);
        assert!(gram[[0, 1]].abs() < 1e-10);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let s = softmax_rows(x.view(), 5.0);
        for row in s.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!(s[[0, 0]] > 0.9);
    }

    #[test]
    fn argmax_first_on_ties() {
        let x = array![0.2, 0.7, 0.7];
        assert_eq!(argmax(x.view()), 1);
    }
}
