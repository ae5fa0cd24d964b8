use std::path::Path;

use ndarray::{s, Array1, Array2, ArrayView2, Axis, Ix1, Ix2};

use crate::io::npz::{NpzBundle, NpzOut};
use crate::linalg::{generalized_symmetric_eigen, spd_inverse};
use crate::DiarizeError;

/// Two-covariance PLDA model in its diagonalising space.
///
/// `tr` maps centred embeddings into a space where the within-class
/// covariance is identity and the across-class covariance is `diag(psi)`.
#[derive(Debug, Clone)]
pub struct Plda {
    /// Global mean, length D.
    pub mu: Array1<f64>,
    /// Diagonalising transform, D' × D (rows are output dimensions).
    pub tr: Array2<f64>,
    /// Across-class variances, length D'.
    pub psi: Array1<f64>,
}

impl Plda {
    pub fn new(mu: Array1<f64>, tr: Array2<f64>, psi: Array1<f64>) -> Result<Self, DiarizeError> {
        if tr.ncols() != mu.len() {
            return Err(DiarizeError::DimensionMismatch {
                expected: mu.len(),
                got: tr.ncols(),
            });
        }
        if tr.nrows() != psi.len() {
            return Err(DiarizeError::DimensionMismatch {
                expected: psi.len(),
                got: tr.nrows(),
            });
        }
        if psi.iter().any(|&p| !(p >= 0.0)) {
            return Err(DiarizeError::Config("PLDA psi must be non-negative".into()));
        }
        Ok(Self { mu, tr, psi })
    }

    /// Identity-transform model with a constant across-class variance.
    pub fn isotropic(dim: usize, psi: f64) -> Result<Self, DiarizeError> {
        Self::new(Array1::zeros(dim), Array2::eye(dim), Array1::from_elem(dim, psi))
    }

    /// Loads `mu`, `tr` and `psi` from an `.npz` bundle.
    pub fn load(path: &Path) -> Result<Self, DiarizeError> {
        let mut npz = NpzBundle::open(path)?;
        let mu = npz.array::<Ix1>("mu")?;
        let tr = npz.array::<Ix2>("tr")?;
        let psi = npz.array::<Ix1>("psi")?;
        Self::new(mu, tr, psi)
    }

    pub fn save(&self, path: &Path) -> Result<(), DiarizeError> {
        let mut out = NpzOut::create(path)?;
        out.add("mu", &self.mu)?;
        out.add("tr", &self.tr)?;
        out.add("psi", &self.psi)?;
        out.finish()
    }

    pub fn dim(&self) -> usize {
        self.mu.len()
    }

    /// Projects rows of `x` into the PLDA space: `(x − mu) · trᵀ`.
    pub fn project(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, DiarizeError> {
        if x.ncols() != self.dim() {
            return Err(DiarizeError::DimensionMismatch {
                expected: self.dim(),
                got: x.ncols(),
            });
        }
        Ok((&x - &self.mu).dot(&self.tr.t()))
    }

    /// Re-derives the transform so that across-class variances come out
    /// sorted in descending order, as needed to truncate to the leading
    /// `lda_dim` dimensions for VB-HMM features.
    ///
    /// Solves `B·v = λ·W·v` with `W = (trᵀ·tr)⁻¹` and
    /// `B = (trᵀ·diag(psi)⁻¹·tr)⁻¹`.
    pub fn sorted_by_variance(&self) -> Result<Self, DiarizeError> {
        let (rows, cols) = self.tr.dim();
        if rows != cols {
            return Err(DiarizeError::DimensionMismatch {
                expected: cols,
                got: rows,
            });
        }
        let w = spd_inverse(self.tr.t().dot(&self.tr).view())?;
        let inv_psi = self.psi.mapv(|p| 1.0 / p.max(f64::MIN_POSITIVE));
        let scaled = &self.tr * &inv_psi.insert_axis(Axis(1));
        let b = spd_inverse(self.tr.t().dot(&scaled).view())?;
        let eig = generalized_symmetric_eigen(b.view(), w.view())?;

        let psi: Array1<f64> = eig.values.iter().rev().copied().collect();
        let tr = eig.vectors.t().slice(s![..;-1, ..]).to_owned();
        Self::new(self.mu.clone(), tr, psi)
    }

    /// VB-HMM features: the first `lda_dim` PLDA-space coordinates.
    pub fn features(&self, x: ArrayView2<f64>, lda_dim: usize) -> Result<Array2<f64>, DiarizeError> {
        let y = self.project(x)?;
        let d = lda_dim.min(y.ncols());
        Ok(y.slice(s![.., ..d]).to_owned())
    }
}
