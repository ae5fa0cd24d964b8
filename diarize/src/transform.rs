use std::path::Path;

use ndarray::{Array1, Array2, ArrayView2, Ix1, Ix2};

use crate::io::npz::{NpzBundle, NpzOut};
use crate::linalg::l2_normalize_rows;
use crate::DiarizeError;

/// Centering + LDA projection applied to raw x-vectors before scoring:
/// `L2Norm(L2Norm(x − mean1) · lda − mean2)`.
#[derive(Debug, Clone)]
pub struct XvecTransform {
    /// Input-space mean, length D.
    pub mean1: Array1<f64>,
    /// Output-space mean, length D'.
    pub mean2: Array1<f64>,
    /// Projection, D × D'.
    pub lda: Array2<f64>,
}

impl XvecTransform {
    pub fn new(mean1: Array1<f64>, mean2: Array1<f64>, lda: Array2<f64>) -> Result<Self, DiarizeError> {
        if lda.nrows() != mean1.len() {
            return Err(DiarizeError::DimensionMismatch {
                expected: mean1.len(),
                got: lda.nrows(),
            });
        }
        if lda.ncols() != mean2.len() {
            return Err(DiarizeError::DimensionMismatch {
                expected: mean2.len(),
                got: lda.ncols(),
            });
        }
        Ok(Self { mean1, mean2, lda })
    }

    /// Loads the `mean1`, `mean2` and `lda` entries of an `.npz` bundle.
    pub fn load(path: &Path) -> Result<Self, DiarizeError> {
        let mut npz = NpzBundle::open(path)?;
        let mean1 = npz.array::<Ix1>("mean1")?;
        let mean2 = npz.array::<Ix1>("mean2")?;
        let lda = npz.array::<Ix2>("lda")?;
        Self::new(mean1, mean2, lda)
    }

    pub fn save(&self, path: &Path) -> Result<(), DiarizeError> {
        let mut out = NpzOut::create(path)?;
        out.add("mean1", &self.mean1)?;
        out.add("mean2", &self.mean2)?;
        out.add("lda", &self.lda)?;
        out.finish()
    }

    pub fn input_dim(&self) -> usize {
        self.mean1.len()
    }

    pub fn output_dim(&self) -> usize {
        self.mean2.len()
    }

    /// Transforms every row of `x` (N × D) into an N × D' matrix.
    pub fn apply(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, DiarizeError> {
        if x.ncols() != self.input_dim() {
            return Err(DiarizeError::DimensionMismatch {
                expected: self.input_dim(),
                got: x.ncols(),
            });
        }
        let mut centered = &x - &self.mean1;
        l2_normalize_rows(&mut centered);
        let mut out = centered.dot(&self.lda) - &self.mean2;
        l2_normalize_rows(&mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn identity_transform(dim: usize) -> XvecTransform {
        XvecTransform::new(Array1::zeros(dim), Array1::zeros(dim), Array2::eye(dim)).unwrap()
    }

    #[test]
    fn identity_only_normalizes() {
        let t = identity_transform(2);
        let out = t.apply(array![[3.0, 4.0], [0.0, 2.0]].view()).unwrap();
        assert!((out[[0, 0]] - 0.6).abs() < 1e-12);
        assert!((out[[0, 1]] - 0.8).abs() < 1e-12);
        assert!((out[[1, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn projects_to_output_dim() {
        let t = XvecTransform::new(
            array![1.0, 1.0, 1.0],
            array![0.0],
            array![[1.0], [0.0], [0.0]],
        )
        .unwrap();
        let out = t.apply(array![[3.0, 1.0, 1.0], [-1.0, 1.0, 1.0]].view()).unwrap();
        assert_eq!(out.dim(), (2, 1));
        assert!((out[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((out[[1, 0]] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_wrong_dims() {
        let err = XvecTransform::new(array![0.0, 0.0], array![0.0], Array2::zeros((3, 1))).unwrap_err();
        assert!(matches!(err, DiarizeError::DimensionMismatch { expected: 2, got: 3 }));
        let t = identity_transform(2);
        assert!(t.apply(Array2::zeros((1, 3)).view()).is_err());
    }

    #[test]
    fn npz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transform.npz");
        let t = XvecTransform::new(array![0.5, -0.5], array![0.1], array![[1.0], [2.0]]).unwrap();
        t.save(&path).unwrap();
        let back = XvecTransform::load(&path).unwrap();
        assert_eq!(back.mean1, t.mean1);
        assert_eq!(back.mean2, t.mean2);
        assert_eq!(back.lda, t.lda);
    }
}
