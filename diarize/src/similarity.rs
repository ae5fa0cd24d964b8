//! Pairwise affinity between the embeddings of one recording.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::linalg::l2_normalize_rows;
use crate::plda::Plda;
use crate::DiarizeError;

/// Which score fills the affinity matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityKind {
    #[default]
    Cosine,
    Plda,
}

impl std::fmt::Display for SimilarityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimilarityKind::Cosine => write!(f, "cosine"),
            SimilarityKind::Plda => write!(f, "plda"),
        }
    }
}

impl std::str::FromStr for SimilarityKind {
    type Err = DiarizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityKind::Cosine),
            "plda" => Ok(SimilarityKind::Plda),
            _ => Err(DiarizeError::Config(format!("unknown similarity {s:?} (expected cosine or plda)"))),
        }
    }
}

/// Cosine similarity of every row pair.
pub fn cosine_similarity(x: ArrayView2<f64>) -> Array2<f64> {
    let mut normed = x.to_owned();
    l2_normalize_rows(&mut normed);
    normed.dot(&normed.t())
}

/// Dense PLDA log-likelihood-ratio scores of every row pair.
///
/// Rows are projected into the PLDA space and scored with the closed-form
/// two-covariance verification LLR:
///
/// ```text
/// s(i, j) = Σ_d Λ_d·y_id·y_jd + Σ_d Γ_d·(y_id² + y_jd²) + k
/// Λ = ψ / (1 + 2ψ)
/// Γ = −¼·(1/(1 + 2ψ) + 1 − 2/(1 + ψ))
/// k = −½·Σ ln(1 + 2ψ) + Σ ln(1 + ψ)
/// ```
pub fn plda_similarity(plda: &Plda, x: ArrayView2<f64>) -> Result<Array2<f64>, DiarizeError> {
    let y = plda.project(x)?;
    Ok(plda_llr(y.view(), y.view(), plda.psi.view()))
}

/// Affinity for `kind`; PLDA scoring requires a model.
pub fn affinity(
    x: ArrayView2<f64>,
    kind: SimilarityKind,
    plda: Option<&Plda>,
) -> Result<Array2<f64>, DiarizeError> {
    match (kind, plda) {
        (SimilarityKind::Cosine, _) => Ok(cosine_similarity(x)),
        (SimilarityKind::Plda, Some(p)) => plda_similarity(p, x),
        (SimilarityKind::Plda, None) => Err(DiarizeError::Config(
            "PLDA similarity requested without a PLDA model".into(),
        )),
    }
}

fn plda_llr(fe: ArrayView2<f64>, ft: ArrayView2<f64>, psi: ndarray::ArrayView1<f64>) -> Array2<f64> {
    let lambda: Array1<f64> = psi.mapv(|p| p / (1.0 + 2.0 * p));
    let gamma: Array1<f64> = psi.mapv(|p| -0.25 * (1.0 / (1.0 + 2.0 * p) + 1.0 - 2.0 / (1.0 + p)));
    let k = -0.5 * psi.iter().map(|p| (1.0 + 2.0 * p).ln()).sum::<f64>()
        + psi.iter().map(|p| (1.0 + p).ln()).sum::<f64>();

    let mut scores = (&fe * &lambda).dot(&ft.t());
    let qe = fe.mapv(|v| v * v).dot(&gamma);
    let qt = ft.mapv(|v| v * v).dot(&gamma);
    scores += &qe.insert_axis(Axis(1));
    scores += &qt.insert_axis(Axis(0));
    scores += k;
    scores
}
