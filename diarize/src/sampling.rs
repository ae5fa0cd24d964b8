//! Seeded random draws used for posterior initialisation.
//!
//! Every caller owns its own [`StdRng`]; there is no process-wide random
//! state, so two recordings (or two restarts) never share a stream.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal};

use crate::DiarizeError;

/// Creates the generator for one unit of work.
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `rows × cols` matrix whose rows are independent Dirichlet(alpha) draws,
/// built from Gamma(alpha, 1) entries normalised per row.
pub fn dirichlet_rows<R: Rng + ?Sized>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    alpha: f64,
) -> Result<Array2<f64>, DiarizeError> {
    let gamma = Gamma::new(alpha, 1.0)
        .map_err(|e| DiarizeError::Config(format!("dirichlet concentration {alpha}: {e}")))?;
    let mut out = Array2::<f64>::zeros((rows, cols));
    for mut row in out.rows_mut() {
        row.mapv_inplace(|_| gamma.sample(rng));
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        } else {
            row.fill(1.0 / cols as f64);
        }
    }
    Ok(out)
}

/// `rows × cols` matrix of `N(mean, std²)` draws.
pub fn normal_matrix<R: Rng + ?Sized>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    mean: f64,
    std: f64,
) -> Result<Array2<f64>, DiarizeError> {
    let normal =
        Normal::new(mean, std).map_err(|e| DiarizeError::Config(format!("normal N({mean}, {std}²): {e}")))?;
    Ok(Array2::from_shape_simple_fn((rows, cols), || normal.sample(rng)))
}
