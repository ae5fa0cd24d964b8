//! Normalised-maximum-eigengap (NME) spectral clustering.
//!
//! For every neighbour count `p` in `[pmin, pmax]` the affinity matrix is
//! pruned to a binary p-nearest-neighbour graph, and the eigengap of its
//! normalised Laplacian yields a speaker count `k_p` and a quality ratio
//! `p / g_p`. The `p` with the smallest ratio wins and its spectral
//! embedding is clustered with k-means.

use std::collections::BTreeSet;

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kmeans::{sq_dist, KMeans};
use crate::linalg::{l2_normalize_rows, symmetric_eigen, SymmetricEigen};
use crate::stitch::Labels;
use crate::DiarizeError;

/// Added to the largest eigenvalue when normalising the eigengap.
const GAP_EPS: f64 = 1e-10;

/// NME search and clustering options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmeOptions {
    pub pmin: usize,
    pub pmax: usize,
    /// Upper bound on the eigengap speaker estimate.
    pub max_speakers: usize,
    /// Overrides the eigengap estimate when set.
    pub num_speakers: Option<usize>,
    pub kmeans_inits: usize,
    pub seed: u64,
}

impl Default for NmeOptions {
    fn default() -> Self {
        Self {
            pmin: 3,
            pmax: 20,
            max_speakers: 8,
            num_speakers: None,
            kmeans_inits: 10,
            seed: 3,
        }
    }
}

impl NmeOptions {
    pub fn validate(&self) -> Result<(), DiarizeError> {
        if self.pmax <= 1 {
            return Err(DiarizeError::Config(format!("pmax must be > 1, got {}", self.pmax)));
        }
        if self.pmin > self.pmax {
            return Err(DiarizeError::Config(format!(
                "pmin ({}) must not exceed pmax ({})",
                self.pmin, self.pmax
            )));
        }
        if self.max_speakers == 0 {
            return Err(DiarizeError::Config("max_speakers must be >= 1".into()));
        }
        if self.num_speakers == Some(0) {
            return Err(DiarizeError::Config("num_speakers must be >= 1".into()));
        }
        Ok(())
    }
}

/// Output of [`nme_spectral_clustering`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralResult {
    /// One label set per frame; two labels for overlapping frames.
    pub labels: Vec<Labels>,
    /// Nearest cluster per frame.
    pub nearest: Vec<usize>,
    pub num_speakers: usize,
    /// Selected neighbour count (0 for trivial inputs).
    pub p: usize,
}

impl SpectralResult {
    /// Primary (single) label per frame.
    pub fn primary(&self) -> Vec<usize> {
        self.nearest.clone()
    }
}

/// Clusters the frames of `affinity` (N × N).
///
/// `overlap` holds one flag per frame (`-1` unknown, `0` single speaker,
/// `1` overlap); flagged frames also get their second-closest cluster.
pub fn nme_spectral_clustering(
    affinity: ArrayView2<f64>,
    overlap: Option<&[i8]>,
    opts: &NmeOptions,
) -> Result<SpectralResult, DiarizeError> {
    opts.validate()?;
    let (n, cols) = affinity.dim();
    if n != cols {
        return Err(DiarizeError::DimensionMismatch { expected: n, got: cols });
    }
    if let Some(ov) = overlap {
        if ov.len() != n {
            return Err(DiarizeError::DimensionMismatch { expected: n, got: ov.len() });
        }
    }
    if n == 0 {
        return Ok(SpectralResult {
            labels: Vec::new(),
            nearest: Vec::new(),
            num_speakers: 0,
            p: 0,
        });
    }
    if n == 1 {
        return Ok(SpectralResult {
            labels: vec![Labels::from([0])],
            nearest: vec![0],
            num_speakers: 1,
            p: 0,
        });
    }

    let pmax = opts.pmax.min(n - 1);
    let pmin = opts.pmin.clamp(1, pmax);

    let mut best: Option<(f64, usize, usize, SymmetricEigen)> = None;
    for p in pmin..=pmax {
        let graph = prune_to_neighbours(affinity, p);
        let eig = symmetric_eigen(normalized_laplacian(graph.view()).view())?;
        let (k, g) = eigengap(eig.values.as_slice().unwrap_or(&[]), opts.max_speakers);
        let ratio = if g > 0.0 { p as f64 / g } else { f64::INFINITY };
        debug!(p, k, gap = g, ratio, "nme candidate");
        if best.as_ref().is_none_or(|b| ratio < b.0) {
            best = Some((ratio, p, k, eig));
        }
    }
    let Some((ratio, p, k_est, eig)) = best else {
        return Err(DiarizeError::Numerical("no NME candidate evaluated".into()));
    };
    if ratio.is_infinite() {
        warn!(n, "affinity graph has no eigengap, falling back to a single speaker");
    }

    let k = opts.num_speakers.unwrap_or(k_est).clamp(1, n);
    let mut embedding = eig.vectors.slice(s![.., ..k]).to_owned();
    l2_normalize_rows(&mut embedding);

    let km = KMeans {
        n_init: opts.kmeans_inits.max(1),
        ..KMeans::new(k, opts.seed)
    };
    let fit = km.fit(embedding.view());
    let (primary, remap) = renumber_by_first_appearance(&fit.labels, k);

    let mut labels: Vec<Labels> = primary.iter().map(|&l| Labels::from([l])).collect();
    if let Some(ov) = overlap {
        if k >= 2 {
            for (i, &flag) in ov.iter().enumerate() {
                if flag != 1 {
                    continue;
                }
                if let Some(second) = second_nearest(embedding.row(i), fit.centroids.view(), fit.labels[i]) {
                    labels[i].insert(remap[second]);
                }
            }
        }
    }

    let num_speakers = distinct_labels(&primary);
    debug!(p, k, num_speakers, "nme selected");
    Ok(SpectralResult {
        labels,
        nearest: primary,
        num_speakers,
        p,
    })
}

/// Binary p-nearest-neighbour graph, symmetrised as `(A + Aᵀ) / 2`.
/// The diagonal is never selected.
pub fn prune_to_neighbours(affinity: ArrayView2<f64>, p: usize) -> Array2<f64> {
    let n = affinity.nrows();
    let mut a = Array2::<f64>::zeros((n, n));
    let mut order: Vec<usize> = Vec::with_capacity(n);
    for i in 0..n {
        order.clear();
        order.extend((0..n).filter(|&j| j != i));
        order.sort_by(|&x, &y| affinity[[i, y]].total_cmp(&affinity[[i, x]]));
        for &j in order.iter().take(p) {
            a[[i, j]] = 1.0;
        }
    }
    let at = a.t().to_owned();
    (a + at) * 0.5
}

/// `I − D^{-1/2}·A·D^{-1/2}`; zero-degree nodes get an identity row.
pub fn normalized_laplacian(a: ArrayView2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let inv_sqrt: Vec<f64> = a
        .rows()
        .into_iter()
        .map(|r| {
            let d = r.sum();
            if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 }
        })
        .collect();
    let mut l = Array2::<f64>::eye(n);
    for i in 0..n {
        for j in 0..n {
            l[[i, j]] -= inv_sqrt[i] * a[[i, j]] * inv_sqrt[j];
        }
    }
    l
}

/// Eigengap speaker estimate and normalised maximum gap over the
/// `max_speakers + 1` smallest of `values` (ascending).
pub fn eigengap(values: &[f64], max_speakers: usize) -> (usize, f64) {
    let m = (max_speakers + 1).min(values.len());
    if m < 2 {
        return (1, 0.0);
    }
    let mut k = 1;
    let mut gap = f64::NEG_INFINITY;
    for i in 0..m - 1 {
        let g = values[i + 1] - values[i];
        if g > gap {
            gap = g;
            k = i + 1;
        }
    }
    let lambda_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (k, gap.max(0.0) / (lambda_max + GAP_EPS))
}

/// Maps cluster ids to `0..` in order of first appearance. Returns the new
/// labels and the old→new table (`usize::MAX` for unused clusters).
fn renumber_by_first_appearance(labels: &[usize], k: usize) -> (Vec<usize>, Vec<usize>) {
    let mut remap = vec![usize::MAX; k];
    let mut next = 0;
    let renumbered = labels
        .iter()
        .map(|&l| {
            if remap[l] == usize::MAX {
                remap[l] = next;
                next += 1;
            }
            remap[l]
        })
        .collect();
    // Clusters nobody landed in still need an id for second labels.
    for r in remap.iter_mut().filter(|r| **r == usize::MAX) {
        *r = next;
        next += 1;
    }
    (renumbered, remap)
}

/// Number of different labels in `labels`.
fn distinct_labels(labels: &[usize]) -> usize {
    labels.iter().collect::<BTreeSet<_>>().len()
}

fn second_nearest(
    row: ndarray::ArrayView1<f64>,
    centroids: ArrayView2<f64>,
    primary: usize,
) -> Option<usize> {
    centroids
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(c, _)| *c != primary)
        .map(|(c, centroid)| (c, sq_dist(row, centroid)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
}
