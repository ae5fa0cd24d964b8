//! Average-linkage agglomerative clustering (AHC) over cosine similarity.
//!
//! The stopping point is set per recording: a two-Gaussian mixture with a
//! shared variance is fitted to all pairwise scores, and clusters keep
//! merging while their average similarity is at least the point where the
//! two components cross, plus a configurable bias.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::similarity::cosine_similarity;
use crate::DiarizeError;

/// AHC settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AhcOptions {
    /// Bias added to the calibrated threshold; lower values merge more.
    pub threshold: f64,
    /// EM iterations of the score calibration.
    pub calibration_iters: usize,
}

impl Default for AhcOptions {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            calibration_iters: 20,
        }
    }
}

impl AhcOptions {
    pub fn validate(&self) -> Result<(), DiarizeError> {
        if !self.threshold.is_finite() {
            return Err(DiarizeError::Config(format!("ahc threshold must be finite, got {}", self.threshold)));
        }
        if self.calibration_iters == 0 {
            return Err(DiarizeError::Config("ahc calibration_iters must be >= 1".into()));
        }
        Ok(())
    }
}

/// Output of [`ahc`].
#[derive(Debug, Clone, PartialEq)]
pub struct AhcResult {
    /// Cluster per row, numbered by first appearance.
    pub labels: Vec<usize>,
    pub num_speakers: usize,
    /// Calibrated similarity threshold, before the bias.
    pub calibrated: f64,
}

/// Clusters the rows of `x` (N × D).
pub fn ahc(x: ArrayView2<f64>, opts: &AhcOptions) -> Result<AhcResult, DiarizeError> {
    opts.validate()?;
    if x.nrows() == 0 {
        return Ok(AhcResult {
            labels: Vec::new(),
            num_speakers: 0,
            calibrated: 0.0,
        });
    }
    let sim = cosine_similarity(x);
    let scores: Vec<f64> = sim.iter().copied().collect();
    let calibrated = two_gmm_threshold(&scores, opts.calibration_iters);
    let labels = average_linkage(sim.view(), calibrated + opts.threshold)?;
    let num_speakers = labels.iter().max().map_or(0, |&m| m + 1);
    debug!(rows = x.nrows(), calibrated, bias = opts.threshold, num_speakers, "ahc");
    Ok(AhcResult {
        labels,
        num_speakers,
        calibrated,
    })
}

/// Fits a two-component Gaussian mixture with one shared variance to
/// `scores` by EM and returns the score at which both weighted components
/// are equally likely. Degenerate inputs (no spread, a component that
/// loses all mass) return the last valid estimate, starting from the mean.
pub fn two_gmm_threshold(scores: &[f64], iters: usize) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let mut var = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    if !(var > 0.0) {
        return mean;
    }
    let mut weights: [f64; 2] = [0.5, 0.5];
    let mut means = [mean - var.sqrt(), mean + var.sqrt()];
    let mut threshold = mean;

    for _ in 0..iters {
        let mut counts = [0.0; 2];
        let mut sums = [0.0; 2];
        let mut squares = [0.0; 2];
        for &s in scores {
            let ll = [0, 1].map(|c| weights[c].ln() - 0.5 * (s - means[c]).powi(2) / var);
            let top = ll[0].max(ll[1]);
            let e = ll.map(|l| (l - top).exp());
            let z = e[0] + e[1];
            for c in 0..2 {
                let g = e[c] / z;
                counts[c] += g;
                sums[c] += g * s;
                squares[c] += g * s * s;
            }
        }
        if counts.iter().any(|&c| !(c > 0.0)) {
            break;
        }
        weights = counts.map(|c| c / n);
        means = [sums[0] / counts[0], sums[1] / counts[1]];
        var = (0..2)
            .map(|c| (squares[c] / counts[c] - means[c] * means[c]) * weights[c])
            .sum();
        if !(var > 0.0) || means[0] == means[1] {
            break;
        }
        let crossing = ((weights[1] / weights[0]).ln() + (means[0].powi(2) - means[1].powi(2)) / (2.0 * var))
            / ((means[0] - means[1]) / var);
        if !crossing.is_finite() {
            break;
        }
        threshold = crossing;
    }
    threshold
}

/// Average-linkage clustering of a symmetric similarity matrix, cut where
/// the average similarity between two clusters drops below `cutoff`.
///
/// Runs the nearest-neighbour chain algorithm, so the full dendrogram costs
/// O(N²) time. Labels are numbered by first appearance.
pub fn average_linkage(sim: ArrayView2<f64>, cutoff: f64) -> Result<Vec<usize>, DiarizeError> {
    let (n, cols) = sim.dim();
    if n != cols {
        return Err(DiarizeError::DimensionMismatch { expected: n, got: cols });
    }
    // Summed similarity between the members of two clusters. A cluster is
    // stored at the index of one of its members.
    let mut sums: Array2<f64> = sim.to_owned();
    let mut size = vec![1usize; n];
    let mut active = vec![true; n];
    let mut parent: Vec<usize> = (0..n).collect();
    let mut chain: Vec<usize> = Vec::with_capacity(n);

    let average = |sums: &Array2<f64>, size: &[usize], a: usize, b: usize| {
        let v = sums[[a, b]] / (size[a] * size[b]) as f64;
        if v.is_nan() { f64::NEG_INFINITY } else { v }
    };

    for _ in 1..n {
        if chain.is_empty() {
            if let Some(first) = active.iter().position(|&a| a) {
                chain.push(first);
            }
        }
        loop {
            let Some(&a) = chain.last() else { break };
            let prev = chain.len().checked_sub(2).map(|i| chain[i]);
            let mut best = prev.map(|p| (p, average(&sums, &size, a, p)));
            for b in (0..n).filter(|&b| active[b] && b != a && Some(b) != prev) {
                let s = average(&sums, &size, a, b);
                if best.is_none_or(|(_, top)| s > top) {
                    best = Some((b, s));
                }
            }
            let Some((b, s)) = best else { break };
            if Some(b) != prev {
                chain.push(b);
                continue;
            }
            chain.truncate(chain.len() - 2);
            if s >= cutoff {
                let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                parent[ra] = rb;
            }
            for c in (0..n).filter(|&c| active[c] && c != a && c != b) {
                let v = sums[[a, c]] + sums[[b, c]];
                sums[[b, c]] = v;
                sums[[c, b]] = v;
            }
            size[b] += size[a];
            active[a] = false;
            break;
        }
    }

    let mut ids: HashMap<usize, usize> = HashMap::new();
    Ok((0..n)
        .map(|i| {
            let root = find(&mut parent, i);
            let next = ids.len();
            *ids.entry(root).or_insert(next)
        })
        .collect())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}
