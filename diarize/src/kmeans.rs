use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::Rng;

use crate::sampling::seeded;

/// Lloyd's k-means with k-means++ seeding and several restarts.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub k: usize,
    /// Independent seedings; the lowest inertia wins.
    pub n_init: usize,
    pub max_iter: usize,
    pub seed: u64,
}

/// Result of [`KMeans::fit`].
#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub labels: Vec<usize>,
    pub centroids: Array2<f64>,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f64,
}

impl KMeans {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            n_init: 10,
            max_iter: 300,
            seed,
        }
    }

    /// Clusters the rows of `x`. `k` is clamped to `[1, rows]`.
    pub fn fit(&self, x: ArrayView2<f64>) -> KMeansFit {
        let n = x.nrows();
        if n == 0 {
            return KMeansFit {
                labels: Vec::new(),
                centroids: Array2::zeros((0, x.ncols())),
                inertia: 0.0,
            };
        }
        let k = self.k.clamp(1, n);
        let mut best: Option<KMeansFit> = None;
        for init in 0..self.n_init.max(1) {
            let fit = self.fit_once(x, k, self.seed.wrapping_add(init as u64));
            if best.as_ref().is_none_or(|b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }
        best.unwrap_or_else(|| self.fit_once(x, k, self.seed))
    }

    fn fit_once(&self, x: ArrayView2<f64>, k: usize, seed: u64) -> KMeansFit {
        let n = x.nrows();
        let mut rng = seeded(seed);
        let mut centroids = plus_plus_init(x, k, &mut rng);
        let mut labels = vec![usize::MAX; n];

        for _ in 0..self.max_iter {
            let mut changed = false;
            for (i, row) in x.rows().into_iter().enumerate() {
                let (c, _) = nearest(row, centroids.view());
                if labels[i] != c {
                    labels[i] = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = Array2::<f64>::zeros(centroids.dim());
            let mut counts = vec![0usize; k];
            for (i, row) in x.rows().into_iter().enumerate() {
                let mut s = sums.row_mut(labels[i]);
                s += &row;
                counts[labels[i]] += 1;
            }
            for c in 0..k {
                if counts[c] > 0 {
                    let mean = sums.row(c).mapv(|v| v / counts[c] as f64);
                    centroids.row_mut(c).assign(&mean);
                } else {
                    // Empty cluster: re-seed with the point farthest from its centroid.
                    let far = farthest_point(x, centroids.view(), &labels);
                    centroids.row_mut(c).assign(&x.row(far));
                    labels[far] = c;
                }
            }
        }

        let inertia = x
            .rows()
            .into_iter()
            .zip(&labels)
            .map(|(row, &c)| sq_dist(row, centroids.row(c)))
            .sum();
        KMeansFit {
            labels,
            centroids,
            inertia,
        }
    }
}

/// Squared Euclidean distance.
pub fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of and squared distance to the closest centroid.
pub fn nearest(row: ArrayView1<f64>, centroids: ArrayView2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = sq_dist(row, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn plus_plus_init<R: Rng>(x: ArrayView2<f64>, k: usize, rng: &mut R) -> Array2<f64> {
    let n = x.nrows();
    let mut centroids = Array2::<f64>::zeros((k, x.ncols()));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&x.row(first));
    let mut d2: Vec<f64> = x.rows().into_iter().map(|r| sq_dist(r, x.row(first))).collect();

    for c in 1..k {
        let total: f64 = d2.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.r#gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, &d) in d2.iter().enumerate() {
                if target < d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        } else {
            rng.gen_range(0..n)
        };
        centroids.row_mut(c).assign(&x.row(pick));
        for (i, row) in x.rows().into_iter().enumerate() {
            d2[i] = d2[i].min(sq_dist(row, x.row(pick)));
        }
    }
    centroids
}

fn farthest_point(x: ArrayView2<f64>, centroids: ArrayView2<f64>, labels: &[usize]) -> usize {
    let mut best = (0, -1.0);
    for (i, row) in x.rows().into_iter().enumerate() {
        let d = sq_dist(row, centroids.row(labels[i]));
        if d > best.1 {
            best = (i, d);
        }
    }
    best.0
}
