//! Starting posteriors for VB refinement and the random-restart runner.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use ndarray::{Array2, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coupled::{coupled_vb_hmm, CoupledOptions, CoupledOutput};
use crate::der::one_hot;
use crate::linalg::softmax_rows;
use crate::sampling::{normal_matrix, seeded};
use crate::vbx::{vb_hmm, EigenvoiceModel, VbInit, VbOptions, VbOutput};
use crate::DiarizeError;

/// How the final labels are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InitMode {
    /// NME labels are final.
    #[default]
    Spectral,
    /// NME labels, smoothed, seed VB refinement.
    SpectralVb,
    /// Calibrated AHC labels are final.
    Ahc,
    /// AHC labels, smoothed, seed VB refinement.
    AhcVb,
    /// VB from N random starts; the best final ELBO wins.
    Random(usize),
}

impl fmt::Display for InitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitMode::Spectral => write!(f, "spectral"),
            InitMode::SpectralVb => write!(f, "spectral+vb"),
            InitMode::Ahc => write!(f, "ahc"),
            InitMode::AhcVb => write!(f, "ahc+vb"),
            InitMode::Random(n) => write!(f, "random_{n}"),
        }
    }
}

impl FromStr for InitMode {
    type Err = DiarizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spectral" => Ok(InitMode::Spectral),
            "spectral+vb" | "spectral_vb" => Ok(InitMode::SpectralVb),
            "ahc" => Ok(InitMode::Ahc),
            "ahc+vb" | "ahc_vb" => Ok(InitMode::AhcVb),
            other => {
                let n = other
                    .strip_prefix("random_")
                    .and_then(|n| n.parse::<usize>().ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| {
                        DiarizeError::Config(format!(
                            "unknown init mode {s:?} (expected spectral, spectral+vb, ahc, ahc+vb or random_N)"
                        ))
                    })?;
                Ok(InitMode::Random(n))
            }
        }
    }
}

impl TryFrom<String> for InitMode {
    type Error = DiarizeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<InitMode> for String {
    fn from(m: InitMode) -> Self {
        m.to_string()
    }
}

/// `softmax(onehot(labels) · smoothing)`: hard labels turned into soft
/// posteriors over `speakers` columns.
pub fn soft_init(labels: &[usize], speakers: usize, smoothing: f64) -> Array2<f64> {
    softmax_rows(one_hot(labels, speakers).view(), smoothing)
}

/// `softmax(N(0.5, 0.01²) · smoothing)`: a near-uniform random start.
pub fn random_init<R: Rng + ?Sized>(
    rng: &mut R,
    frames: usize,
    speakers: usize,
    smoothing: f64,
) -> Result<Array2<f64>, DiarizeError> {
    Ok(softmax_rows(normal_matrix(rng, frames, speakers, 0.5, 0.01)?.view(), smoothing))
}

/// Quality of a finished run, higher is better.
pub trait Scored {
    fn score(&self) -> f64;
}

impl Scored for VbOutput {
    fn score(&self) -> f64 {
        self.trace.final_elbo()
    }
}

impl Scored for CoupledOutput {
    fn score(&self) -> f64 {
        self.trace.final_elbo()
    }
}

/// Runs `run(index, seed + index)` for every restart and keeps the
/// best-scoring result. Restarts run on scoped threads, at most
/// [`std::thread::available_parallelism`] at a time. Ties go to the lowest
/// index; the first failing restart (by index) fails the whole call.
pub fn best_of_restarts<T, F>(restarts: usize, seed: u64, run: F) -> Result<T, DiarizeError>
where
    T: Scored + Send,
    F: Fn(usize, u64) -> Result<T, DiarizeError> + Sync,
{
    let workers = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    best_of_restarts_on(restarts, seed, workers, run)
}

/// [`best_of_restarts`] with at most `workers` restarts in flight.
pub fn best_of_restarts_on<T, F>(restarts: usize, seed: u64, workers: usize, run: F) -> Result<T, DiarizeError>
where
    T: Scored + Send,
    F: Fn(usize, u64) -> Result<T, DiarizeError> + Sync,
{
    if restarts == 0 {
        return Err(DiarizeError::Config("restarts must be >= 1".into()));
    }
    let workers = workers.clamp(1, restarts);
    let run = &run;

    let mut best: Option<(usize, f64, T)> = None;
    for first in (0..restarts).step_by(workers) {
        let batch: Vec<Result<T, DiarizeError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (first..(first + workers).min(restarts))
                .map(|i| scope.spawn(move || run(i, seed.wrapping_add(i as u64))))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(DiarizeError::Numerical("restart thread panicked".into())))
                })
                .collect()
        });
        for (i, result) in (first..).zip(batch) {
            let out = result?;
            let score = out.score();
            let score = if score.is_nan() { f64::NEG_INFINITY } else { score };
            debug!(restart = i, score, "restart finished");
            if best.as_ref().is_none_or(|b| score > b.1) {
                best = Some((i, score, out));
            }
        }
    }
    best.map(|(_, _, out)| out)
        .ok_or_else(|| DiarizeError::Numerical("no restart produced a result".into()))
}

/// Single-stream VB from `restarts` random starts over `speakers` columns.
/// `reference` is forwarded to every run for DER tracing.
pub fn vb_random_restarts(
    x: ArrayView2<f64>,
    model: &EigenvoiceModel,
    opts: &VbOptions,
    restarts: usize,
    speakers: usize,
    smoothing: f64,
    reference: Option<&[usize]>,
) -> Result<VbOutput, DiarizeError> {
    best_of_restarts(restarts, opts.seed, |_, seed| {
        let gamma = random_init(&mut seeded(seed), x.nrows(), speakers, smoothing)?;
        let o = VbOptions { seed, ..opts.clone() };
        vb_hmm(x, model, VbInit::from_gamma(gamma), &o, reference)
    })
}

/// Coupled VB from `restarts` random starts over `speakers` columns.
pub fn coupled_random_restarts(
    streams: [ArrayView2<f64>; 2],
    model: &EigenvoiceModel,
    opts: &CoupledOptions,
    restarts: usize,
    speakers: usize,
    smoothing: f64,
) -> Result<CoupledOutput, DiarizeError> {
    let frames = streams[0].nrows();
    best_of_restarts(restarts, opts.seed, |_, seed| {
        let mut rng = seeded(seed);
        let g0 = random_init(&mut rng, frames, speakers, smoothing)?;
        let g1 = random_init(&mut rng, frames, speakers, smoothing)?;
        let o = CoupledOptions { seed, ..opts.clone() };
        coupled_vb_hmm(&streams, model, Some([g0, g1]), &o)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed(f64, usize);

    impl Scored for Fixed {
        fn score(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn parses_modes() {
        assert_eq!("spectral".parse::<InitMode>().unwrap(), InitMode::Spectral);
        assert_eq!("Spectral+VB".parse::<InitMode>().unwrap(), InitMode::SpectralVb);
        assert_eq!("random_5".parse::<InitMode>().unwrap(), InitMode::Random(5));
        assert!("random_0".parse::<InitMode>().is_err());
        assert_eq!("AHC".parse::<InitMode>().unwrap(), InitMode::Ahc);
        assert_eq!("ahc+vb".parse::<InitMode>().unwrap(), InitMode::AhcVb);
        assert_eq!("AHC_VB".parse::<InitMode>().unwrap(), InitMode::AhcVb);
        assert!("kmeans".parse::<InitMode>().is_err());
        assert_eq!(InitMode::Random(3).to_string(), "random_3");
        assert_eq!(InitMode::AhcVb.to_string(), "ahc+vb");
    }

    #[test]
    fn mode_serde_uses_strings() {
        let m: InitMode = serde_json::from_str("\"random_7\"").unwrap();
        assert_eq!(m, InitMode::Random(7));
        assert_eq!(serde_json::to_string(&InitMode::SpectralVb).unwrap(), "\"spectral+vb\"");
    }

    #[test]
    fn soft_init_favours_label() {
        let g = soft_init(&[0, 2], 3, 5.0);
        assert!(g[[0, 0]] > 0.9);
        assert!(g[[1, 2]] > 0.9);
        for row in g.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn random_init_is_near_uniform() {
        let g = random_init(&mut seeded(1), 50, 10, 10.0).unwrap();
        for row in g.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
            assert!(row.iter().all(|&p| (p - 0.1).abs() < 0.05));
        }
    }

    #[test]
    fn best_restart_wins_ties_go_low() {
        let out = best_of_restarts(4, 0, |i, _| Ok(Fixed([1.0, 3.0, 3.0, 2.0][i], i))).unwrap();
        assert_eq!(out.1, 1);
    }

    #[test]
    fn restarts_run_in_bounded_batches() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let out = best_of_restarts_on(64, 0, 3, |i, _| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Fixed(if i == 17 || i >= 40 { 9.0 } else { 1.0 }, i))
        })
        .unwrap();
        assert_eq!(out.1, 17);
        assert!(peak.load(Ordering::SeqCst) <= 3);

        let out = best_of_restarts(64, 0, |i, _| Ok(Fixed((i % 5) as f64, i))).unwrap();
        assert_eq!(out.1, 4);
    }

    #[test]
    fn restart_seeds_are_offsets() {
        let out = best_of_restarts(3, 10, |_, seed| Ok(Fixed(seed as f64, seed as usize))).unwrap();
        assert_eq!(out.1, 12);
    }

    #[test]
    fn restart_error_propagates() {
        let res = best_of_restarts(2, 0, |i, _| {
            if i == 1 {
                Err(DiarizeError::Numerical("boom".into()))
            } else {
                Ok(Fixed(0.0, i))
            }
        });
        assert!(res.is_err());
        assert!(best_of_restarts(0, 0, |i, _| Ok(Fixed(0.0, i))).is_err());
    }
}
