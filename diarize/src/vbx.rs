//! Variational-Bayes HMM refinement with an eigenvoice speaker model.
//!
//! Frames are explained by a speaker-specific Gaussian whose mean lives in
//! a low-rank subspace `m + aᵀ·V`. Each iteration re-estimates the speaker
//! coordinates `a` from the current frame posteriors, turns them into
//! per-frame emission scores and runs forward-backward over a
//! minimum-duration HMM to get new posteriors.

use std::f64::consts::PI;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::der::{der, xentropy};
use crate::hmm::{forward_backward, min_duration_initial, min_duration_transitions};
use crate::linalg::{logdet, logsumexp, spd_inverse};
use crate::plda::Plda;
use crate::sampling::{dirichlet_rows, seeded};
use crate::DiarizeError;

/// Eigenvoice emission model: mean `m`, diagonal inverse covariance `iE`
/// and subspace basis `V` (R × D).
#[derive(Debug, Clone)]
pub struct EigenvoiceModel {
    pub mean: Array1<f64>,
    pub inv_sigma: Array1<f64>,
    pub v: Array2<f64>,
}

impl EigenvoiceModel {
    pub fn new(mean: Array1<f64>, inv_sigma: Array1<f64>, v: Array2<f64>) -> Result<Self, DiarizeError> {
        if inv_sigma.len() != mean.len() {
            return Err(DiarizeError::DimensionMismatch {
                expected: mean.len(),
                got: inv_sigma.len(),
            });
        }
        if v.ncols() != mean.len() {
            return Err(DiarizeError::DimensionMismatch {
                expected: mean.len(),
                got: v.ncols(),
            });
        }
        if inv_sigma.iter().any(|&p| !(p > 0.0)) {
            return Err(DiarizeError::Config("inverse covariance must be positive".into()));
        }
        Ok(Self { mean, inv_sigma, v })
    }

    /// Model over the leading `lda_dim` dimensions of a variance-sorted
    /// PLDA space (see [`Plda::sorted_by_variance`]): zero mean, unit
    /// within-class precision, `V = diag(√psi)`.
    pub fn from_plda(sorted: &Plda, lda_dim: usize) -> Result<Self, DiarizeError> {
        let d = lda_dim.min(sorted.psi.len());
        if d == 0 {
            return Err(DiarizeError::Config("lda_dim must be >= 1".into()));
        }
        let mut v = Array2::<f64>::zeros((d, d));
        for i in 0..d {
            v[[i, i]] = sorted.psi[i].sqrt();
        }
        Self::new(Array1::zeros(d), Array1::ones(d), v)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn rank(&self) -> usize {
        self.v.nrows()
    }

    /// Per-frame quantities that stay fixed across VB iterations.
    pub(crate) fn frame_stats(&self, x: ArrayView2<f64>) -> Result<FrameStats, DiarizeError> {
        if x.ncols() != self.dim() {
            return Err(DiarizeError::DimensionMismatch {
                expected: self.dim(),
                got: x.ncols(),
            });
        }
        let d = self.dim() as f64;
        let centered = &x - &self.mean;
        let log_det_ie: f64 = self.inv_sigma.iter().map(|v| v.ln()).sum();
        let g = centered
            .rows()
            .into_iter()
            .map(|r| {
                let maha: f64 = r.iter().zip(&self.inv_sigma).map(|(c, ie)| c * c * ie).sum();
                -0.5 * (maha - log_det_ie + d * (2.0 * PI).ln())
            })
            .collect::<Array1<f64>>();
        let v_ie = &self.v * &self.inv_sigma;
        let vtiev = v_ie.dot(&self.v.t());
        let vtief = centered.dot(&v_ie.t());
        Ok(FrameStats { g, vtiev, vtief })
    }
}

/// UBM log-likelihood `G` (T), `V·diag(iE)·Vᵀ` (R × R) and
/// `(X − m)·diag(iE)·Vᵀ` (T × R).
#[derive(Debug, Clone)]
pub(crate) struct FrameStats {
    pub g: Array1<f64>,
    pub vtiev: Array2<f64>,
    pub vtief: Array2<f64>,
}

/// Posterior over speaker coordinates: covariance `invLs[s]` and mean `a[s]`.
pub(crate) struct SpeakerPosteriors {
    pub inv_ls: Vec<Array2<f64>>,
    pub a: Array2<f64>,
}

impl SpeakerPosteriors {
    /// Accumulates zeroth and first order statistics under `gamma` (T × S).
    pub fn update(
        gamma: ArrayView2<f64>,
        vtief: ArrayView2<f64>,
        vtiev: ArrayView2<f64>,
        fa: f64,
        fb: f64,
    ) -> Result<Self, DiarizeError> {
        let r = vtiev.nrows();
        let ratio = fa / fb;
        let ns = gamma.sum_axis(Axis(0));
        let first = gamma.t().dot(&vtief);
        let mut inv_ls = Vec::with_capacity(ns.len());
        let mut a = Array2::<f64>::zeros((ns.len(), r));
        for (s, &n) in ns.iter().enumerate() {
            let prec = Array2::<f64>::eye(r) + &vtiev * (n * ratio);
            let cov = spd_inverse(prec.view())?;
            a.row_mut(s).assign(&(cov.dot(&first.row(s)) * ratio));
            inv_ls.push(cov);
        }
        Ok(Self { inv_ls, a })
    }

    /// Log emission scores `lls` (T × S) for one stream.
    pub fn emissions(&self, stats_g: ArrayView1<f64>, vtief: ArrayView2<f64>, vtiev: ArrayView2<f64>, fa: f64) -> Array2<f64> {
        let mut lls = vtief.dot(&self.a.t());
        let quad: Vec<f64> = self
            .inv_ls
            .iter()
            .zip(self.a.rows())
            .map(|(cov, a)| (cov * &vtiev).sum() + a.dot(&vtiev.dot(&a)))
            .collect();
        for (t, mut row) in lls.rows_mut().into_iter().enumerate() {
            for (s, v) in row.iter_mut().enumerate() {
                *v = fa * (stats_g[t] + *v - 0.5 * quad[s]);
            }
        }
        lls
    }

    /// Negative KL divergence of the speaker posteriors from their prior.
    pub fn neg_kl(&self, fb: f64) -> Result<f64, DiarizeError> {
        let r = self.a.ncols() as f64;
        let mut total = 0.0;
        for (cov, a) in self.inv_ls.iter().zip(self.a.rows()) {
            let trace: f64 = cov.diag().sum();
            total += fb * 0.5 * (logdet(cov.view())? - trace - a.dot(&a) + r);
        }
        Ok(total)
    }
}

/// ML prior re-estimation from forward-backward quantities.
///
/// `entry[t]` is the log mass available to enter a new speaker between
/// frames `t` and `t + 1`; `heads` selects, per speaker or joint state, the
/// state column of `lb`/`gamma0` it enters through.
pub(crate) fn reestimate_prior(
    gamma0: ArrayView1<f64>,
    entry: &[f64],
    lb: ArrayView2<f64>,
    lls: ArrayView2<f64>,
    log_prior: &[f64],
    heads: &[usize],
    tll: f64,
) -> Array1<f64> {
    let n = heads.len();
    let t_len = lls.nrows();
    let mut pi = Array1::<f64>::zeros(n);
    for (j, &h) in heads.iter().enumerate() {
        let mut acc = gamma0[h];
        for t in 1..t_len {
            acc += (entry[t - 1] + lb[[t, h]] + lls[[t, j]] + log_prior[j] - tll).exp();
        }
        pi[j] = acc;
    }
    normalize_or_uniform(pi)
}

pub(crate) fn normalize_or_uniform(mut p: Array1<f64>) -> Array1<f64> {
    let sum = p.sum();
    if sum > 0.0 && sum.is_finite() {
        p /= sum;
    } else if !p.is_empty() {
        p.fill(1.0 / p.len() as f64);
    }
    p
}

pub(crate) fn normalize_rows(x: &mut Array2<f64>) {
    for mut row in x.rows_mut() {
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

/// Decides whether iteration `iter` stops. A decrease is logged and never
/// stops the loop.
pub(crate) fn converged(iter: usize, prev: Option<f64>, elbo: f64, epsilon: f64) -> bool {
    let Some(prev) = prev else { return false };
    let delta = elbo - prev;
    if delta < 0.0 {
        warn!(iter, elbo, delta, "ELBO decreased");
        return false;
    }
    iter > 0 && delta < epsilon
}

/// Options for [`vb_hmm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbOptions {
    /// Speaker count when neither `gamma` nor `pi` is given.
    pub max_speakers: usize,
    pub max_iters: usize,
    pub epsilon: f64,
    /// Probability of staying with the current speaker between frames.
    pub loop_prob: f64,
    /// Dirichlet concentration of the random posterior start.
    pub alpha_q_init: f64,
    /// Sub-states per speaker chain.
    pub min_dur: usize,
    /// Statistics scale.
    pub fa: f64,
    /// Speaker regularisation.
    pub fb: f64,
    pub seed: u64,
}

impl Default for VbOptions {
    fn default() -> Self {
        Self {
            max_speakers: 10,
            max_iters: 40,
            epsilon: 1e-6,
            loop_prob: 0.99,
            alpha_q_init: 1.0,
            min_dur: 1,
            fa: 0.3,
            fb: 17.0,
            seed: 3,
        }
    }
}

impl VbOptions {
    pub fn validate(&self) -> Result<(), DiarizeError> {
        if !(0.0..=1.0).contains(&self.loop_prob) {
            return Err(DiarizeError::Config(format!("loop_prob must be in [0, 1], got {}", self.loop_prob)));
        }
        if !(self.fa > 0.0) || !(self.fb > 0.0) {
            return Err(DiarizeError::Config(format!(
                "Fa and Fb must be positive, got Fa={} Fb={}",
                self.fa, self.fb
            )));
        }
        if self.min_dur == 0 {
            return Err(DiarizeError::Config("min_dur must be >= 1".into()));
        }
        if self.max_speakers == 0 {
            return Err(DiarizeError::Config("max_speakers must be >= 1".into()));
        }
        if !(self.alpha_q_init > 0.0) {
            return Err(DiarizeError::Config("alpha_q_init must be positive".into()));
        }
        Ok(())
    }
}

/// Optional starting point for [`vb_hmm`].
#[derive(Debug, Clone, Default)]
pub struct VbInit {
    /// Frame posteriors, T × S.
    pub gamma: Option<Array2<f64>>,
    /// Speaker prior, S.
    pub pi: Option<Array1<f64>>,
}

impl VbInit {
    pub fn from_gamma(gamma: Array2<f64>) -> Self {
        Self {
            gamma: Some(gamma),
            pi: None,
        }
    }
}

/// Objective and (with a reference) error rates after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IterationStats {
    pub elbo: f64,
    pub der: Option<f64>,
    pub xentropy: Option<f64>,
}

/// ELBO trajectory of a VB run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VbTrace {
    /// `Fa`-scaled UBM log-likelihood, the iteration-0 entry.
    pub initial: IterationStats,
    pub iterations: Vec<IterationStats>,
    pub converged: bool,
}

impl VbTrace {
    /// ELBO of the last iteration, `-inf` if none ran.
    pub fn final_elbo(&self) -> f64 {
        self.iterations.last().map_or(f64::NEG_INFINITY, |s| s.elbo)
    }
}

/// Output of [`vb_hmm`].
#[derive(Debug, Clone)]
pub struct VbOutput {
    /// Speaker posteriors, T × S; rows sum to 1.
    pub gamma: Array2<f64>,
    pub pi: Array1<f64>,
    pub trace: VbTrace,
}

/// Single-stream VB-HMM diarization of the frames `x` (T × D).
///
/// `reference` (0-based speaker id per frame) adds DER and cross-entropy
/// to every trace entry.
pub fn vb_hmm(
    x: ArrayView2<f64>,
    model: &EigenvoiceModel,
    init: VbInit,
    opts: &VbOptions,
    reference: Option<&[usize]>,
) -> Result<VbOutput, DiarizeError> {
    opts.validate()?;
    let t_len = x.nrows();
    let speakers = match (&init.pi, &init.gamma) {
        (Some(pi), Some(gamma)) if pi.len() != gamma.ncols() => {
            return Err(DiarizeError::DimensionMismatch {
                expected: pi.len(),
                got: gamma.ncols(),
            });
        }
        (Some(pi), _) => pi.len(),
        (None, Some(gamma)) => gamma.ncols(),
        (None, None) => opts.max_speakers,
    };
    if speakers == 0 {
        return Err(DiarizeError::Config("speaker count must be >= 1".into()));
    }
    if let Some(r) = reference {
        if r.len() != t_len {
            return Err(DiarizeError::DimensionMismatch { expected: t_len, got: r.len() });
        }
    }
    let stats = model.frame_stats(x)?;

    let mut pi = init
        .pi
        .map(normalize_or_uniform)
        .unwrap_or_else(|| Array1::from_elem(speakers, 1.0 / speakers as f64));
    let mut gamma = match init.gamma {
        Some(g) => {
            if g.nrows() != t_len {
                return Err(DiarizeError::DimensionMismatch { expected: t_len, got: g.nrows() });
            }
            g
        }
        None => dirichlet_rows(&mut seeded(opts.seed), t_len, speakers, opts.alpha_q_init)?,
    };

    let score = |g: &Array2<f64>| -> Result<(Option<f64>, Option<f64>), DiarizeError> {
        match reference {
            Some(r) => Ok((Some(der(g.view(), r, true)?), Some(xentropy(g.view(), r)?))),
            None => Ok((None, None)),
        }
    };
    let (der0, xent0) = score(&gamma)?;
    let mut trace = VbTrace {
        initial: IterationStats {
            elbo: stats.g.sum() * opts.fa,
            der: der0,
            xentropy: xent0,
        },
        iterations: Vec::new(),
        converged: false,
    };
    if t_len == 0 {
        return Ok(VbOutput { gamma, pi, trace });
    }

    let md = opts.min_dur;
    let heads: Vec<usize> = (0..speakers).map(|s| s * md).collect();
    let mut prev: Option<f64> = None;

    for iter in 0..opts.max_iters {
        let post = SpeakerPosteriors::update(gamma.view(), stats.vtief.view(), stats.vtiev.view(), opts.fa, opts.fb)?;
        let lls = post.emissions(stats.g.view(), stats.vtief.view(), stats.vtiev.view(), opts.fa);
        let neg_kl = post.neg_kl(opts.fb)?;

        let tr = min_duration_transitions(pi.view(), md, opts.loop_prob);
        let ip = min_duration_initial(pi.view(), md);
        let state_lls = repeat_columns(lls.view(), md);
        let fb = forward_backward(state_lls.view(), tr.view(), ip.view())?;
        let elbo = neg_kl + fb.tll;

        let entry: Vec<f64> = (0..t_len - 1)
            .map(|t| logsumexp((0..speakers).map(|s| fb.lf[[t, s * md + md - 1]])))
            .collect();
        let log_prior: Vec<f64> = pi.iter().map(|&p| ((1.0 - opts.loop_prob) * p).ln()).collect();
        pi = reestimate_prior(fb.gamma.row(0), &entry, fb.lb.view(), lls.view(), &log_prior, &heads, fb.tll);

        gamma = collapse_chains(fb.gamma.view(), speakers, md);
        let (d, xe) = score(&gamma)?;
        trace.iterations.push(IterationStats { elbo, der: d, xentropy: xe });
        debug!(iter, elbo, tll = fb.tll, "vb iteration");

        if converged(iter, prev, elbo, opts.epsilon) {
            trace.converged = true;
            break;
        }
        prev = Some(elbo);
    }
    Ok(VbOutput { gamma, pi, trace })
}

fn repeat_columns(x: ArrayView2<f64>, times: usize) -> Array2<f64> {
    if times == 1 {
        return x.to_owned();
    }
    Array2::from_shape_fn((x.nrows(), x.ncols() * times), |(t, j)| x[[t, j / times]])
}

fn collapse_chains(state_gamma: ArrayView2<f64>, speakers: usize, md: usize) -> Array2<f64> {
    let mut out = Array2::from_shape_fn((state_gamma.nrows(), speakers), |(t, s)| {
        (0..md).map(|i| state_gamma[[t, s * md + i]]).sum()
    });
    normalize_rows(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::normal_matrix;

    /// Two speakers in a 2-D space, alternating in blocks of 20 frames.
    fn two_speaker_frames() -> (Array2<f64>, Vec<usize>) {
        let mut rng = seeded(11);
        let noise = normal_matrix(&mut rng, 80, 2, 0.0, 0.3).unwrap();
        let mut x = Array2::<f64>::zeros((80, 2));
        let mut reference = Vec::with_capacity(80);
        for t in 0..80 {
            let spk = (t / 20) % 2;
            let center = if spk == 0 { [3.0, 0.0] } else { [-3.0, 0.0] };
            x[[t, 0]] = center[0] + noise[[t, 0]];
            x[[t, 1]] = center[1] + noise[[t, 1]];
            reference.push(spk);
        }
        (x, reference)
    }

    fn model() -> EigenvoiceModel {
        EigenvoiceModel::new(Array1::zeros(2), Array1::from_elem(2, 1.0 / 0.09), Array2::eye(2) * 3.0).unwrap()
    }

    fn opts() -> VbOptions {
        VbOptions {
            max_speakers: 4,
            fa: 1.0,
            fb: 1.0,
            loop_prob: 0.9,
            ..VbOptions::default()
        }
    }

    #[test]
    fn separates_two_speakers() {
        let (x, reference) = two_speaker_frames();
        // Weakly informative start: the true speaker is only slightly favoured.
        let gamma = Array2::from_shape_fn((80, 4), |(t, s)| if s == reference[t] { 0.4 } else { 0.2 });
        let out = vb_hmm(x.view(), &model(), VbInit::from_gamma(gamma), &opts(), Some(&reference)).unwrap();
        assert!(out.trace.iterations.iter().all(|s| s.elbo.is_finite()));
        let final_der = out.trace.iterations.last().and_then(|s| s.der).unwrap();
        assert!(final_der < 0.05, "der {final_der}");
        assert!((out.pi.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gamma_rows_sum_to_one() {
        let (x, _) = two_speaker_frames();
        let out = vb_hmm(x.view(), &model(), VbInit::default(), &opts(), None).unwrap();
        for row in out.gamma.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert_eq!(out.gamma.dim(), (80, 4));
    }

    #[test]
    fn gamma_stays_normalised_after_every_iteration() {
        let (x, _) = two_speaker_frames();
        for min_dur in [1, 3] {
            for max_iters in 1..=6 {
                let o = VbOptions { max_iters, min_dur, ..opts() };
                let out = vb_hmm(x.view(), &model(), VbInit::default(), &o, None).unwrap();
                assert!(out.trace.iterations.len() <= max_iters);
                for (t, row) in out.gamma.rows().into_iter().enumerate() {
                    assert!(
                        (row.sum() - 1.0).abs() < 1e-6,
                        "min_dur {min_dur}, after {max_iters} iterations, row {t}: {}",
                        row.sum()
                    );
                    assert!(row.iter().all(|&p| p >= 0.0));
                }
            }
        }
    }

    #[test]
    fn min_duration_chains_keep_speaker_count() {
        let (x, reference) = two_speaker_frames();
        let o = VbOptions { min_dur: 3, ..opts() };
        let out = vb_hmm(x.view(), &model(), VbInit::default(), &o, Some(&reference)).unwrap();
        assert_eq!(out.gamma.ncols(), 4);
        assert_eq!(out.pi.len(), 4);
        for row in out.gamma.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn speaker_count_follows_init() {
        let (x, _) = two_speaker_frames();
        let init = VbInit::from_gamma(Array2::from_elem((80, 3), 1.0 / 3.0));
        let out = vb_hmm(x.view(), &model(), init, &opts(), None).unwrap();
        assert_eq!(out.gamma.ncols(), 3);

        let bad = VbInit {
            gamma: Some(Array2::from_elem((80, 3), 1.0 / 3.0)),
            pi: Some(Array1::from_elem(2, 0.5)),
        };
        assert!(vb_hmm(x.view(), &model(), bad, &opts(), None).is_err());
    }

    #[test]
    fn trace_starts_with_ubm_likelihood() {
        let (x, _) = two_speaker_frames();
        let m = model();
        let out = vb_hmm(x.view(), &m, VbInit::default(), &opts(), None).unwrap();
        let stats = m.frame_stats(x.view()).unwrap();
        assert!((out.trace.initial.elbo - stats.g.sum()).abs() < 1e-9);
        assert!(!out.trace.iterations.is_empty());
        assert!(out.trace.iterations.len() <= 40);
    }

    #[test]
    fn same_seed_is_deterministic() {
        let (x, _) = two_speaker_frames();
        let a = vb_hmm(x.view(), &model(), VbInit::default(), &opts(), None).unwrap();
        let b = vb_hmm(x.view(), &model(), VbInit::default(), &opts(), None).unwrap();
        assert_eq!(a.gamma, b.gamma);
    }

    #[test]
    fn rejects_invalid_options() {
        let (x, _) = two_speaker_frames();
        for bad in [
            VbOptions { loop_prob: 1.5, ..opts() },
            VbOptions { fa: 0.0, ..opts() },
            VbOptions { fb: -1.0, ..opts() },
            VbOptions { min_dur: 0, ..opts() },
        ] {
            assert!(matches!(
                vb_hmm(x.view(), &model(), VbInit::default(), &bad, None),
                Err(DiarizeError::Config(_))
            ));
        }
        let wrong_dim = Array2::<f64>::zeros((5, 3));
        assert!(vb_hmm(wrong_dim.view(), &model(), VbInit::default(), &opts(), None).is_err());
    }

    #[test]
    fn empty_input_returns_empty_posteriors() {
        let x = Array2::<f64>::zeros((0, 2));
        let out = vb_hmm(x.view(), &model(), VbInit::default(), &opts(), None).unwrap();
        assert_eq!(out.gamma.nrows(), 0);
        assert!(out.trace.iterations.is_empty());
    }

    #[test]
    fn plda_model_is_diagonal() {
        let plda = Plda::new(Array1::zeros(3), Array2::eye(3), ndarray::array![4.0, 1.0, 0.25]).unwrap();
        let m = EigenvoiceModel::from_plda(&plda, 2).unwrap();
        assert_eq!(m.dim(), 2);
        assert!((m.v[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((m.v[[1, 1]] - 1.0).abs() < 1e-12);
        assert_eq!(m.v[[0, 1]], 0.0);
    }

    #[test]
    fn kl_is_zero_without_statistics() {
        let m = model();
        let stats = m.frame_stats(Array2::<f64>::zeros((4, 2)).view()).unwrap();
        let gamma = Array2::<f64>::zeros((4, 2));
        let post = SpeakerPosteriors::update(gamma.view(), stats.vtief.view(), stats.vtiev.view(), 1.0, 1.0).unwrap();
        assert!(post.neg_kl(1.0).unwrap().abs() < 1e-9);
    }

    #[test]
    fn converged_needs_small_nonnegative_step() {
        assert!(!converged(0, None, 1.0, 1e-3));
        assert!(converged(1, Some(1.0), 1.0 + 1e-6, 1e-3));
        assert!(!converged(1, Some(1.0), 0.5, 1e-3));
        assert!(!converged(1, Some(1.0), 2.0, 1e-3));
    }
}
