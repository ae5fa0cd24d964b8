//! Coupled VB-HMM over two time-aligned embedding streams.
//!
//! Both streams share one set of speaker posteriors; the HMM runs over
//! joint states `(s0, s1)` so that the same speaker pair is tracked on
//! both streams at once and two speakers cannot switch simultaneously.

use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hmm::{forward_backward, JointStates};
use crate::linalg::logsumexp;
use crate::sampling::{dirichlet_rows, seeded};
use crate::vbx::{
    converged, normalize_rows, reestimate_prior, EigenvoiceModel, IterationStats, SpeakerPosteriors, VbTrace,
};
use crate::DiarizeError;

/// Options for [`coupled_vb_hmm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoupledOptions {
    /// Speaker count when no initial posteriors are given.
    pub max_speakers: usize,
    pub max_iters: usize,
    pub epsilon: f64,
    /// Self-loop probability of same-speaker states.
    pub loop_same: f64,
    /// Self-loop probability of mixed (overlap) states.
    pub loop_diff: f64,
    pub alpha_q_init: f64,
    pub fa: f64,
    pub fb: f64,
    pub seed: u64,
}

impl Default for CoupledOptions {
    fn default() -> Self {
        Self {
            max_speakers: 10,
            max_iters: 40,
            epsilon: 1e-6,
            loop_same: 0.99,
            loop_diff: 0.1,
            alpha_q_init: 1.0,
            fa: 0.3,
            fb: 17.0,
            seed: 3,
        }
    }
}

impl CoupledOptions {
    pub fn validate(&self) -> Result<(), DiarizeError> {
        for (name, p) in [("loop_same", self.loop_same), ("loop_diff", self.loop_diff)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(DiarizeError::Config(format!("{name} must be in [0, 1], got {p}")));
            }
        }
        if !(self.fa > 0.0) || !(self.fb > 0.0) {
            return Err(DiarizeError::Config(format!(
                "Fa and Fb must be positive, got Fa={} Fb={}",
                self.fa, self.fb
            )));
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

/// Output of [`coupled_vb_hmm`].
#[derive(Debug, Clone)]
pub struct CoupledOutput {
    /// Per-stream speaker posteriors, each T × S.
    pub gamma: [Array2<f64>; 2],
    /// Prior over joint states, S².
    pub pi: Array1<f64>,
    pub trace: VbTrace,
}

/// Runs coupled VB-HMM over `streams` (each T × D, equal T).
///
/// `init` optionally provides one T × S posterior per stream; otherwise
/// both are drawn from a flat Dirichlet. Only two streams are supported.
pub fn coupled_vb_hmm(
    streams: &[ArrayView2<f64>],
    model: &EigenvoiceModel,
    init: Option<[Array2<f64>; 2]>,
    opts: &CoupledOptions,
) -> Result<CoupledOutput, DiarizeError> {
    opts.validate()?;
    let speakers = init.as_ref().map_or(opts.max_speakers, |g| g[0].ncols());
    let states = JointStates::new(speakers, streams.len())?;
    let [x0, x1] = [streams[0], streams[1]];
    let t_len = x0.nrows();
    if x1.nrows() != t_len {
        return Err(DiarizeError::DimensionMismatch { expected: t_len, got: x1.nrows() });
    }

    let s0 = model.frame_stats(x0)?;
    let s1 = model.frame_stats(x1)?;
    let vtief_all = concatenate(Axis(0), &[s0.vtief.view(), s1.vtief.view()])
        .map_err(|e| DiarizeError::Numerical(e.to_string()))?;

    let [mut g0, mut g1] = match init {
        Some([a, b]) => {
            for g in [&a, &b] {
                if g.dim() != (t_len, speakers) {
                    return Err(DiarizeError::DimensionMismatch { expected: t_len, got: g.nrows() });
                }
            }
            [a, b]
        }
        None => {
            let mut rng = seeded(opts.seed);
            let a = dirichlet_rows(&mut rng, t_len, speakers, opts.alpha_q_init)?;
            let b = dirichlet_rows(&mut rng, t_len, speakers, opts.alpha_q_init)?;
            [a, b]
        }
    };
    let mut pi = states.initial_prior();
    let mut trace = VbTrace {
        initial: IterationStats {
            elbo: (s0.g.sum() + s1.g.sum()) * opts.fa,
            der: None,
            xentropy: None,
        },
        iterations: Vec::new(),
        converged: false,
    };
    if t_len == 0 {
        return Ok(CoupledOutput { gamma: [g0, g1], pi, trace });
    }

    let heads: Vec<usize> = (0..states.len()).collect();
    let mut prev = None;
    for iter in 0..opts.max_iters {
        let gamma_all = concatenate(Axis(0), &[g0.view(), g1.view()])
            .map_err(|e| DiarizeError::Numerical(e.to_string()))?;
        let post = SpeakerPosteriors::update(gamma_all.view(), vtief_all.view(), s0.vtiev.view(), opts.fa, opts.fb)?;
        let lls0 = post.emissions(s0.g.view(), s0.vtief.view(), s0.vtiev.view(), opts.fa);
        let lls1 = post.emissions(s1.g.view(), s1.vtief.view(), s1.vtiev.view(), opts.fa);
        let neg_kl = post.neg_kl(opts.fb)?;

        let joint = Array2::from_shape_fn((t_len, states.len()), |(t, j)| {
            let (a, b) = states.split(j);
            lls0[[t, a]] + lls1[[t, b]]
        });
        let tr = states.transitions(pi.view(), opts.loop_same, opts.loop_diff);
        let fb = forward_backward(joint.view(), tr.view(), pi.view())?;
        let elbo = neg_kl + fb.tll;

        let entry: Vec<f64> = (0..t_len - 1)
            .map(|t| logsumexp(fb.lf.row(t).iter().copied()))
            .collect();
        let log_prior: Vec<f64> = tr.dot(&pi).iter().map(|&p| p.ln()).collect();
        pi = reestimate_prior(fb.gamma.row(0), &entry, fb.lb.view(), joint.view(), &log_prior, &heads, fb.tll);

        (g0, g1) = marginalize(fb.gamma.view(), &states);
        trace.iterations.push(IterationStats {
            elbo,
            der: None,
            xentropy: None,
        });
        debug!(iter, elbo, tll = fb.tll, "coupled vb iteration");

        if converged(iter, prev, elbo, opts.epsilon) {
            trace.converged = true;
            break;
        }
        prev = Some(elbo);
    }
    Ok(CoupledOutput { gamma: [g0, g1], pi, trace })
}

/// Sums joint-state posteriors into per-stream speaker posteriors.
fn marginalize(joint: ArrayView2<f64>, states: &JointStates) -> (Array2<f64>, Array2<f64>) {
    let (t_len, n) = joint.dim();
    let s = states.speakers;
    let mut g0 = Array2::<f64>::zeros((t_len, s));
    let mut g1 = Array2::<f64>::zeros((t_len, s));
    for t in 0..t_len {
        for j in 0..n {
            let (a, b) = states.split(j);
            g0[[t, a]] += joint[[t, j]];
            g1[[t, b]] += joint[[t, j]];
        }
    }
    normalize_rows(&mut g0);
    normalize_rows(&mut g1);
    (g0, g1)
}
