//! Log-domain forward-backward and the transition structures used by the
//! VB-HMM refiners.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::linalg::{ln_or_neg_inf, logsumexp};
use crate::DiarizeError;

/// Result of [`forward_backward`].
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    /// State posteriors, T × N; rows sum to 1.
    pub gamma: Array2<f64>,
    /// Total log-likelihood of the observation sequence.
    pub tll: f64,
    /// Log forward probabilities, T × N.
    pub lf: Array2<f64>,
    /// Log backward probabilities, T × N.
    pub lb: Array2<f64>,
}

/// Forward-backward over `lls` (T × N log emissions), transition matrix
/// `tr` (N × N, rows sum to 1) and initial probabilities `ip` (N).
///
/// Zero transition or initial probabilities are treated as `-inf` log
/// weights, never as NaN.
pub fn forward_backward(
    lls: ArrayView2<f64>,
    tr: ArrayView2<f64>,
    ip: ArrayView1<f64>,
) -> Result<ForwardBackward, DiarizeError> {
    let (t_len, n) = lls.dim();
    if tr.dim() != (n, n) {
        return Err(DiarizeError::DimensionMismatch { expected: n, got: tr.nrows() });
    }
    if ip.len() != n {
        return Err(DiarizeError::DimensionMismatch { expected: n, got: ip.len() });
    }
    let ltr = tr.mapv(ln_or_neg_inf);
    let mut lf = Array2::<f64>::from_elem((t_len, n), f64::NEG_INFINITY);
    let mut lb = Array2::<f64>::zeros((t_len, n));
    if t_len == 0 {
        return Ok(ForwardBackward {
            gamma: Array2::zeros((0, n)),
            tll: 0.0,
            lf,
            lb,
        });
    }

    for j in 0..n {
        lf[[0, j]] = lls[[0, j]] + ln_or_neg_inf(ip[j]);
    }
    for t in 1..t_len {
        for j in 0..n {
            let prev = (0..n).map(|i| lf[[t - 1, i]] + ltr[[i, j]]);
            lf[[t, j]] = logsumexp(prev) + lls[[t, j]];
        }
    }
    for t in (0..t_len - 1).rev() {
        for i in 0..n {
            let next = (0..n).map(|j| ltr[[i, j]] + lls[[t + 1, j]] + lb[[t + 1, j]]);
            lb[[t, i]] = logsumexp(next);
        }
    }

    let tll = logsumexp(lf.row(t_len - 1).iter().copied());
    if !tll.is_finite() {
        return Err(DiarizeError::Numerical(format!("total log-likelihood is {tll}")));
    }
    let gamma = (&lf + &lb).mapv(|v| (v - tll).exp());
    Ok(ForwardBackward { gamma, tll, lf, lb })
}

/// Transition matrix of the single-stream minimum-duration HMM.
///
/// Every speaker owns a left-to-right chain of `min_dur` states. Inner
/// states step forward with probability 1; the last state of each chain
/// stays with `loop_prob` and otherwise enters the head of speaker `s'`
/// with `(1 − loop_prob)·pi[s']`.
pub fn min_duration_transitions(pi: ArrayView1<f64>, min_dur: usize, loop_prob: f64) -> Array2<f64> {
    let speakers = pi.len();
    let n = speakers * min_dur;
    let mut tr = Array2::<f64>::zeros((n, n));
    for s in 0..speakers {
        let head = s * min_dur;
        for i in head..head + min_dur - 1 {
            tr[[i, i + 1]] = 1.0;
        }
        let last = head + min_dur - 1;
        for (s2, &p) in pi.iter().enumerate() {
            tr[[last, s2 * min_dur]] += (1.0 - loop_prob) * p;
        }
        tr[[last, last]] += loop_prob;
    }
    tr
}

/// Initial state probabilities of the minimum-duration HMM: `pi[s]` on
/// each chain head, zero elsewhere.
pub fn min_duration_initial(pi: ArrayView1<f64>, min_dur: usize) -> Array1<f64> {
    let mut ip = Array1::<f64>::zeros(pi.len() * min_dur);
    for (s, &p) in pi.iter().enumerate() {
        ip[s * min_dur] = p;
    }
    ip
}

/// Joint speaker-assignment state space of K coupled streams.
///
/// State count is `speakers^streams`, so memory and time grow as
/// `O(speakers^K)` per frame; only K = 2 is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointStates {
    pub speakers: usize,
    pub streams: usize,
}

impl JointStates {
    pub fn new(speakers: usize, streams: usize) -> Result<Self, DiarizeError> {
        if streams != 2 {
            return Err(DiarizeError::UnsupportedStreams(streams));
        }
        Ok(Self { speakers, streams })
    }

    pub fn len(&self) -> usize {
        self.speakers.pow(self.streams as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the joint state `(s0, s1)`.
    pub fn index(&self, s0: usize, s1: usize) -> usize {
        s0 * self.speakers + s1
    }

    /// Per-stream speakers of joint state `j`.
    pub fn split(&self, j: usize) -> (usize, usize) {
        (j / self.speakers, j % self.speakers)
    }

    pub fn is_same(&self, j: usize) -> bool {
        let (a, b) = self.split(j);
        a == b
    }

    /// Starting prior: same-speaker pairs weigh 1, mixed pairs 0.1.
    pub fn initial_prior(&self) -> Array1<f64> {
        let mut pi = Array1::from_shape_fn(self.len(), |j| if self.is_same(j) { 1.0 } else { 0.1 });
        let sum = pi.sum();
        if sum > 0.0 {
            pi /= sum;
        }
        pi
    }

    /// Transition matrix over joint states.
    ///
    /// From a same-speaker state `(s, s)` the chain stays with `loop_same`
    /// and otherwise jumps according to `pi`. From a mixed state `(a, b)`
    /// it stays with `loop_diff` and otherwise falls back to `(a, a)` or
    /// `(b, b)` with equal weight. Rows are renormalised.
    pub fn transitions(&self, pi: ArrayView1<f64>, loop_same: f64, loop_diff: f64) -> Array2<f64> {
        let n = self.len();
        let mut tr = Array2::<f64>::zeros((n, n));
        for j in 0..n {
            let (a, b) = self.split(j);
            if a == b {
                for (k, &p) in pi.iter().enumerate() {
                    tr[[j, k]] = (1.0 - loop_same) * p;
                }
                tr[[j, j]] += loop_same;
            } else {
                tr[[j, j]] = loop_diff;
                tr[[j, self.index(a, a)]] += 0.5 * (1.0 - loop_diff);
                tr[[j, self.index(b, b)]] += 0.5 * (1.0 - loop_diff);
            }
        }
        for mut row in tr.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
        tr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_row_stochastic(tr: &Array2<f64>) {
        for (i, row) in tr.rows().into_iter().enumerate() {
            assert!((row.sum() - 1.0).abs() < 1e-12, "row {i} sums to {}", row.sum());
        }
    }

    #[test]
    fn min_duration_rows_sum_to_one() {
        let pi = array![0.5, 0.3, 0.2];
        for min_dur in 1..4 {
            let tr = min_duration_transitions(pi.view(), min_dur, 0.9);
            assert_eq!(tr.dim(), (3 * min_dur, 3 * min_dur));
            assert_row_stochastic(&tr);
        }
    }

    #[test]
    fn min_duration_chain_structure() {
        let pi = array![0.5, 0.5];
        let tr = min_duration_transitions(pi.view(), 3, 0.8);
        assert_eq!(tr[[0, 1]], 1.0);
        assert_eq!(tr[[1, 2]], 1.0);
        assert!((tr[[2, 2]] - 0.8).abs() < 1e-12);
        assert!((tr[[2, 0]] - 0.1).abs() < 1e-12);
        assert!((tr[[2, 3]] - 0.1).abs() < 1e-12);
        // No path skips into the middle of a chain.
        assert_eq!(tr[[2, 4]], 0.0);
    }

    #[test]
    fn min_duration_single_state_diagonal() {
        let pi = array![0.25, 0.75];
        let tr = min_duration_transitions(pi.view(), 1, 0.5);
        assert!((tr[[0, 0]] - (0.5 + 0.5 * 0.25)).abs() < 1e-12);
        assert!((tr[[0, 1]] - 0.5 * 0.75).abs() < 1e-12);
    }

    #[test]
    fn initial_on_chain_heads() {
        let ip = min_duration_initial(array![0.4, 0.6].view(), 2);
        assert_eq!(ip, array![0.4, 0.0, 0.6, 0.0]);
    }

    #[test]
    fn forward_backward_posteriors_normalised() {
        let lls = array![[0.0, -5.0], [-5.0, 0.0], [-1.0, -1.0], [0.0, -3.0]];
        let tr = array![[0.9, 0.1], [0.2, 0.8]];
        let fb = forward_backward(lls.view(), tr.view(), array![0.5, 0.5].view()).unwrap();
        for row in fb.gamma.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!(fb.gamma[[0, 0]] > 0.9);
        assert!(fb.gamma[[1, 1]] > 0.9);
        let tll_back = crate::linalg::logsumexp(
            (0..2).map(|i| fb.lb[[0, i]] + fb.lf[[0, i]]),
        );
        assert!((tll_back - fb.tll).abs() < 1e-9);
    }

    #[test]
    fn forward_backward_single_state_tll_is_sum() {
        let lls = array![[-1.0], [-2.0], [-0.5]];
        let fb = forward_backward(lls.view(), array![[1.0]].view(), array![1.0].view()).unwrap();
        assert!((fb.tll + 3.5).abs() < 1e-12);
    }

    #[test]
    fn forward_backward_handles_zero_transitions() {
        let lls = array![[0.0, 0.0], [0.0, 0.0]];
        let tr = array![[1.0, 0.0], [0.0, 1.0]];
        let fb = forward_backward(lls.view(), tr.view(), array![1.0, 0.0].view()).unwrap();
        assert_eq!(fb.gamma[[1, 1]], 0.0);
        assert!((fb.gamma[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn joint_states_only_two_streams() {
        assert!(matches!(JointStates::new(3, 3), Err(DiarizeError::UnsupportedStreams(3))));
        let js = JointStates::new(3, 2).unwrap();
        assert_eq!(js.len(), 9);
        assert_eq!(js.index(2, 1), 7);
        assert_eq!(js.split(7), (2, 1));
    }

    #[test]
    fn coupled_transitions_row_stochastic() {
        let js = JointStates::new(3, 2).unwrap();
        let pi = js.initial_prior();
        assert!((pi.sum() - 1.0).abs() < 1e-12);
        let tr = js.transitions(pi.view(), 0.99, 0.1);
        assert_row_stochastic(&tr);
    }

    #[test]
    fn mixed_state_falls_back_to_its_speakers() {
        let js = JointStates::new(3, 2).unwrap();
        let pi = js.initial_prior();
        let tr = js.transitions(pi.view(), 0.99, 0.1);
        let mixed = js.index(0, 2);
        assert!((tr[[mixed, mixed]] - 0.1).abs() < 1e-12);
        assert!((tr[[mixed, js.index(0, 0)]] - 0.45).abs() < 1e-12);
        assert!((tr[[mixed, js.index(2, 2)]] - 0.45).abs() < 1e-12);
        assert_eq!(tr[[mixed, js.index(1, 1)]], 0.0);
    }
}
