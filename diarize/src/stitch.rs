//! Turns overlapping sliding-window labels into speaker turns.
//!
//! Three passes: per-channel contiguity (overlaps are split at their
//! midpoint), per-channel label merge (consecutive windows sharing a label
//! become one segment, several labels may be open at once), and a
//! cross-channel merge of each label's segments.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Speakers active in one window; two entries for overlapped speech.
pub type Labels = BTreeSet<usize>;

/// One labelled analysis window, times in seconds, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub channel: usize,
    pub start: f64,
    pub end: f64,
    pub labels: Labels,
}

impl Window {
    pub fn new(channel: usize, start: f64, end: f64, label: usize) -> Self {
        Self {
            channel,
            start,
            end,
            labels: Labels::from([label]),
        }
    }

    pub fn with_labels(channel: usize, start: f64, end: f64, labels: Labels) -> Self {
        Self {
            channel,
            start,
            end,
            labels,
        }
    }
}

/// Single-speaker interval on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub channel: usize,
    pub start: f64,
    pub end: f64,
    pub label: usize,
}

/// Speaker turn after merging channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub start: f64,
    pub end: f64,
    pub label: usize,
}

impl Turn {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Result of [`stitch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stitched {
    /// Per-channel segments ordered by `(channel, start)`.
    pub segments: Vec<Segment>,
    /// Cross-channel turns ordered by `(label, start)`.
    pub turns: Vec<Turn>,
}

/// Runs all three passes.
pub fn stitch(windows: &[Window]) -> Stitched {
    let contiguous = make_contiguous(windows);
    let segments = merge_labels(&contiguous);
    let turns = merge_across_channels(&segments);
    Stitched { segments, turns }
}

/// Sorts windows by `(channel, start, end)` and makes each channel's
/// windows disjoint without changing the time they cover. A partial overlap
/// is split at its midpoint. A window lying inside another cuts it in two
/// around itself. Empty windows are dropped.
pub fn make_contiguous(windows: &[Window]) -> Vec<Window> {
    let mut sorted: Vec<Window> = windows.iter().filter(|w| w.end > w.start).cloned().collect();
    sorted.sort_by(|a, b| {
        a.channel
            .cmp(&b.channel)
            .then(a.start.total_cmp(&b.start))
            .then(a.end.total_cmp(&b.end))
    });

    let mut out: Vec<Window> = Vec::with_capacity(sorted.len());
    for mut w in sorted {
        let Some(last) = out.last_mut() else {
            out.push(w);
            continue;
        };
        if last.channel != w.channel || last.end <= w.start {
            out.push(w);
            continue;
        }
        // Anything before `last.start` is already covered.
        w.start = w.start.max(last.start);
        if w.start >= w.end {
            continue;
        }
        if w.end >= last.end {
            let mid = 0.5 * (w.start + last.end);
            last.end = mid;
            w.start = mid;
            out.push(w);
        } else {
            let mut tail = last.clone();
            tail.start = w.end;
            last.end = w.start;
            if last.end <= last.start {
                out.pop();
            }
            out.push(w);
            out.push(tail);
        }
    }
    out
}

/// Running interval of one label.
#[derive(Debug, Clone, Copy)]
struct OpenInterval {
    start: f64,
    end: f64,
}

/// Merges consecutive contiguous windows that share a label. Expects the
/// output of [`make_contiguous`].
pub fn merge_labels(windows: &[Window]) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut open: BTreeMap<usize, OpenInterval> = BTreeMap::new();
    let mut channel = None;

    for w in windows {
        if channel != Some(w.channel) {
            if let Some(ch) = channel {
                close_all(&mut open, ch, &mut out);
            }
            channel = Some(w.channel);
        }
        let closing: Vec<usize> = open
            .iter()
            .filter(|(label, iv)| !w.labels.contains(*label) || iv.end < w.start)
            .map(|(&label, _)| label)
            .collect();
        for label in closing {
            if let Some(iv) = open.remove(&label) {
                out.push(Segment {
                    channel: w.channel,
                    start: iv.start,
                    end: iv.end,
                    label,
                });
            }
        }
        for &label in &w.labels {
            open.entry(label)
                .and_modify(|iv| iv.end = iv.end.max(w.end))
                .or_insert(OpenInterval {
                    start: w.start,
                    end: w.end,
                });
        }
    }
    if let Some(ch) = channel {
        close_all(&mut open, ch, &mut out);
    }
    out.sort_by(|a, b| {
        a.channel
            .cmp(&b.channel)
            .then(a.start.total_cmp(&b.start))
            .then(a.label.cmp(&b.label))
    });
    out
}

fn close_all(open: &mut BTreeMap<usize, OpenInterval>, channel: usize, out: &mut Vec<Segment>) {
    for (label, iv) in std::mem::take(open) {
        out.push(Segment {
            channel,
            start: iv.start,
            end: iv.end,
            label,
        });
    }
}

/// Joins each label's segments across channels: a segment starting at or
/// before the end of the previous one extends it.
pub fn merge_across_channels(segments: &[Segment]) -> Vec<Turn> {
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by(|a, b| a.label.cmp(&b.label).then(a.start.total_cmp(&b.start)));

    let mut out: Vec<Turn> = Vec::new();
    for seg in sorted {
        match out.last_mut() {
            Some(last) if last.label == seg.label && seg.start <= last.end => {
                last.end = last.end.max(seg.end);
            }
            _ => out.push(Turn {
                start: seg.start,
                end: seg.end,
                label: seg.label,
            }),
        }
    }
    out
}

/// Orders turns by time, for callers that want a timeline view.
pub fn by_time(turns: &mut [Turn]) {
    turns.sort_by(|a, b| match a.start.total_cmp(&b.start) {
        Ordering::Equal => a.label.cmp(&b.label),
        o => o,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_window_scenario() {
        let windows = vec![
            Window::new(0, 0.0, 2.0, 0),
            Window::new(0, 1.5, 3.5, 0),
            Window::new(0, 3.0, 5.0, 1),
        ];
        let out = stitch(&windows);
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0], Segment { channel: 0, start: 0.0, end: 3.25, label: 0 });
        assert_eq!(out.segments[1], Segment { channel: 0, start: 3.25, end: 5.0, label: 1 });
        assert_eq!(out.turns.len(), 2);
    }

    #[test]
    fn empty_and_single() {
        assert_eq!(stitch(&[]), Stitched::default());
        let w = Window::new(1, 2.0, 3.5, 4);
        let out = stitch(std::slice::from_ref(&w));
        assert_eq!(out.segments, vec![Segment { channel: 1, start: 2.0, end: 3.5, label: 4 }]);
        assert_eq!(out.turns, vec![Turn { start: 2.0, end: 3.5, label: 4 }]);
    }

    #[test]
    fn gap_closes_interval() {
        let windows = vec![Window::new(0, 0.0, 1.0, 0), Window::new(0, 2.0, 3.0, 0)];
        let segs = merge_labels(&make_contiguous(&windows));
        assert_eq!(segs.len(), 2);
    }

    #[test]
    fn multi_label_windows_keep_both_open() {
        let windows = vec![
            Window::new(0, 0.0, 1.0, 0),
            Window::with_labels(0, 1.0, 2.0, Labels::from([0, 1])),
            Window::new(0, 2.0, 3.0, 1),
        ];
        let segs = merge_labels(&make_contiguous(&windows));
        assert_eq!(
            segs,
            vec![
                Segment { channel: 0, start: 0.0, end: 2.0, label: 0 },
                Segment { channel: 0, start: 1.0, end: 3.0, label: 1 },
            ]
        );
    }

    #[test]
    fn label_reappearing_opens_new_interval() {
        let windows = vec![
            Window::new(0, 0.0, 1.0, 0),
            Window::new(0, 1.0, 2.0, 1),
            Window::new(0, 2.0, 3.0, 0),
        ];
        let segs = merge_labels(&windows);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[2].start, 2.0);
    }

    #[test]
    fn channels_are_independent_then_merged() {
        let windows = vec![
            Window::new(0, 0.0, 2.0, 0),
            Window::new(1, 1.0, 3.0, 0),
            Window::new(1, 3.0, 4.0, 1),
        ];
        let out = stitch(&windows);
        assert_eq!(out.segments.len(), 3);
        assert_eq!(
            out.turns,
            vec![
                Turn { start: 0.0, end: 3.0, label: 0 },
                Turn { start: 3.0, end: 4.0, label: 1 },
            ]
        );
    }

    #[test]
    fn cross_channel_merge_keeps_longer_end() {
        let segs = vec![
            Segment { channel: 0, start: 0.0, end: 5.0, label: 2 },
            Segment { channel: 1, start: 1.0, end: 3.0, label: 2 },
        ];
        assert_eq!(merge_across_channels(&segs), vec![Turn { start: 0.0, end: 5.0, label: 2 }]);
    }

    #[test]
    fn unsorted_input_is_sorted_first() {
        let windows = vec![Window::new(0, 1.5, 3.5, 0), Window::new(0, 0.0, 2.0, 0)];
        let out = stitch(&windows);
        assert_eq!(out.segments, vec![Segment { channel: 0, start: 0.0, end: 3.5, label: 0 }]);
    }

    #[test]
    fn contained_window_splits_its_host() {
        let windows = vec![
            Window::new(0, 0.0, 4.0, 0),
            Window::new(0, 1.0, 2.0, 1),
            Window::new(0, 3.0, 5.0, 0),
        ];
        let flat = make_contiguous(&windows);
        assert!(flat.iter().all(|w| w.end > w.start), "{flat:?}");
        assert!(flat.windows(2).all(|p| p[0].end <= p[1].start), "{flat:?}");
        let covered: f64 = flat.iter().map(|w| w.end - w.start).sum();
        assert!((covered - 5.0).abs() < 1e-12);

        let out = stitch(&windows);
        assert_eq!(
            out.segments,
            vec![
                Segment { channel: 0, start: 0.0, end: 1.0, label: 0 },
                Segment { channel: 0, start: 1.0, end: 2.0, label: 1 },
                Segment { channel: 0, start: 2.0, end: 5.0, label: 0 },
            ]
        );
    }

    #[test]
    fn empty_and_duplicate_windows_vanish() {
        let windows = vec![
            Window::new(0, 1.0, 1.0, 3),
            Window::new(0, 0.0, 2.0, 0),
            Window::new(0, 0.0, 2.0, 1),
        ];
        let flat = make_contiguous(&windows);
        assert!(flat.iter().all(|w| w.end > w.start), "{flat:?}");
        let covered: f64 = flat.iter().map(|w| w.end - w.start).sum();
        assert!((covered - 2.0).abs() < 1e-12);
        assert!(stitch(&windows).segments.iter().all(|s| s.label != 3));
    }

    #[test]
    fn by_time_orders_turns() {
        let mut turns = vec![
            Turn { start: 3.0, end: 4.0, label: 0 },
            Turn { start: 1.0, end: 2.0, label: 1 },
        ];
        by_time(&mut turns);
        assert_eq!(turns[0].label, 1);
    }
}
