//! RTTM reading and writing, and overlap flags derived from an overlap RTTM.

use std::io::{BufRead, Write};

use crate::stitch::Turn;
use crate::DiarizeError;

/// Fraction of a window that must be covered to count as overlapped.
pub const DEFAULT_OVERLAP_FRACTION: f64 = 0.5;

/// One `SPEAKER` line.
#[derive(Debug, Clone, PartialEq)]
pub struct RttmRecord {
    pub recording: String,
    pub start: f64,
    pub duration: f64,
    pub speaker: String,
}

impl RttmRecord {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Reads an RTTM file. Field 1 is the recording, fields 3 and 4 are start
/// and duration, field 7 the speaker. Non-`SPEAKER` lines are skipped.
pub fn read_rttm<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<RttmRecord>, DiarizeError> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields[0].starts_with(';') {
            continue;
        }
        let err = |msg: String| DiarizeError::Parse {
            source_name: source_name.to_string(),
            line: i + 1,
            msg,
        };
        if fields[0] != "SPEAKER" {
            continue;
        }
        if fields.len() < 5 {
            return Err(err(format!("expected at least 5 fields, got {}", fields.len())));
        }
        let start: f64 = fields[3].parse().map_err(|_| err(format!("bad start {:?}", fields[3])))?;
        let duration: f64 = fields[4].parse().map_err(|_| err(format!("bad duration {:?}", fields[4])))?;
        out.push(RttmRecord {
            recording: fields[1].to_string(),
            start,
            duration,
            speaker: fields.get(7).map_or_else(String::new, |s| s.to_string()),
        });
    }
    Ok(out)
}

/// Writes turns as RTTM, in the given order, with 0-based numeric labels.
pub fn write_rttm<W: Write>(mut w: W, recording: &str, turns: &[Turn]) -> Result<(), DiarizeError> {
    for t in turns {
        writeln!(
            w,
            "SPEAKER {recording} 1 {:.3} {:.3} <NA> <NA> {} <NA> <NA>",
            t.start,
            t.duration(),
            t.label
        )?;
    }
    Ok(())
}

/// `(start, end)` overlap intervals from an overlap RTTM, sorted by start.
pub fn overlap_intervals(records: &[RttmRecord]) -> Vec<(f64, f64)> {
    let mut out: Vec<(f64, f64)> = records.iter().map(|r| (r.start, r.end())).collect();
    out.sort_by(|a, b| a.0.total_cmp(&b.0));
    out
}

/// Whether at least `frac` of `[start, end)` lies inside the sorted
/// `intervals`.
pub fn is_overlapped(intervals: &[(f64, f64)], start: f64, end: f64, frac: f64) -> bool {
    let mut covered = 0.0;
    for &(s, e) in intervals {
        if s >= end {
            break;
        }
        covered += (e.min(end) - s.max(start)).max(0.0);
    }
    covered >= frac * (end - start)
}

/// Per-window overlap flags: `1` overlapped, `0` not, and all `-1` when no
/// overlap hypothesis is available.
pub fn overlap_vector(intervals: Option<&[(f64, f64)]>, windows: &[(f64, f64)], frac: f64) -> Vec<i8> {
    match intervals {
        None => vec![-1; windows.len()],
        Some(iv) => windows
            .iter()
            .map(|&(s, e)| i8::from(is_overlapped(iv, s, e, frac)))
            .collect(),
    }
}

/// Samples turns on a frame grid of `step` seconds: for every frame, the
/// speaker of the first record covering its centre.
pub fn rasterize(records: &[RttmRecord], step: f64, frames: usize) -> Vec<Option<&str>> {
    (0..frames)
        .map(|f| {
            let t = (f as f64 + 0.5) * step;
            records
                .iter()
                .find(|r| r.start <= t && t < r.end())
                .map(|r| r.speaker.as_str())
        })
        .collect()
}
