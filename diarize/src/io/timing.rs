//! Kaldi `segments` files: `<segment> <recording> <start> <end>`.

use std::collections::HashMap;
use std::io::BufRead;

use crate::DiarizeError;

/// Time span of one embedding, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub name: String,
    pub recording: String,
    pub start: f64,
    pub end: f64,
}

/// Reads a segments file. Blank lines and `#` comments are skipped.
pub fn read_segments<R: BufRead>(reader: R, source_name: &str) -> Result<Vec<SegmentTiming>, DiarizeError> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err = |msg: String| DiarizeError::Parse {
            source_name: source_name.to_string(),
            line: i + 1,
            msg,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[name, recording, start, end] = fields.as_slice() else {
            return Err(err(format!("expected 4 fields, got {}", fields.len())));
        };
        let start: f64 = start.parse().map_err(|_| err(format!("bad start time {start:?}")))?;
        let end: f64 = end.parse().map_err(|_| err(format!("bad end time {end:?}")))?;
        if end < start {
            return Err(err(format!("segment ends before it starts ({start} > {end})")));
        }
        out.push(SegmentTiming {
            name: name.to_string(),
            recording: recording.to_string(),
            start,
            end,
        });
    }
    Ok(out)
}

/// Indexes timings by recording, keeping file order inside each one.
pub fn by_recording(timings: Vec<SegmentTiming>) -> HashMap<String, Vec<SegmentTiming>> {
    let mut map: HashMap<String, Vec<SegmentTiming>> = HashMap::new();
    for t in timings {
        map.entry(t.recording.clone()).or_default().push(t);
    }
    map
}
