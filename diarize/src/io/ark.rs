//! Kaldi vector archives (`.ark`), binary and text.
//!
//! Binary entries look like `name \0B FV \x04 <i32 dim> <dim × f32>`
//! (`DV` with `f64` payload for double vectors). Text entries look like
//! `name  [ 0.1 0.2 ... ]`.

use std::io::{Read, Write};

use crate::DiarizeError;

/// One named vector of an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArkEntry {
    pub name: String,
    pub values: Vec<f64>,
}

/// Parsed `{recording}_{channel}_{index}` embedding name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingName {
    pub recording: String,
    pub channel: usize,
    pub index: String,
}

impl EmbeddingName {
    /// Splits on the last two underscores. Names with a single underscore
    /// are read as `{recording}_{index}` on channel 0.
    pub fn parse(name: &str) -> Result<Self, DiarizeError> {
        let bad = || DiarizeError::Archive(format!("embedding name {name:?} is not {{recording}}_{{channel}}_{{index}}"));
        let mut parts = name.rsplitn(3, '_');
        let index = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
        let second = parts.next().ok_or_else(bad)?;
        match parts.next() {
            Some(recording) if !recording.is_empty() => {
                let channel = second.parse::<usize>().map_err(|_| bad())?;
                Ok(Self {
                    recording: recording.to_string(),
                    channel,
                    index: index.to_string(),
                })
            }
            _ if !second.is_empty() => Ok(Self {
                recording: second.to_string(),
                channel: 0,
                index: index.to_string(),
            }),
            _ => Err(bad()),
        }
    }
}

/// Reads every entry of an archive, binary or text, preserving order.
pub fn read_ark<R: Read>(mut reader: R, source_name: &str) -> Result<Vec<ArkEntry>, DiarizeError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let mut cur = Cursor { buf: &buf, pos: 0, source: source_name };
    let mut out = Vec::new();
    loop {
        cur.skip_whitespace();
        if cur.at_end() {
            break;
        }
        let name = cur.token()?;
        if cur.peek_bytes(2) == Some(&b"\0B"[..]) {
            cur.pos += 2;
            out.push(ArkEntry { name, values: cur.binary_vector()? });
        } else {
            out.push(ArkEntry { name, values: cur.text_vector()? });
        }
    }
    Ok(out)
}

/// Groups consecutive entries by recording id, keeping archive order.
pub fn group_by_recording(entries: Vec<ArkEntry>) -> Result<Vec<(String, Vec<ArkEntry>)>, DiarizeError> {
    let mut groups: Vec<(String, Vec<ArkEntry>)> = Vec::new();
    for e in entries {
        let rec = EmbeddingName::parse(&e.name)?.recording;
        match groups.last_mut() {
            Some((last, items)) if *last == rec => items.push(e),
            _ => groups.push((rec, vec![e])),
        }
    }
    Ok(groups)
}

/// Writes entries as binary float vectors.
pub fn write_ark_binary<W: Write>(mut w: W, entries: &[ArkEntry]) -> Result<(), DiarizeError> {
    for e in entries {
        w.write_all(e.name.as_bytes())?;
        w.write_all(b" \0BFV \x04")?;
        let dim = i32::try_from(e.values.len())
            .map_err(|_| DiarizeError::Archive(format!("{}: vector too long", e.name)))?;
        w.write_all(&dim.to_le_bytes())?;
        for &v in &e.values {
            w.write_all(&(v as f32).to_le_bytes())?;
        }
    }
    Ok(())
}

/// Writes entries in Kaldi text form.
pub fn write_ark_text<W: Write>(mut w: W, entries: &[ArkEntry]) -> Result<(), DiarizeError> {
    for e in entries {
        write!(w, "{}  [", e.name)?;
        for v in &e.values {
            write!(w, " {v}")?;
        }
        writeln!(w, " ]")?;
    }
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    source: &'a str,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn err(&self, msg: impl Into<String>) -> DiarizeError {
        DiarizeError::Archive(format!("{} at byte {}: {}", self.source, self.pos, msg.into()))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek_bytes(&self, n: usize) -> Option<&'a [u8]> {
        self.buf.get(self.pos..self.pos + n)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DiarizeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(self.err("unexpected end of archive"));
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Name up to the next space; consumes one separating space.
    fn token(&mut self) -> Result<String, DiarizeError> {
        let start = self.pos;
        while self.pos < self.buf.len() && !self.buf[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| self.err("entry name is not UTF-8"))?
            .to_string();
        if name.is_empty() {
            return Err(self.err("empty entry name"));
        }
        if self.pos < self.buf.len() && self.buf[self.pos] == b' ' {
            self.pos += 1;
        }
        Ok(name)
    }

    fn binary_vector(&mut self) -> Result<Vec<f64>, DiarizeError> {
        let kind = self.take(3)?.to_vec();
        let width = match kind.as_slice() {
            b"FV " => 4,
            b"DV " => 8,
            other => return Err(self.err(format!("unsupported binary type {:?}", String::from_utf8_lossy(other)))),
        };
        if self.take(1)? != [4] {
            return Err(self.err("expected 4-byte dimension marker"));
        }
        let dim_bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| self.err("short dimension"))?;
        let dim = i32::from_le_bytes(dim_bytes);
        let dim = usize::try_from(dim).map_err(|_| self.err(format!("negative dimension {dim}")))?;
        let payload = self.take(dim * width)?;
        let values = if width == 4 {
            payload
                .chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect()
        } else {
            payload
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect()
        };
        Ok(values)
    }

    fn text_vector(&mut self) -> Result<Vec<f64>, DiarizeError> {
        self.skip_whitespace();
        if self.take(1)? != b"[" {
            return Err(self.err("expected '['"));
        }
        let mut values = Vec::new();
        loop {
            self.skip_whitespace();
            if self.at_end() {
                return Err(self.err("unterminated text vector"));
            }
            if self.buf[self.pos] == b']' {
                self.pos += 1;
                return Ok(values);
            }
            let start = self.pos;
            while self.pos < self.buf.len() && !self.buf[self.pos].is_ascii_whitespace() && self.buf[self.pos] != b']' {
                self.pos += 1;
            }
            let tok = std::str::from_utf8(&self.buf[start..self.pos]).map_err(|_| self.err("non-UTF-8 value"))?;
            let v = tok
                .parse::<f64>()
                .map_err(|_| self.err(format!("bad value {tok:?}")))?;
            values.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<ArkEntry> {
        vec![
            ArkEntry { name: "rec1_0_0001".into(), values: vec![0.5, -1.0, 2.25] },
            ArkEntry { name: "rec1_1_0001".into(), values: vec![1.0, 0.0, 0.0] },
            ArkEntry { name: "rec2_0_0001".into(), values: vec![0.0, 0.125, 3.0] },
        ]
    }

    #[test]
    fn binary_round_trip() {
        let mut buf = Vec::new();
        write_ark_binary(&mut buf, &entries()).unwrap();
        let back = read_ark(buf.as_slice(), "mem").unwrap();
        assert_eq!(back, entries());
    }

    #[test]
    fn reads_text_archive() {
        let text = "a_0_1  [ 1 2.5 -3 ]\nb_0_1 [4 5]\n";
        let back = read_ark(text.as_bytes(), "mem").unwrap();
        assert_eq!(back[0].values, vec![1.0, 2.5, -3.0]);
        assert_eq!(back[1].name, "b_0_1");
        assert_eq!(back[1].values, vec![4.0, 5.0]);
    }

    #[test]
    fn reads_double_vectors() {
        let mut buf = b"x_0_1 \0BDV \x04".to_vec();
        buf.extend_from_slice(&2i32.to_le_bytes());
        buf.extend_from_slice(&1.5f64.to_le_bytes());
        buf.extend_from_slice(&(-2.0f64).to_le_bytes());
        let back = read_ark(buf.as_slice(), "mem").unwrap();
        assert_eq!(back[0].values, vec![1.5, -2.0]);
    }

    #[test]
    fn truncated_binary_is_an_error() {
        let mut buf = Vec::new();
        write_ark_binary(&mut buf, &entries()[..1]).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(read_ark(buf.as_slice(), "mem"), Err(DiarizeError::Archive(_))));
    }

    #[test]
    fn parses_names() {
        let n = EmbeddingName::parse("sess_a_1_0042").unwrap();
        assert_eq!(n.recording, "sess_a");
        assert_eq!(n.channel, 1);
        assert_eq!(n.index, "0042");
        let n = EmbeddingName::parse("rec_0007").unwrap();
        assert_eq!(n.recording, "rec");
        assert_eq!(n.channel, 0);
        assert!(EmbeddingName::parse("plain").is_err());
        assert!(EmbeddingName::parse("rec_x_1").is_err());
    }

    #[test]
    fn groups_consecutive_recordings() {
        let groups = group_by_recording(entries()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "rec1");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "rec2");
    }
}
