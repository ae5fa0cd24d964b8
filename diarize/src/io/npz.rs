use std::fs::File;
use std::path::Path;

use ndarray::{Array, Dimension};
use ndarray_npy::{NpzReader, NpzWriter};

use crate::DiarizeError;

/// Keyed array container backed by a NumPy `.npz` archive.
pub struct NpzBundle {
    reader: NpzReader<File>,
    source: String,
}

impl NpzBundle {
    pub fn open(path: &Path) -> Result<Self, DiarizeError> {
        let file = File::open(path)?;
        let reader = NpzReader::new(file).map_err(|e| DiarizeError::Npz(format!("{}: {e}", path.display())))?;
        Ok(Self {
            reader,
            source: path.display().to_string(),
        })
    }

    /// Reads entry `key` as `f64`, accepting `key` or `key.npy` and
    /// either float width on disk.
    pub fn array<D: Dimension>(&mut self, key: &str) -> Result<Array<f64, D>, DiarizeError> {
        let with_ext = format!("{key}.npy");
        for name in [key, with_ext.as_str()] {
            if let Ok(a) = self.reader.by_name::<ndarray::OwnedRepr<f64>, D>(name) {
                return Ok(a);
            }
            if let Ok(a) = self.reader.by_name::<ndarray::OwnedRepr<f32>, D>(name) {
                return Ok(a.mapv(f64::from));
            }
        }
        Err(DiarizeError::Npz(format!("{}: missing or malformed entry {key:?}", self.source)))
    }
}

/// Writer for `.npz` bundles, used to produce model fixtures.
pub struct NpzOut {
    writer: NpzWriter<File>,
}

impl NpzOut {
    pub fn create(path: &Path) -> Result<Self, DiarizeError> {
        Ok(Self {
            writer: NpzWriter::new(File::create(path)?),
        })
    }

    pub fn add<D: Dimension>(&mut self, name: &str, arr: &Array<f64, D>) -> Result<(), DiarizeError> {
        self.writer
            .add_array(name, arr)
            .map_err(|e| DiarizeError::Npz(e.to_string()))
    }

    pub fn finish(self) -> Result<(), DiarizeError> {
        self.writer.finish().map_err(|e| DiarizeError::Npz(e.to_string()))?;
        Ok(())
    }
}
