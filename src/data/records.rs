//! Fixed-size labelled record files.
//!
//! ## Record layout
//!
//! ```text
//! [label: u8] [map 0: width*height × u8] [map 1: ...] ... [map channels-1: ...]
//! ```
//!
//! Pixels stay channel-planar, which is the order the input layer lays out its maps.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{InMemoryDataset, Sample};
use crate::core::{NetError, NetResult};

/// Geometry of the records in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFormat {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub class_count: usize,
}

impl RecordFormat {
    pub fn pixel_count(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// Bytes per record (1 label + pixels).
    pub fn record_size(&self) -> usize {
        1 + self.pixel_count()
    }
}

/// Decode an in-memory record buffer.
///
/// # Errors
/// - `Dataset` if the buffer is not a whole number of records or a label is out of range
pub fn parse_labelled_records(bytes: &[u8], format: &RecordFormat) -> NetResult<InMemoryDataset> {
    let record_size = format.record_size();
    if bytes.len() % record_size != 0 {
        return Err(NetError::Dataset(format!(
            "{} bytes is not a multiple of record size {}",
            bytes.len(),
            record_size
        )));
    }

    let mut dataset = InMemoryDataset::new(
        format.width,
        format.height,
        format.channels,
        format.class_count,
    );
    for (i, record) in bytes.chunks_exact(record_size).enumerate() {
        let class = usize::from(record[0]);
        if class >= format.class_count {
            return Err(NetError::Dataset(format!(
                "record {i} has label {class} but there are {} classes",
                format.class_count
            )));
        }
        dataset.push(Sample::with_class(
            record[1..].to_vec(),
            class,
            format.class_count,
        ))?;
    }
    Ok(dataset)
}

/// Read and decode a record file.
///
/// # Errors
/// - `Io` if the file cannot be read
/// - `Dataset` if its contents do not match `format`
pub fn load_labelled_records(path: &Path, format: &RecordFormat) -> NetResult<InMemoryDataset> {
    let bytes = fs::read(path)?;
    let dataset = parse_labelled_records(&bytes, format)?;
    info!(
        path = %path.display(),
        samples = dataset.samples().len(),
        "loaded records"
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;

    fn format() -> RecordFormat {
        RecordFormat {
            width: 2,
            height: 1,
            channels: 2,
            class_count: 3,
        }
    }

    #[test]
    fn test_parse_records() {
        let bytes = [2, 10, 20, 30, 40, 0, 1, 2, 3, 4];
        let dataset = parse_labelled_records(&bytes, &format()).unwrap();
        assert_eq!(dataset.sample_count(), 2);
        assert_eq!(dataset.sample(0).pixels, vec![10, 20, 30, 40]);
        assert_eq!(dataset.sample(0).labels, vec![0.0, 0.0, 1.0]);
        assert_eq!(dataset.sample(1).labels, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_parse_rejects_partial_record() {
        let bytes = [0, 1, 2, 3];
        assert!(matches!(
            parse_labelled_records(&bytes, &format()),
            Err(NetError::Dataset(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_label() {
        let bytes = [5, 1, 2, 3, 4];
        assert!(parse_labelled_records(&bytes, &format()).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("convnet_test_records.bin");
        std::fs::write(&path, [1, 9, 9, 9, 9]).unwrap();
        let dataset = load_labelled_records(&path, &format()).unwrap();
        assert_eq!(dataset.sample(0).labels, vec![0.0, 1.0, 0.0]);
        let _ = std::fs::remove_file(&path);
    }
}
