//! Binary weight files and checkpoint naming.
//!
//! A weight file is a flat sequence of 9-byte records, one per trainable weight of every
//! non-input layer, in layer order and then weight order:
//!
//! ```text
//! [layer index: u8] [value: f64 little-endian]
//! ```
//!
//! Only weight values are stored. Loading checks the record count and layer ordering
//! against the network before touching any weight, so a rejected file leaves the network
//! unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{NetError, NetResult, Network};

/// Bytes per weight record.
pub const RECORD_SIZE: usize = 1 + std::mem::size_of::<f64>();

/// File extension of weight files.
pub const WEIGHTS_EXTENSION: &str = "weights-bin";

/// Directory (under the output directory) that holds per-epoch checkpoints.
pub const CHECKPOINT_DIR: &str = "weights";

/// Serialize every weight value of `network`.
///
/// # Errors
/// - `Configuration` if a weighted layer's index does not fit the one-byte layer field
pub fn encode_weights(network: &Network) -> NetResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(network.weight_count() * RECORD_SIZE);
    for (l, layer) in network.layers().iter().enumerate().skip(1) {
        if layer.weight_count() == 0 {
            continue;
        }
        let tag = u8::try_from(l).map_err(|_| {
            NetError::Configuration(format!("layer {l} does not fit a one-byte weight record"))
        })?;
        for &value in &layer.weights().value {
            bytes.push(tag);
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    Ok(bytes)
}

/// Restore weight values from `bytes` into `network`.
///
/// # Errors
/// - `MalformedWeights` if the buffer is not a whole number of records or a record names
///   the wrong layer
/// - `WeightCountMismatch` if the record count differs from the network's weight count
pub fn decode_weights(network: &mut Network, bytes: &[u8]) -> NetResult<()> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(NetError::MalformedWeights(format!(
            "{} bytes is not a multiple of the {RECORD_SIZE}-byte record size",
            bytes.len()
        )));
    }
    let found = bytes.len() / RECORD_SIZE;
    let expected = network.weight_count();
    if found != expected {
        return Err(NetError::WeightCountMismatch { expected, found });
    }

    // stage everything first so a bad file never leaves a half-loaded network
    let mut records = bytes.chunks_exact(RECORD_SIZE);
    let mut staged: Vec<(usize, Vec<f64>)> = Vec::new();
    for (l, layer) in network.layers().iter().enumerate().skip(1) {
        let count = layer.weight_count();
        if count == 0 {
            continue;
        }
        let mut values = Vec::with_capacity(count);
        for (i, record) in records.by_ref().take(count).enumerate() {
            if usize::from(record[0]) != l {
                return Err(NetError::MalformedWeights(format!(
                    "record {i} of layer {l} is tagged with layer {}",
                    record[0]
                )));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&record[1..]);
            values.push(f64::from_le_bytes(raw));
        }
        staged.push((l, values));
    }

    for (l, values) in staged {
        let weights = network.layers_mut()[l].weights_mut();
        for (slot, value) in weights.value.iter_mut().zip(values) {
            *slot = value;
        }
    }
    Ok(())
}

/// Write the network's weights to `path`, creating parent directories.
///
/// # Errors
/// - `Resource` if the directory or the file cannot be written
pub fn save_weights(network: &Network, path: &Path) -> NetResult<()> {
    let bytes = encode_weights(network)?;
    let resource = |source| NetError::Resource {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(resource)?;
    }
    fs::write(path, bytes).map_err(resource)
}

/// Read weights from `path` into the network.
///
/// # Errors
/// - `Io` if the file cannot be read
/// - any error of [`decode_weights`]
pub fn load_weights(network: &mut Network, path: &Path) -> NetResult<()> {
    let bytes = fs::read(path)?;
    decode_weights(network, &bytes)
}

/// `<name> (epoch <e> - <loss> AvgTrainLoss).weights-bin`
pub fn weights_file_name(name: &str, epoch: usize, avg_loss: f64) -> String {
    format!("{name} (epoch {epoch} - {avg_loss} AvgTrainLoss).{WEIGHTS_EXTENSION}")
}

/// Per-epoch checkpoint path, under `<output_dir>/weights/`.
pub fn epoch_checkpoint_path(
    output_dir: &Path,
    name: &str,
    epoch: usize,
    avg_loss: f64,
) -> PathBuf {
    output_dir
        .join(CHECKPOINT_DIR)
        .join(weights_file_name(name, epoch, avg_loss))
}

/// Final weights path, directly in `output_dir`.
pub fn final_weights_path(output_dir: &Path, name: &str, epoch: usize, avg_loss: f64) -> PathBuf {
    output_dir.join(weights_file_name(name, epoch, avg_loss))
}

/// Remove a file written earlier in the run.
///
/// # Errors
/// - `Resource` if the file exists but cannot be removed
pub fn remove_checkpoint(path: &Path) -> NetResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(NetError::Resource {
            path: path.to_path_buf(),
            source,
        }),
    }
}
