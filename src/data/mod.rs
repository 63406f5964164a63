//! Dataset contract consumed by the training loop.
//!
//! ## Submodules
//!
//! - [`records`]: fixed-size labelled record files (`label byte + planar pixels`)
//!
//! The engine never parses images itself; it only indexes already-decoded samples through
//! the [`Dataset`] trait and visits them in a [`SampleOrder`].

pub mod records;

pub use records::{load_labelled_records, parse_labelled_records, RecordFormat};

use rand::{Rng, RngCore};

use crate::core::{NetError, NetResult};

/// One training example: raw pixel bytes in map-planar order plus a label distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub pixels: Vec<u8>,
    /// One value per class, in `[0, 1]`
    pub labels: Vec<f64>,
}

impl Sample {
    pub fn new(pixels: Vec<u8>, labels: Vec<f64>) -> Self {
        Self { pixels, labels }
    }

    /// Sample whose label distribution is one-hot at `class`.
    pub fn with_class(pixels: Vec<u8>, class: usize, class_count: usize) -> Self {
        Self::new(pixels, one_hot(class, class_count))
    }
}

/// Source of samples for training and evaluation.
pub trait Dataset: Send + Sync {
    fn sample_count(&self) -> usize;

    fn width(&self) -> usize;

    fn height(&self) -> usize;

    fn channels(&self) -> usize;

    fn class_count(&self) -> usize;

    /// Sample at `index`, `index < sample_count()`.
    fn sample(&self, index: usize) -> &Sample;

    /// Bytes per sample (`width * height * channels`).
    fn sample_size(&self) -> usize {
        self.width() * self.height() * self.channels()
    }

    /// Scramble the order in which the samples are visited. An order of the wrong length is
    /// reset to `0..sample_count()` first.
    fn shuffle(&self, order: &mut SampleOrder, rng: &mut dyn RngCore) {
        if order.len() != self.sample_count() {
            *order = SampleOrder::new(self.sample_count());
        }
        order.scramble(rng);
    }
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    width: usize,
    height: usize,
    channels: usize,
    class_count: usize,
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    /// Empty dataset with the given sample geometry.
    pub fn new(width: usize, height: usize, channels: usize, class_count: usize) -> Self {
        Self {
            width,
            height,
            channels,
            class_count,
            samples: Vec::new(),
        }
    }

    /// Append a sample after checking its sizes.
    ///
    /// # Errors
    /// - `Dataset` if the pixel or label count does not match the dataset
    pub fn push(&mut self, sample: Sample) -> NetResult<()> {
        if sample.pixels.len() != self.sample_size() {
            return Err(NetError::Dataset(format!(
                "sample has {} pixels, expected {}",
                sample.pixels.len(),
                self.sample_size()
            )));
        }
        if sample.labels.len() != self.class_count {
            return Err(NetError::Dataset(format!(
                "sample has {} labels, expected {}",
                sample.labels.len(),
                self.class_count
            )));
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Build from a list of samples.
    ///
    /// # Errors
    /// - `Dataset` if any sample does not fit the geometry
    pub fn from_samples(
        width: usize,
        height: usize,
        channels: usize,
        class_count: usize,
        samples: Vec<Sample>,
    ) -> NetResult<Self> {
        let mut dataset = Self::new(width, height, channels, class_count);
        for sample in samples {
            dataset.push(sample)?;
        }
        Ok(dataset)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl Dataset for InMemoryDataset {
    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn class_count(&self) -> usize {
        self.class_count
    }

    fn sample(&self, index: usize) -> &Sample {
        &self.samples[index]
    }
}

/// Order in which an epoch visits the samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOrder {
    indices: Vec<usize>,
}

impl SampleOrder {
    /// Identity order `0..count`.
    pub fn new(count: usize) -> Self {
        Self {
            indices: (0..count).collect(),
        }
    }

    /// Swap every position with a uniformly drawn one.
    pub fn scramble<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let n = self.indices.len();
        for i in 0..n {
            let j = rng.gen_range(0..n);
            self.indices.swap(i, j);
        }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// One-hot label distribution; an out-of-range class yields all zeros.
pub fn one_hot(class: usize, class_count: usize) -> Vec<f64> {
    let mut labels = vec![0.0; class_count];
    if let Some(slot) = labels.get_mut(class) {
        *slot = 1.0;
    }
    labels
}
