//! Training loop, background trainer, progress status and per-epoch metrics.
//!
//! ## States
//!
//! ```text
//! Idle --start--> Running --(all epochs | stop flag)--> Idle
//! ```
//!
//! The stop flag is polled between samples only; a sample in flight always finishes.
//! Whether the run ends normally or by stop, the final weights are written and the last
//! per-epoch checkpoint (now redundant) is removed.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::checkpoint;
use crate::core::{NetError, NetResult, Network};
use crate::data::{Dataset, SampleOrder};
use crate::Config;

/// Status text while no training runs.
pub const IDLE: &str = "Idle";

/// Metrics recorded at the end of each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean per-sample loss over the epoch
    pub avg_loss: f64,
    pub elapsed_secs: f64,
    pub samples_per_sec: f64,
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Epochs that ran to completion
    pub epochs_completed: usize,
    /// Whether the run ended on the stop flag
    pub stopped: bool,
    /// Running average loss of the last epoch that started
    pub avg_loss: f64,
    /// Final weight file, if it could be written
    pub final_weights: Option<PathBuf>,
    pub metrics: Vec<EpochMetrics>,
}

/// Cooperative cancellation flag shared with a training run.
#[derive(Debug, Clone, Default)]
pub struct TrainingControl {
    stop: Arc<AtomicBool>,
}

impl TrainingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to end after the sample in flight.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }
}

struct StatusInner {
    text: String,
    subscribers: Vec<Sender<String>>,
}

/// Human-readable progress line, shared between the training thread and observers.
///
/// Every change is pushed to all live subscribers.
#[derive(Clone)]
pub struct Status {
    inner: Arc<Mutex<StatusInner>>,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("text", &self.current())
            .finish()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                text: IDLE.to_string(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Replace the status text and notify subscribers; dropped receivers are forgotten.
    pub fn set(&self, text: impl Into<String>) {
        let text = text.into();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(text.clone()).is_ok());
        inner.text = text;
    }

    pub fn current(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text
            .clone()
    }

    /// Receive every future status change.
    pub fn subscribe(&self) -> Receiver<String> {
        let (sender, receiver) = channel();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .push(sender);
        receiver
    }
}

/// Train `network` on `dataset` for `config.epochs` epochs.
///
/// Each epoch visits the samples in a freshly scrambled order and takes one SGD step per
/// sample. Checkpoint write failures are logged and published on `status`; training goes on.
/// `status` is reset to [`IDLE`] when the run ends, successfully or not.
///
/// # Errors
/// - `Configuration` if the network is incomplete or its class count differs from the dataset
/// - `InputSize` if the dataset's samples do not fit the input layer
/// - `Dataset` if the dataset is empty
pub fn run(
    network: &mut Network,
    dataset: &dyn Dataset,
    config: &Config,
    control: &TrainingControl,
    status: &Status,
) -> NetResult<TrainingReport> {
    let result = run_epochs(network, dataset, config, control, status);
    status.set(IDLE);
    result
}

fn check_dataset(network: &Network, dataset: &dyn Dataset) -> NetResult<()> {
    network.validate()?;
    if dataset.sample_count() == 0 {
        return Err(NetError::Dataset("dataset has no samples".to_string()));
    }
    if dataset.sample_size() != network.input_size() {
        return Err(NetError::InputSize {
            expected: network.input_size(),
            found: dataset.sample_size(),
        });
    }
    if dataset.class_count() != network.class_count() {
        return Err(NetError::Configuration(format!(
            "dataset has {} classes but the network has {}",
            dataset.class_count(),
            network.class_count()
        )));
    }
    Ok(())
}

fn run_epochs(
    network: &mut Network,
    dataset: &dyn Dataset,
    config: &Config,
    control: &TrainingControl,
    status: &Status,
) -> NetResult<TrainingReport> {
    check_dataset(network, dataset)?;

    let total_epochs = config.epochs;
    let sample_count = dataset.sample_count();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut order = SampleOrder::new(sample_count);
    let mut report = TrainingReport {
        epochs_completed: 0,
        stopped: false,
        avg_loss: 0.0,
        final_weights: None,
        metrics: Vec::new(),
    };
    let mut last_checkpoint: Option<PathBuf> = None;
    let mut epoch = 0;

    info!(
        network = network.name(),
        epochs = total_epochs,
        samples = sample_count,
        threads = network.threads(),
        "training started"
    );

    while epoch < total_epochs && !report.stopped {
        epoch += 1;
        dataset.shuffle(&mut order, &mut rng);
        let started = Instant::now();
        let mut total_loss = 0.0;
        report.avg_loss = 0.0;

        for (s, &index) in order.as_slice().iter().enumerate() {
            let loss = network.train_sample(dataset.sample(index), epoch)?;
            total_loss += loss;
            report.avg_loss = total_loss / (s + 1) as f64;
            status.set(format!(
                "Epoch: {epoch}/{total_epochs}, sample: {}/{sample_count}, avg loss: {}",
                s + 1,
                report.avg_loss
            ));
            trace!(epoch, sample = s + 1, loss, "trained sample");

            if control.is_stop_requested() {
                report.stopped = true;
                break;
            }
        }
        if report.stopped {
            info!(epoch, avg_loss = report.avg_loss, "training stopped");
            break;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let metrics = EpochMetrics {
            epoch,
            avg_loss: report.avg_loss,
            elapsed_secs: elapsed,
            samples_per_sec: sample_count as f64 / elapsed.max(f64::EPSILON),
        };
        info!(
            epoch,
            avg_loss = metrics.avg_loss,
            elapsed_secs = metrics.elapsed_secs,
            samples_per_sec = metrics.samples_per_sec,
            "epoch complete"
        );
        report.metrics.push(metrics);
        report.epochs_completed = epoch;

        if config.checkpoints {
            let path = checkpoint::epoch_checkpoint_path(
                &config.output_dir,
                network.name(),
                epoch,
                report.avg_loss,
            );
            match network.save_weights(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "saved checkpoint");
                    last_checkpoint = Some(path);
                }
                Err(e) => report_resource_error(status, &e),
            }
        }
    }

    let path =
        checkpoint::final_weights_path(&config.output_dir, network.name(), epoch, report.avg_loss);
    match network.save_weights(&path) {
        Ok(()) => {
            info!(path = %path.display(), "saved final weights");
            report.final_weights = Some(path);
            if let Some(old) = last_checkpoint {
                if let Err(e) = checkpoint::remove_checkpoint(&old) {
                    report_resource_error(status, &e);
                }
            }
        }
        Err(e) => report_resource_error(status, &e),
    }

    Ok(report)
}

fn report_resource_error(status: &Status, error: &NetError) {
    warn!(%error, "checkpoint skipped");
    status.set(error.to_string());
}

/// Runs [`run`] on a dedicated thread so callers can poll status and stop it.
///
/// The training thread holds the network's lock for the whole run.
pub struct Trainer {
    network: Arc<Mutex<Network>>,
    dataset: Arc<dyn Dataset>,
    config: Config,
    control: TrainingControl,
    status: Status,
    handle: Option<JoinHandle<NetResult<TrainingReport>>>,
}

impl Trainer {
    pub fn new(network: Network, dataset: Arc<dyn Dataset>, config: Config) -> Self {
        Self {
            network: Arc::new(Mutex::new(network)),
            dataset,
            config,
            control: TrainingControl::new(),
            status: Status::new(),
            handle: None,
        }
    }

    /// Shared handle to the network; locking it blocks while training runs.
    pub fn network(&self) -> Arc<Mutex<Network>> {
        Arc::clone(&self.network)
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn control(&self) -> &TrainingControl {
        &self.control
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start training in the background. Returns `false` without doing anything when a run
    /// is already in progress.
    ///
    /// # Errors
    /// - `Io` if the thread cannot be spawned
    pub fn start(&mut self) -> NetResult<bool> {
        if self.is_running() {
            return Ok(false);
        }
        if let Some(previous) = self.handle.take() {
            // finished run whose result nobody collected
            match previous.join() {
                Ok(Ok(report)) => debug!(
                    epochs = report.epochs_completed,
                    "discarding uncollected training report"
                ),
                Ok(Err(error)) => warn!(%error, "previous training run failed"),
                Err(_) => warn!("previous training thread panicked"),
            }
        }

        self.control.reset();
        let network = Arc::clone(&self.network);
        let dataset = Arc::clone(&self.dataset);
        let config = self.config.clone();
        let control = self.control.clone();
        let status = self.status.clone();

        let handle = std::thread::Builder::new()
            .name("convnet-trainer".to_string())
            .spawn(move || {
                let mut network = network.lock().unwrap_or_else(PoisonError::into_inner);
                run(&mut network, dataset.as_ref(), &config, &control, &status)
            })?;
        self.handle = Some(handle);
        Ok(true)
    }

    /// Request a stop and wait for the in-flight sample to finish.
    ///
    /// # Errors
    /// - any error the run ended with, or `TrainerPanicked`
    pub fn stop(&mut self) -> NetResult<Option<TrainingReport>> {
        self.control.request_stop();
        self.wait()
    }

    /// Wait for the current run to end. `Ok(None)` when nothing was started.
    ///
    /// # Errors
    /// - any error the run ended with, or `TrainerPanicked`
    pub fn wait(&mut self) -> NetResult<Option<TrainingReport>> {
        match self.handle.take() {
            None => Ok(None),
            Some(handle) => match handle.join() {
                Ok(result) => result.map(Some),
                Err(_) => {
                    self.status.set(IDLE);
                    Err(NetError::TrainerPanicked)
                }
            },
        }
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.control.request_stop();
            let _ = handle.join();
        }
    }
}
