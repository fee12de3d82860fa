use std::time::Duration;

use crate::error::InferenceError;
use crate::frame::Frame;

use super::preprocess::InputTensor;
use super::{BackendDescriptor, RawDetection};

/// Uniform inference interface over every hardware kind.
///
/// `predict` blocks until the detections are ready or the descriptor's
/// timeout elapses, waiting its turn when the instance is at its
/// concurrency cap. A call that times out while queued is dropped; one that
/// already reached the device finishes in the background and its result is
/// discarded.
pub trait InferenceBackend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Detections in model input space.
    fn predict(&self, frame: &Frame) -> Result<Vec<RawDetection>, InferenceError>;

    /// Drain in-flight calls and release the runtime. Later calls fail
    /// with `InferenceError::Unloaded`.
    fn unload(&self);

    fn stats(&self) -> BackendStats;
}

/// The narrow contract every numeric kernel implements.
///
/// Receives one normalized CHW tensor (batch size 1) and returns the raw
/// output rows; decoding into detections happens above this layer.
pub trait ModelRuntime: Send + Sync {
    fn run(&self, input: &InputTensor) -> Result<OutputRows, InferenceError>;
}

/// Row-major model output: `len / columns` rows of `columns` values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputRows {
    pub data: Vec<f32>,
    pub columns: usize,
}

impl OutputRows {
    pub fn new(data: Vec<f32>, columns: usize) -> Self {
        Self { data, columns }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.columns.max(1))
    }

    pub fn len(&self) -> usize {
        if self.columns == 0 {
            0
        } else {
            self.data.len() / self.columns
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters for one loaded backend instance.
#[derive(Clone, Debug, Default)]
pub struct BackendStats {
    pub predictions: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub last_latency: Option<Duration>,
    pub total_latency: Duration,
}

impl BackendStats {
    pub fn average_latency(&self) -> Option<Duration> {
        if self.predictions == 0 {
            None
        } else {
            Some(self.total_latency / self.predictions as u32)
        }
    }
}
