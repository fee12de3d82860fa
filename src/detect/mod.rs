//! Hardware-abstracted inference.
//!
//! Callers hold an `InferenceBackend` and call the blocking `predict` on a
//! frame; how calls are scheduled onto the hardware (a CPU worker pool, a
//! single serialized GPU stream, a thread-affine NPU device) is an
//! implementation detail of each backend. Backend selection happens exactly
//! once, at load time, through the `BackendRegistry` lookup table.
//!
//! The numeric kernel itself sits behind the narrow `ModelRuntime` trait:
//! `stub://` models are synthetic, `.onnx` models run on tract
//! (feature: backend-tract).

mod backend;
mod backends;
mod decode;
mod preprocess;
mod registry;
mod runtime;
#[cfg(feature = "backend-tract")]
mod tract;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::BoundingBox;

pub use backend::{BackendStats, InferenceBackend, ModelRuntime, OutputRows};
pub use backends::{CpuBackend, GpuBackend, NpuBackend};
pub use decode::decode_rows;
pub use preprocess::{preprocess, InputTensor};
pub use registry::{BackendConstructor, BackendLease, BackendPool, BackendRegistry};
pub use runtime::{RuntimeLoader, SyntheticRuntime};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 1;
pub const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accelerator family a backend runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    #[serde(alias = "cpu_x86", alias = "cpu_arm")]
    Cpu,
    #[serde(alias = "nvidia_gpu")]
    Gpu,
    #[serde(alias = "atlas_npu")]
    Npu,
}

impl HardwareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareKind::Cpu => "cpu",
            HardwareKind::Gpu => "gpu",
            HardwareKind::Npu => "npu",
        }
    }
}

impl std::fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model plus the hardware it runs on.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendDescriptor {
    pub id: String,
    pub hardware: HardwareKind,
    /// File path, or `stub://...` for a synthetic model.
    pub model_path: String,
    pub input_width: u32,
    pub input_height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Class names indexed by model class id.
    pub labels: Vec<String>,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Parallel calls (CPU) or queue depth (GPU/NPU).
    pub concurrency_limit: usize,
    pub timeout: Duration,
}

impl BackendDescriptor {
    pub fn new(
        id: impl Into<String>,
        hardware: HardwareKind,
        model_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hardware,
            model_path: model_path.into(),
            input_width: DEFAULT_INPUT_SIZE,
            input_height: DEFAULT_INPUT_SIZE,
            mean: [0.0; 3],
            std: [1.0; 3],
            labels: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            timeout: DEFAULT_PREDICT_TIMEOUT,
        }
    }

    /// Key under which loaded instances are shared.
    ///
    /// Two descriptors with the same model, hardware and input contract map
    /// to one instance even when their ids differ.
    pub fn identity_key(&self) -> String {
        format!(
            "{}|{}|{}x{}|{:?}|{:?}|{}",
            self.hardware,
            self.model_path,
            self.input_width,
            self.input_height,
            self.mean,
            self.std,
            self.labels.join(",")
        )
    }

    /// Class name for a model class id; `class_<id>` when unlabelled.
    pub fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

/// One detection in model input space, before thresholding and NMS.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}
