use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{InferenceError, ModelLoadError};

use super::backend::{ModelRuntime, OutputRows};
use super::preprocess::InputTensor;
use super::BackendDescriptor;

/// Resolves a descriptor's model artifact to a runnable kernel.
///
/// - `stub://...` builds a `SyntheticRuntime`
/// - `*.onnx` loads through tract (feature: backend-tract)
///
/// Relative paths are resolved against `models_dir` when set.
#[derive(Clone, Debug, Default)]
pub struct RuntimeLoader {
    models_dir: Option<PathBuf>,
}

impl RuntimeLoader {
    pub fn new(models_dir: Option<PathBuf>) -> Self {
        Self { models_dir }
    }

    pub fn load(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<dyn ModelRuntime>, ModelLoadError> {
        if descriptor.model_path.starts_with("stub://") {
            return Ok(Arc::new(SyntheticRuntime::parse(&descriptor.model_path)?));
        }

        let path = self.resolve(&descriptor.model_path);
        if !path.is_file() {
            return Err(ModelLoadError::MissingArtifact(path.display().to_string()));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "onnx" => load_onnx(&path, descriptor),
            other => Err(ModelLoadError::Corrupt {
                path: path.display().to_string(),
                reason: format!("no runtime for model format '.{}'", other),
            }),
        }
    }

    fn resolve(&self, model_path: &str) -> PathBuf {
        let path = Path::new(model_path);
        match &self.models_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[cfg(feature = "backend-tract")]
fn load_onnx(
    path: &Path,
    descriptor: &BackendDescriptor,
) -> Result<Arc<dyn ModelRuntime>, ModelLoadError> {
    let runtime = super::tract::TractRuntime::load(
        path,
        descriptor.input_width,
        descriptor.input_height,
    )
    .map_err(|e| ModelLoadError::Corrupt {
        path: path.display().to_string(),
        reason: format!("{:#}", e),
    })?;
    Ok(Arc::new(runtime))
}

#[cfg(not(feature = "backend-tract"))]
fn load_onnx(
    path: &Path,
    _descriptor: &BackendDescriptor,
) -> Result<Arc<dyn ModelRuntime>, ModelLoadError> {
    Err(ModelLoadError::FeatureDisabled {
        what: format!("ONNX model {}", path.display()),
        feature: "backend-tract",
    })
}

// ----------------------------------------------------------------------------
// Synthetic runtime (stub://) for tests and demos
// ----------------------------------------------------------------------------

/// Emits a fixed set of `[x1, y1, x2, y2, confidence, class_id]` rows.
///
/// `stub://name?boxes=0:0.9:10:10:110:210;2:0.7:300:40:400:120` with optional
/// `delay_ms=N` (slow kernel), `fail=true` (every call fails),
/// `fail_first=N` (the first N calls fail) and `corrupt=true` (load fails).
#[derive(Debug)]
pub struct SyntheticRuntime {
    rows: Vec<f32>,
    delay: Duration,
    fail: bool,
    fail_first: u64,
    calls: AtomicU64,
}

impl SyntheticRuntime {
    pub fn parse(uri: &str) -> Result<Self, ModelLoadError> {
        let corrupt = |reason: String| ModelLoadError::Corrupt {
            path: uri.to_string(),
            reason,
        };
        let parsed = url::Url::parse(uri).map_err(|e| corrupt(e.to_string()))?;
        let mut runtime = Self {
            rows: Vec::new(),
            delay: Duration::ZERO,
            fail: false,
            fail_first: 0,
            calls: AtomicU64::new(0),
        };
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "boxes" => runtime.rows = parse_boxes(&value).map_err(corrupt)?,
                "delay_ms" => {
                    let ms = value
                        .parse()
                        .map_err(|_| corrupt(format!("bad delay_ms '{}'", value)))?;
                    runtime.delay = Duration::from_millis(ms);
                }
                "fail" => runtime.fail = value == "true",
                "fail_first" => {
                    runtime.fail_first = value
                        .parse()
                        .map_err(|_| corrupt(format!("bad fail_first '{}'", value)))?
                }
                "corrupt" if value == "true" => {
                    return Err(corrupt("synthetic model marked corrupt".to_string()))
                }
                _ => {}
            }
        }
        Ok(runtime)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ModelRuntime for SyntheticRuntime {
    fn run(&self, _input: &InputTensor) -> Result<OutputRows, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail || call <= self.fail_first {
            return Err(InferenceError::Runtime(format!(
                "synthetic kernel fault on call {}",
                call
            )));
        }
        Ok(OutputRows::new(self.rows.clone(), 6))
    }
}

fn parse_boxes(list: &str) -> Result<Vec<f32>, String> {
    let mut rows = Vec::new();
    for entry in list.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let fields: Vec<f32> = entry
            .split(':')
            .map(|f| f.trim().parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|_| format!("bad box '{}'", entry))?;
        let &[class_id, confidence, x1, y1, x2, y2] = fields.as_slice() else {
            return Err(format!("box '{}' needs class:conf:x1:y1:x2:y2", entry));
        };
        rows.extend_from_slice(&[x1, y1, x2, y2, confidence, class_id]);
    }
    Ok(rows)
}
