use std::sync::Arc;

use crate::detect::backend::{BackendStats, InferenceBackend};
use crate::detect::preprocess::InputTensor;
use crate::detect::runtime::RuntimeLoader;
use crate::detect::{BackendDescriptor, RawDetection};
use crate::error::{InferenceError, ModelLoadError};
use crate::frame::Frame;

use super::WorkerPool;

/// GPU backend: one stream, calls serialized in arrival order.
///
/// At most `concurrency_limit` calls are queued for the stream; further
/// callers wait for a slot until their timeout. The kernel runs once on a
/// blank tensor at load so the first frame does not pay for lazy device
/// initialisation.
pub struct GpuBackend {
    descriptor: BackendDescriptor,
    pool: WorkerPool,
}

impl GpuBackend {
    pub fn load(
        descriptor: BackendDescriptor,
        loader: &RuntimeLoader,
    ) -> Result<Arc<dyn InferenceBackend>, ModelLoadError> {
        let runtime = loader.load(&descriptor)?;
        runtime
            .run(&InputTensor::zeros(
                descriptor.input_width,
                descriptor.input_height,
            ))
            .map_err(|e| ModelLoadError::Corrupt {
                path: descriptor.model_path.clone(),
                reason: format!("warm-up failed: {}", e),
            })?;
        let pool = WorkerPool::shared(
            &format!("gpu-{}", descriptor.id),
            runtime,
            1,
            descriptor.concurrency_limit.max(1),
        )?;
        log::info!(
            "backend {}: loaded {} on gpu",
            descriptor.id,
            descriptor.model_path
        );
        Ok(Arc::new(Self { descriptor, pool }))
    }
}

impl InferenceBackend for GpuBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn predict(&self, frame: &Frame) -> Result<Vec<RawDetection>, InferenceError> {
        self.pool.predict(&self.descriptor, frame)
    }

    fn unload(&self) {
        self.pool.shutdown();
    }

    fn stats(&self) -> BackendStats {
        self.pool.stats()
    }
}
