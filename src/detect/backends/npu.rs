use std::sync::Arc;

use crate::detect::backend::{BackendStats, InferenceBackend};
use crate::detect::runtime::RuntimeLoader;
use crate::detect::{BackendDescriptor, RawDetection};
use crate::error::{InferenceError, ModelLoadError};
use crate::frame::Frame;

use super::WorkerPool;

/// NPU backend: the device context is bound to one thread.
///
/// The model is loaded on the device thread and every call runs there;
/// no other thread ever touches the runtime.
pub struct NpuBackend {
    descriptor: BackendDescriptor,
    pool: WorkerPool,
}

impl NpuBackend {
    pub fn load(
        descriptor: BackendDescriptor,
        loader: &RuntimeLoader,
    ) -> Result<Arc<dyn InferenceBackend>, ModelLoadError> {
        let loader = loader.clone();
        let for_thread = descriptor.clone();
        let pool = WorkerPool::thread_affine(
            &format!("npu-{}", descriptor.id),
            descriptor.concurrency_limit.max(1),
            move || loader.load(&for_thread),
        )?;
        log::info!(
            "backend {}: loaded {} on npu",
            descriptor.id,
            descriptor.model_path
        );
        Ok(Arc::new(Self { descriptor, pool }))
    }
}

impl InferenceBackend for NpuBackend {
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
