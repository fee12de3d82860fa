use std::sync::Arc;

use crate::detect::backend::{BackendStats, InferenceBackend};
use crate::detect::runtime::RuntimeLoader;
use crate::detect::{BackendDescriptor, RawDetection};
use crate::error::{InferenceError, ModelLoadError};
use crate::frame::Frame;

use super::WorkerPool;

/// Callers waiting for a free CPU worker, per worker.
const QUEUE_PER_WORKER: usize = 4;

/// CPU backend: `concurrency_limit` workers run the shared kernel in
/// parallel.
pub struct CpuBackend {
    descriptor: BackendDescriptor,
    pool: WorkerPool,
}

impl CpuBackend {
    pub fn load(
        descriptor: BackendDescriptor,
        loader: &RuntimeLoader,
    ) -> Result<Arc<dyn InferenceBackend>, ModelLoadError> {
        let runtime = loader.load(&descriptor)?;
        let workers = descriptor.concurrency_limit.max(1);
        let pool = WorkerPool::shared(
            &format!("cpu-{}", descriptor.id),
            runtime,
            workers,
            workers * QUEUE_PER_WORKER,
        )?;
        log::info!(
            "backend {}: loaded {} on cpu with {} workers",
            descriptor.id,
            descriptor.model_path,
            workers
        );
        Ok(Arc::new(Self { descriptor, pool }))
    }
}

impl InferenceBackend for CpuBackend {
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
