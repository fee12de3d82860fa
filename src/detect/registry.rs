use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ModelLoadError;

use super::backend::InferenceBackend;
use super::backends::{CpuBackend, GpuBackend, NpuBackend};
use super::runtime::RuntimeLoader;
use super::{BackendDescriptor, HardwareKind};

/// Builds a loaded backend for one hardware kind.
pub type BackendConstructor =
    fn(BackendDescriptor, &RuntimeLoader) -> Result<Arc<dyn InferenceBackend>, ModelLoadError>;

/// Lookup table from hardware kind to backend constructor.
///
/// Resolution happens once per load; nothing downstream branches on the
/// hardware kind.
pub struct BackendRegistry {
    constructors: HashMap<HardwareKind, BackendConstructor>,
    loader: RuntimeLoader,
}

impl BackendRegistry {
    /// Empty registry. Every load fails until constructors are registered.
    pub fn new(loader: RuntimeLoader) -> Self {
        Self {
            constructors: HashMap::new(),
            loader,
        }
    }

    /// Registry with the built-in CPU, GPU and NPU backends.
    pub fn with_defaults(loader: RuntimeLoader) -> Self {
        let mut registry = Self::new(loader);
        registry.register(HardwareKind::Cpu, CpuBackend::load);
        registry.register(HardwareKind::Gpu, GpuBackend::load);
        registry.register(HardwareKind::Npu, NpuBackend::load);
        registry
    }

    /// Register (or replace) the constructor for a hardware kind.
    pub fn register(&mut self, kind: HardwareKind, constructor: BackendConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn supports(&self, kind: HardwareKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    pub fn load(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<dyn InferenceBackend>, ModelLoadError> {
        let constructor = self
            .constructors
            .get(&descriptor.hardware)
            .ok_or_else(|| ModelLoadError::UnsupportedHardware(descriptor.hardware.to_string()))?;
        constructor(descriptor.clone(), &self.loader)
    }
}

// ----------------------------------------------------------------------------
// Shared instances
// ----------------------------------------------------------------------------

struct PoolEntry {
    backend: Arc<dyn InferenceBackend>,
    leases: usize,
}

/// Loaded backends shared by descriptor identity.
///
/// Tasks that use the same model on the same hardware get the same
/// instance. The instance is unloaded when its last lease is dropped.
pub struct BackendPool {
    registry: BackendRegistry,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl BackendPool {
    pub fn new(registry: BackendRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Lease an instance, loading it when no task holds one yet.
    pub fn acquire(
        self: &Arc<Self>,
        descriptor: &BackendDescriptor,
    ) -> Result<BackendLease, ModelLoadError> {
        let key = descriptor.identity_key();
        let mut entries = self.lock();
        let backend = match entries.get_mut(&key) {
            Some(entry) => {
                entry.leases += 1;
                log::debug!(
                    "backend {}: shared ({} leases)",
                    descriptor.id,
                    entry.leases
                );
                Arc::clone(&entry.backend)
            }
            None => {
                let backend = self.registry.load(descriptor)?;
                entries.insert(
                    key.clone(),
                    PoolEntry {
                        backend: Arc::clone(&backend),
                        leases: 1,
                    },
                );
                backend
            }
        };
        Ok(BackendLease {
            key,
            backend,
            pool: Arc::clone(self),
        })
    }

    /// Number of leases on the instance for this descriptor.
    pub fn leases(&self, descriptor: &BackendDescriptor) -> usize {
        self.lock()
            .get(&descriptor.identity_key())
            .map(|e| e.leases)
            .unwrap_or(0)
    }

    pub fn loaded(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, key: &str) {
        let released = {
            let mut entries = self.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.leases > 1 => {
                    entry.leases -= 1;
                    None
                }
                Some(_) => entries.remove(key),
                None => None,
            }
        };
        // Unload outside the lock; it waits for in-flight calls.
        if let Some(entry) = released {
            entry.backend.unload();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A task's hold on a shared backend. Dropping it releases the hold.
pub struct BackendLease {
    key: String,
    backend: Arc<dyn InferenceBackend>,
    pool: Arc<BackendPool>,
}

impl BackendLease {
    pub fn backend(&self) -> &dyn InferenceBackend {
        self.backend.as_ref()
    }
}

impl std::ops::Deref for BackendLease {
    type Target = dyn InferenceBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
