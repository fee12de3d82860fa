//! One `InferenceBackend` per hardware kind.
//!
//! All three run the kernel on dedicated worker threads fed by a bounded job
//! queue; they differ in how many workers exist and who owns the runtime.
//! A caller facing a full queue waits for a slot, bounded by the
//! descriptor's timeout.

mod cpu;
mod gpu;
mod npu;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{InferenceError, ModelLoadError};
use crate::frame::Frame;
use crate::queue::{BoundedQueue, OverflowPolicy, PopOutcome, PushOutcome};

use super::backend::{BackendStats, ModelRuntime, OutputRows};
use super::decode::decode_rows;
use super::preprocess::{preprocess, InputTensor};
use super::{BackendDescriptor, RawDetection};

pub use cpu::CpuBackend;
pub use gpu::GpuBackend;
pub use npu::NpuBackend;

const WORKER_POLL: Duration = Duration::from_millis(100);

type Reply = Result<OutputRows, InferenceError>;

struct Job {
    input: InputTensor,
    reply: mpsc::SyncSender<Reply>,
    /// Set by a caller that stopped waiting; the job is skipped.
    abandoned: Arc<AtomicBool>,
}

/// Bounded job queue plus the threads draining it.
pub(crate) struct WorkerPool {
    name: String,
    jobs: Arc<BoundedQueue<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    unloaded: AtomicBool,
    stats: Mutex<BackendStats>,
}

impl WorkerPool {
    /// Spawn `workers` threads sharing one runtime.
    pub(crate) fn shared(
        name: &str,
        runtime: Arc<dyn ModelRuntime>,
        workers: usize,
        depth: usize,
    ) -> Result<Self, ModelLoadError> {
        let pool = Self::empty(name, depth);
        for index in 0..workers.max(1) {
            let runtime = Arc::clone(&runtime);
            pool.spawn(format!("{}-{}", name, index), move |jobs| {
                drain(&jobs, runtime.as_ref())
            })?;
        }
        Ok(pool)
    }

    /// Spawn a single thread that builds its runtime itself and keeps it
    /// for its whole life. Returns once the load has finished.
    pub(crate) fn thread_affine<F>(
        name: &str,
        depth: usize,
        load: F,
    ) -> Result<Self, ModelLoadError>
    where
        F: FnOnce() -> Result<Arc<dyn ModelRuntime>, ModelLoadError> + Send + 'static,
    {
        let pool = Self::empty(name, depth);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        pool.spawn(format!("{}-device", name), move |jobs| match load() {
            Ok(runtime) => {
                let _ = ready_tx.send(Ok(()));
                drain(&jobs, runtime.as_ref());
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(pool),
            Ok(Err(e)) => {
                pool.shutdown();
                Err(e)
            }
            Err(_) => {
                pool.shutdown();
                Err(ModelLoadError::Worker(format!(
                    "{}: device thread exited during load",
                    name
                )))
            }
        }
    }

    fn empty(name: &str, depth: usize) -> Self {
        Self {
            name: name.to_string(),
            jobs: Arc::new(BoundedQueue::new(depth, OverflowPolicy::Reject)),
            workers: Mutex::new(Vec::new()),
            unloaded: AtomicBool::new(false),
            stats: Mutex::new(BackendStats::default()),
        }
    }

    fn spawn<F>(&self, thread_name: String, body: F) -> Result<(), ModelLoadError>
    where
        F: FnOnce(Arc<BoundedQueue<Job>>) + Send + 'static,
    {
        let jobs = Arc::clone(&self.jobs);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || body(jobs))
            .map_err(|e| ModelLoadError::Worker(e.to_string()))?;
        lock(&self.workers).push(handle);
        Ok(())
    }

    /// Preprocess on the calling thread, run on a worker, decode the result.
    pub(crate) fn predict(
        &self,
        descriptor: &BackendDescriptor,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(InferenceError::Unloaded);
        }
        let started = Instant::now();
        let result = self.submit(descriptor, frame);
        self.record(&result, started.elapsed());
        result
    }

    fn submit(
        &self,
        descriptor: &BackendDescriptor,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let input = preprocess(
            frame,
            descriptor.input_width,
            descriptor.input_height,
            descriptor.mean,
            descriptor.std,
        )?;
        let deadline = Instant::now() + descriptor.timeout;
        let abandoned = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job = Job {
            input,
            reply: reply_tx,
            abandoned: Arc::clone(&abandoned),
        };
        match self.jobs.push_timeout(job, descriptor.timeout) {
            PushOutcome::Queued | PushOutcome::Evicted(_) => {}
            PushOutcome::Rejected(_) => return Err(InferenceError::Timeout(descriptor.timeout)),
            PushOutcome::Closed(_) => return Err(InferenceError::Unloaded),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let rows = match reply_rx.recv_timeout(remaining) {
            Ok(reply) => reply?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                return Err(InferenceError::Timeout(descriptor.timeout));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(InferenceError::Unloaded),
        };
        decode_rows(&rows, descriptor)
    }

    fn record(&self, result: &Result<Vec<RawDetection>, InferenceError>, latency: Duration) {
        let mut stats = lock(&self.stats);
        match result {
            Ok(_) => {
                stats.predictions += 1;
                stats.last_latency = Some(latency);
                stats.total_latency += latency;
            }
            Err(InferenceError::Timeout(_)) => stats.timeouts += 1,
            Err(_) => stats.failures += 1,
        }
    }

    pub(crate) fn stats(&self) -> BackendStats {
        lock(&self.stats).clone()
    }

    /// Refuse new work, let queued and in-flight calls finish, join workers.
    pub(crate) fn shutdown(&self) {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.jobs.close();
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("backend {}: worker thread panicked", self.name);
            }
        }
        log::info!("backend {}: unloaded", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(jobs: &BoundedQueue<Job>, runtime: &dyn ModelRuntime) {
    loop {
        match jobs.pop_timeout(WORKER_POLL) {
            PopOutcome::Item(job) if job.abandoned.load(Ordering::SeqCst) => {}
            PopOutcome::Item(job) => {
                let reply = runtime.run(&job.input);
                // The caller may have timed out and gone away.
                let _ = job.reply.try_send(reply);
            }
            PopOutcome::TimedOut => {}
            PopOutcome::Closed => return,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::HardwareKind;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct CountingRuntime {
        runs: AtomicUsize,
        delay: Duration,
    }

    impl ModelRuntime for CountingRuntime {
        fn run(&self, _input: &InputTensor) -> Result<OutputRows, InferenceError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(OutputRows::new(Vec::new(), 6))
        }
    }

    #[test]
    fn abandoned_jobs_release_their_slot() {
        let runtime = Arc::new(CountingRuntime {
            runs: AtomicUsize::new(0),
            delay: Duration::from_millis(150),
        });
        let pool = Arc::new(
            WorkerPool::shared("count", Arc::clone(&runtime) as Arc<dyn ModelRuntime>, 1, 1)
                .unwrap(),
        );
        let mut descriptor = BackendDescriptor::new("count", HardwareKind::Gpu, "stub://m");
        descriptor.input_width = 8;
        descriptor.input_height = 8;
        descriptor.timeout = Duration::from_millis(60);

        // The first call occupies the worker; the second queues behind it
        // and gives up before the worker gets to it.
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let descriptor = descriptor.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(10 * i));
                    let frame = Frame::from_rgb(vec![0; 8 * 8 * 3], 8, 8, 1, Utc::now()).unwrap();
                    pool.predict(&descriptor, &frame)
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(InferenceError::Timeout(_))
            ));
        }

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(runtime.runs.load(Ordering::SeqCst), 1);
        assert!(pool.jobs.is_empty());
        assert_eq!(pool.stats().timeouts, 2);
    }
}
