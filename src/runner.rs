//! Per-task detection loop.
//!
//! A `TaskRunner` owns one worker thread. The thread opens the task's video
//! source, leases the shared inference backend, and then samples frames at
//! the task's cadence:
//!
//! ```text
//! latest frame -> predict -> postprocess -> debounce -> {sink, snapshot, dispatcher}
//!                                        \-> overlay feed
//! ```
//!
//! Status moves `Stopped -> Starting -> Running`, then to `Paused`,
//! `Stopping -> Stopped` or `Error`. A fatal stream failure, a backend that
//! cannot be loaded, or too many consecutive inference failures put the
//! task in `Error`; it stays there until restarted.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::{Alert, AlertContext, AlertSink, Debouncer, Decision, SnapshotStore};
use crate::broadcast::{OverlayFrame, OverlayHub};
use crate::detect::{BackendDescriptor, BackendLease, BackendPool};
use crate::error::{EngineError, InferenceError};
use crate::frame::Frame;
use crate::ingest::{StreamSource, VideoSourceDescriptor};
use crate::notify::Dispatcher;
use crate::postprocess::{self, Detection, Region, Thresholds};
use crate::schedule::Schedule;

pub const DEFAULT_TASK_CONFIDENCE: f32 = 0.8;
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INFERENCE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FRAME_WAIT: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// One schedulable detection task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub backend_id: String,
    pub source: VideoSourceDescriptor,
    pub regions: Vec<Region>,
    pub confidence_threshold: f32,
    pub class_thresholds: HashMap<String, f32>,
    pub schedule: Schedule,
    pub debounce_interval: Duration,
    pub inference_interval: Duration,
    pub enabled: bool,
    pub save_images: bool,
    pub alert_message: String,
}

impl TaskConfig {
    pub fn new(
        id: impl Into<String>,
        backend_id: impl Into<String>,
        source: VideoSourceDescriptor,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            backend_id: backend_id.into(),
            source,
            regions: Vec::new(),
            confidence_threshold: DEFAULT_TASK_CONFIDENCE,
            class_thresholds: HashMap::new(),
            schedule: Schedule::continuous(),
            debounce_interval: DEFAULT_DEBOUNCE_INTERVAL,
            inference_interval: DEFAULT_INFERENCE_INTERVAL,
            enabled: true,
            save_images: false,
            alert_message: crate::alert::DEFAULT_MESSAGE_TEMPLATE.to_string(),
        }
    }

    /// Time between samples: the inference interval or one frame at the
    /// source's fps, whichever is longer.
    pub fn sample_period(&self) -> Duration {
        let frame_period = if self.source.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.source.fps as f64)
        };
        self.inference_interval.max(frame_period)
    }

    fn thresholds(&self, nms: f32) -> Thresholds {
        Thresholds {
            default: self.confidence_threshold,
            per_class: self.class_thresholds.clone(),
            nms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Stopped => "stopped",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Error => "error",
        }
    }

    /// The runner thread has exited or is about to.
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Stopped | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus counters for one task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub frames_processed: u64,
    /// Samples with no frame available in time.
    pub frames_skipped: u64,
    pub detections: u64,
    pub alerts_emitted: u64,
    pub alerts_suppressed: u64,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<f64>,
    pub average_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stream_state: Option<String>,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub reconnect_attempts: u64,
}

impl TaskSnapshot {
    pub fn new(task_id: &str, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            frames_processed: 0,
            frames_skipped: 0,
            detections: 0,
            alerts_emitted: 0,
            alerts_suppressed: 0,
            consecutive_failures: 0,
            last_latency_ms: None,
            average_latency_ms: None,
            last_error: None,
            started_at: None,
            stream_state: None,
            frames_captured: 0,
            frames_dropped: 0,
            reconnect_attempts: 0,
        }
    }
}

/// Runner knobs that apply to every task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunnerSettings {
    /// How long a sample waits for a frame before it is skipped.
    pub frame_wait: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            frame_wait: DEFAULT_FRAME_WAIT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Collaborators shared by every runner.
pub struct RunnerContext {
    pub pool: Arc<BackendPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub sink: Arc<dyn AlertSink>,
    pub snapshots: Option<Arc<SnapshotStore>>,
    pub overlay: Arc<OverlayHub>,
    pub settings: RunnerSettings,
}

#[derive(Clone, Copy, Debug, Default)]
struct ControlFlags {
    stop: bool,
    paused: bool,
}

#[derive(Default)]
struct Control {
    flags: Mutex<ControlFlags>,
    changed: Condvar,
}

impl Control {
    fn flags(&self) -> ControlFlags {
        *lock(&self.flags)
    }

    fn update(&self, f: impl FnOnce(&mut ControlFlags)) {
        f(&mut lock(&self.flags));
        self.changed.notify_all();
    }

    /// Sleep until `deadline` unless stopped first. Returns the flags.
    fn sleep_until(&self, deadline: Instant) -> ControlFlags {
        let mut flags = lock(&self.flags);
        loop {
            let now = Instant::now();
            if flags.stop || now >= deadline {
                return *flags;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(flags, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            flags = guard;
        }
    }

    /// Block while paused; returns once resumed or stopped.
    fn wait_while_paused(&self) -> ControlFlags {
        let mut flags = lock(&self.flags);
        while flags.paused && !flags.stop {
            flags = self
                .changed
                .wait(flags)
                .unwrap_or_else(|e| e.into_inner());
        }
        *flags
    }
}

/// Handle to one running task.
pub struct TaskRunner {
    config: Arc<TaskConfig>,
    snapshot: Arc<Mutex<TaskSnapshot>>,
    control: Arc<Control>,
    worker: Option<JoinHandle<()>>,
}

impl TaskRunner {
    /// Spawn the task's worker. Opening the source and loading the backend
    /// happen on the worker; failures there show up as `Error` status.
    pub fn start(
        config: TaskConfig,
        backend: BackendDescriptor,
        context: Arc<RunnerContext>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let mut initial = TaskSnapshot::new(&config.id, TaskStatus::Starting);
        initial.started_at = Some(Utc::now());
        let snapshot = Arc::new(Mutex::new(initial));
        let control = Arc::new(Control::default());

        let worker = Worker {
            config: Arc::clone(&config),
            backend,
            context,
            snapshot: Arc::clone(&snapshot),
            control: Arc::clone(&control),
        };
        let handle = std::thread::Builder::new()
            .name(format!("task-{}", config.id))
            .spawn(move || worker.run())
            .map_err(|e| EngineError::Spawn {
                task: config.id.clone(),
                reason: e.to_string(),
            })?;
        log::info!("task {}: starting", config.id);

        Ok(Self {
            config,
            snapshot,
            control,
            worker: Some(handle),
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.snapshot).status
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        lock(&self.snapshot).clone()
    }

    /// Stop sampling but keep the source connected and the backend leased.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut snapshot = lock(&self.snapshot);
        match snapshot.status {
            TaskStatus::Running | TaskStatus::Starting => {
                self.control.update(|f| f.paused = true);
                if snapshot.status == TaskStatus::Running {
                    snapshot.status = TaskStatus::Paused;
                }
                log::info!("task {}: paused", self.config.id);
                Ok(())
            }
            TaskStatus::Paused => Ok(()),
            _ => Err(EngineError::NotRunning(self.config.id.clone())),
        }
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        let mut snapshot = lock(&self.snapshot);
        match snapshot.status {
            TaskStatus::Paused | TaskStatus::Starting => {
                self.control.update(|f| f.paused = false);
                if snapshot.status == TaskStatus::Paused {
                    snapshot.status = TaskStatus::Running;
                }
                log::info!("task {}: resumed", self.config.id);
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            _ => Err(EngineError::NotRunning(self.config.id.clone())),
        }
    }

    /// Ask the worker to wind down without waiting for it.
    pub fn request_stop(&self) {
        {
            let mut snapshot = lock(&self.snapshot);
            if !snapshot.status.is_finished() {
                snapshot.status = TaskStatus::Stopping;
            }
        }
        self.control.update(|f| f.stop = true);
    }

    /// Cooperative stop: the in-flight sample finishes, then the source is
    /// closed and the backend lease released. Blocks until the worker exits.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("task {}: worker panicked", self.config.id);
            }
        }
        let mut snapshot = lock(&self.snapshot);
        snapshot.status = TaskStatus::Stopped;
        log::info!("task {}: stopped", self.config.id);
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct Worker {
    config: Arc<TaskConfig>,
    backend: BackendDescriptor,
    context: Arc<RunnerContext>,
    snapshot: Arc<Mutex<TaskSnapshot>>,
    control: Arc<Control>,
}

/// Why the sampling loop ended.
enum Exit {
    Stopped,
    Failed(String),
}

impl Worker {
    fn run(self) {
        let task_id = self.config.id.clone();
        let exit = match self.open() {
            Ok((mut source, lease)) => {
                let exit = self.sample_loop(&source, &lease);
                source.close();
                drop(lease);
                exit
            }
            Err(reason) => Exit::Failed(reason),
        };
        self.context.overlay.close_task(&task_id);

        let mut snapshot = lock(&self.snapshot);
        match exit {
            Exit::Stopped => {
                if snapshot.status != TaskStatus::Stopping {
                    snapshot.status = TaskStatus::Stopped;
                }
            }
            Exit::Failed(reason) => {
                log::error!("task {}: {}", task_id, reason);
                snapshot.status = TaskStatus::Error;
                snapshot.last_error = Some(reason);
            }
        }
    }

    fn open(&self) -> Result<(StreamSource, BackendLease), String> {
        let lease = self
            .context
            .pool
            .acquire(&self.backend)
            .map_err(|e| format!("backend {}: {}", self.backend.id, e))?;
        let source = StreamSource::open(self.config.source.clone())
            .map_err(|e| format!("video source: {}", e))?;
        Ok((source, lease))
    }

    fn sample_loop(&self, source: &StreamSource, lease: &BackendLease) -> Exit {
        let config = &self.config;
        let settings = self.context.settings;
        let period = config.sample_period();
        let thresholds = config.thresholds(self.backend.nms_threshold);
        let alert_context = AlertContext {
            task_id: config.id.clone(),
            task_name: config.name.clone(),
            source_name: config.source.name.clone(),
            template: config.alert_message.clone(),
        };
        let mut debouncer = Debouncer::new(config.id.clone(), config.debounce_interval);
        let mut total_latency = Duration::ZERO;
        let mut timed_predictions: u32 = 0;

        {
            let mut snapshot = lock(&self.snapshot);
            if snapshot.status == TaskStatus::Starting {
                snapshot.status = if self.control.flags().paused {
                    TaskStatus::Paused
                } else {
                    TaskStatus::Running
                };
            }
        }
        log::info!(
            "task {}: running on {} every {:?}",
            config.id,
            config.source.display_uri(),
            period
        );

        let mut next_sample = Instant::now();
        loop {
            let mut flags = self.control.sleep_until(next_sample);
            if flags.paused && !flags.stop {
                flags = self.control.wait_while_paused();
                next_sample = Instant::now();
            }
            if flags.stop {
                return Exit::Stopped;
            }

            next_sample += period;
            let now = Instant::now();
            if next_sample < now {
                next_sample = now;
            }

            let frame = match source.latest_frame(settings.frame_wait) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    lock(&self.snapshot).frames_skipped += 1;
                    log::debug!(
                        "task {}: no frame within {:?}, skipped",
                        config.id,
                        settings.frame_wait
                    );
                    self.record_stream(source);
                    continue;
                }
                Err(e) if e.is_fatal() => {
                    self.record_stream(source);
                    return Exit::Failed(format!("video source: {}", e));
                }
                Err(e) => {
                    log::warn!("task {}: {}", config.id, e);
                    continue;
                }
            };

            let started = Instant::now();
            let result = lease.predict(&frame);
            let latency = started.elapsed();
            self.record_stream(source);

            match result {
                Ok(raw) => {
                    total_latency += latency;
                    timed_predictions = timed_predictions.saturating_add(1);
                    let detections = postprocess::process(
                        raw,
                        &thresholds,
                        &config.regions,
                        (self.backend.input_width, self.backend.input_height),
                        (frame.width, frame.height),
                    );
                    {
                        let mut snapshot = lock(&self.snapshot);
                        snapshot.frames_processed += 1;
                        snapshot.detections += detections.len() as u64;
                        snapshot.consecutive_failures = 0;
                        snapshot.last_latency_ms = Some(latency.as_secs_f64() * 1000.0);
                        snapshot.average_latency_ms = Some(
                            (total_latency / timed_predictions.max(1)).as_secs_f64() * 1000.0,
                        );
                    }
                    self.handle_detections(&mut debouncer, &alert_context, &frame, &detections);
                    self.context.overlay.publish(OverlayFrame {
                        task_id: config.id.clone(),
                        frame,
                        detections,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    let failures = {
                        let mut snapshot = lock(&self.snapshot);
                        snapshot.consecutive_failures += 1;
                        snapshot.last_error = Some(e.to_string());
                        snapshot.consecutive_failures
                    };
                    log::warn!(
                        "task {}: inference failed ({}/{}): {}",
                        config.id,
                        failures,
                        settings.max_consecutive_failures,
                        e
                    );
                    if matches!(e, InferenceError::Unloaded)
                        || failures >= settings.max_consecutive_failures.max(1)
                    {
                        return Exit::Failed(format!(
                            "{} consecutive inference failures, last: {}",
                            failures, e
                        ));
                    }
                }
            }
        }
    }

    fn handle_detections(
        &self,
        debouncer: &mut Debouncer,
        alert_context: &AlertContext,
        frame: &Frame,
        detections: &[Detection],
    ) {
        for detection in detections {
            let now = Utc::now();
            match debouncer.check(&detection.label, now) {
                Decision::Emit => self.emit(alert_context, frame, detection, now),
                Decision::Suppress => lock(&self.snapshot).alerts_suppressed += 1,
            }
        }
    }

    fn emit(
        &self,
        alert_context: &AlertContext,
        frame: &Frame,
        detection: &Detection,
        now: DateTime<Utc>,
    ) {
        let mut alert = Alert::new(alert_context, detection, now);
        if self.config.save_images {
            if let Some(store) = &self.context.snapshots {
                match store.save(frame, &detection.bbox, &detection.label, &alert.id, now) {
                    Ok(reference) => alert.image_ref = Some(reference),
                    Err(e) => log::warn!("task {}: snapshot failed: {:#}", self.config.id, e),
                }
            }
        }
        if let Err(e) = self.context.sink.record(&alert) {
            log::warn!("task {}: alert {} not recorded: {:#}", self.config.id, alert.id, e);
        }
        log::info!(
            "task {}: alert {} {} ({:.2})",
            self.config.id,
            alert.id,
            alert.class,
            alert.confidence
        );
        self.context.dispatcher.dispatch(&alert);
        lock(&self.snapshot).alerts_emitted += 1;
    }

    fn record_stream(&self, source: &StreamSource) {
        let stats = source.stats();
        let state = source.state();
        let mut snapshot = lock(&self.snapshot);
        snapshot.stream_state = Some(format!("{:?}", state));
        snapshot.frames_captured = stats.frames_captured;
        snapshot.frames_dropped = stats.frames_dropped;
        snapshot.reconnect_attempts = stats.reconnect_attempts;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::InMemoryAlertSink;
    use crate::detect::{BackendRegistry, HardwareKind, RuntimeLoader};
    use crate::notify::{RecordingNotifier, RetryPolicy};

    struct Harness {
        context: Arc<RunnerContext>,
        sink: Arc<InMemoryAlertSink>,
        notifier: RecordingNotifier,
    }

    fn harness(max_failures: u32) -> Harness {
        let sink = Arc::new(InMemoryAlertSink::default());
        let notifier = RecordingNotifier::new();
        let mut dispatcher = Dispatcher::empty();
        dispatcher.add(
            "rec",
            Box::new(notifier.clone()),
            RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
            16,
        );
        let context = Arc::new(RunnerContext {
            pool: BackendPool::new(BackendRegistry::with_defaults(RuntimeLoader::default())),
            dispatcher: Arc::new(dispatcher),
            sink: sink.clone(),
            snapshots: None,
            overlay: Arc::new(OverlayHub::default()),
            settings: RunnerSettings {
                frame_wait: Duration::from_millis(200),
                max_consecutive_failures: max_failures,
            },
        });
        Harness {
            context,
            sink,
            notifier,
        }
    }

    fn backend(model: &str) -> BackendDescriptor {
        let mut d = BackendDescriptor::new("m", HardwareKind::Cpu, model);
        d.input_width = 32;
        d.input_height = 32;
        d.labels = vec!["person".into(), "car".into()];
        d
    }

    fn task(uri: &str) -> TaskConfig {
        let mut source = VideoSourceDescriptor::new(uri);
        source.fps = 50;
        source.reconnect.delay = Duration::from_millis(20);
        let mut t = TaskConfig::new("t1", "m", source);
        t.inference_interval = Duration::from_millis(20);
        t.confidence_threshold = 0.5;
        t
    }

    fn wait_for(runner: &TaskRunner, f: impl Fn(&TaskSnapshot) -> bool) -> TaskSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = runner.snapshot();
            if f(&snapshot) || Instant::now() >= deadline {
                return snapshot;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    const PERSON_MODEL: &str = "stub://m?boxes=0:0.9:2:2:12:12";

    #[test]
    fn sample_period_takes_stricter_limit() {
        let mut t = task("stub://cam");
        t.inference_interval = Duration::from_millis(10);
        t.source.fps = 10;
        assert_eq!(t.sample_period(), Duration::from_millis(100));
        t.inference_interval = Duration::from_secs(2);
        assert_eq!(t.sample_period(), Duration::from_secs(2));
    }

    #[test]
    fn detections_raise_one_debounced_alert() {
        let h = harness(5);
        let mut runner = TaskRunner::start(
            task("stub://cam"),
            backend(PERSON_MODEL),
            h.context.clone(),
        )
        .unwrap();
        let snapshot = wait_for(&runner, |s| s.frames_processed >= 5);
        assert_eq!(snapshot.status, TaskStatus::Running);
        runner.stop();

        let snapshot = runner.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Stopped);
        assert_eq!(snapshot.alerts_emitted, 1);
        assert!(snapshot.alerts_suppressed >= 4);
        assert_eq!(h.sink.count().unwrap(), 1);
        let recent = h.sink.recent(1).unwrap();
        assert_eq!(recent[0].class, "person");
        assert_eq!(recent[0].title, "person detected - t1");

        h.context.dispatcher.shutdown();
        assert_eq!(h.notifier.sent().len(), 1);
        assert_eq!(h.context.pool.loaded(), 0);
    }

    #[test]
    fn tasks_sharing_a_gpu_wait_instead_of_failing() {
        let h = harness(3);
        let mut gpu = backend("stub://m?delay_ms=100&boxes=0:0.9:2:2:12:12");
        gpu.hardware = HardwareKind::Gpu;
        let mut runners: Vec<TaskRunner> = (0..4)
            .map(|i| {
                let mut t = task(&format!("stub://cam{}", i));
                t.id = format!("t{}", i);
                TaskRunner::start(t, gpu.clone(), h.context.clone()).unwrap()
            })
            .collect();
        for runner in &runners {
            let snapshot = wait_for(runner, |s| s.frames_processed >= 2);
            assert_eq!(snapshot.status, TaskStatus::Running, "{}", snapshot.task_id);
        }
        std::thread::sleep(Duration::from_millis(500));
        for runner in &runners {
            let snapshot = runner.snapshot();
            assert_eq!(snapshot.status, TaskStatus::Running, "{}", snapshot.task_id);
            assert_eq!(snapshot.consecutive_failures, 0);
        }
        assert_eq!(h.context.pool.loaded(), 1);
        for runner in &mut runners {
            runner.stop();
        }
        assert_eq!(h.context.pool.loaded(), 0);
    }

    #[test]
    fn low_confidence_raises_nothing() {
        let h = harness(5);
        let mut runner = TaskRunner::start(
            task("stub://cam"),
            backend("stub://m?boxes=0:0.3:2:2:12:12"),
            h.context.clone(),
        )
        .unwrap();
        wait_for(&runner, |s| s.frames_processed >= 3);
        runner.stop();
        assert_eq!(runner.snapshot().alerts_emitted, 0);
        assert_eq!(h.sink.count().unwrap(), 0);
    }

    #[test]
    fn exhausted_stream_puts_task_in_error() {
        let h = harness(5);
        let mut t = task("stub://cam?unreachable=true");
        t.source.reconnect.max_attempts = 2;
        let runner = TaskRunner::start(t, backend(PERSON_MODEL), h.context.clone()).unwrap();
        let snapshot = wait_for(&runner, |s| s.status == TaskStatus::Error);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert!(snapshot.reconnect_attempts <= 2);
        assert!(snapshot.last_error.unwrap().contains("video source"));
    }

    #[test]
    fn missing_model_puts_task_in_error() {
        let h = harness(5);
        let runner = TaskRunner::start(
            task("stub://cam"),
            backend("/nonexistent/model.onnx"),
            h.context.clone(),
        )
        .unwrap();
        let snapshot = wait_for(&runner, |s| s.status == TaskStatus::Error);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert!(snapshot.last_error.unwrap().contains("backend m"));
    }

    #[test]
    fn repeated_inference_failures_escalate() {
        let h = harness(3);
        let runner = TaskRunner::start(
            task("stub://cam"),
            backend("stub://m?fail=true"),
            h.context.clone(),
        )
        .unwrap();
        let snapshot = wait_for(&runner, |s| s.status == TaskStatus::Error);
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.consecutive_failures, 3);
    }

    #[test]
    fn transient_inference_failure_is_skipped() {
        let h = harness(3);
        let mut runner = TaskRunner::start(
            task("stub://cam"),
            backend("stub://m?fail_first=2&boxes=0:0.9:2:2:12:12"),
            h.context.clone(),
        )
        .unwrap();
        let snapshot = wait_for(&runner, |s| s.frames_processed >= 2);
        assert_eq!(snapshot.status, TaskStatus::Running);
        assert_eq!(snapshot.consecutive_failures, 0);
        runner.stop();
    }

    #[test]
    fn pause_keeps_backend_and_stops_sampling() {
        let h = harness(5);
        let descriptor = backend(PERSON_MODEL);
        let mut runner =
            TaskRunner::start(task("stub://cam"), descriptor.clone(), h.context.clone()).unwrap();
        wait_for(&runner, |s| s.frames_processed >= 2);
        runner.pause().unwrap();
        assert_eq!(runner.status(), TaskStatus::Paused);
        std::thread::sleep(Duration::from_millis(100));
        let paused_at = runner.snapshot().frames_processed;
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(runner.snapshot().frames_processed, paused_at);
        assert_eq!(h.context.pool.leases(&descriptor), 1);

        runner.resume().unwrap();
        let snapshot = wait_for(&runner, |s| s.frames_processed > paused_at);
        assert!(snapshot.frames_processed > paused_at);
        runner.stop();
        assert!(runner.pause().is_err());
    }

    #[test]
    fn overlay_subscribers_receive_detections() {
        let h = harness(5);
        let subscription = h.context.overlay.subscribe("t1");
        let mut runner = TaskRunner::start(
            task("stub://cam"),
            backend(PERSON_MODEL),
            h.context.clone(),
        )
        .unwrap();
        let update = subscription
            .recv(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(update.detections.len(), 1);
        assert_eq!(update.detections[0].label, "person");
        runner.stop();
    }
}
