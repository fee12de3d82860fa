//! Task lifecycle and schedule reconciliation.
//!
//! `TaskManager` owns every task's configuration and runner behind a single
//! lock; manual lifecycle calls and the scheduler's reconciliation both go
//! through it, so a task can never end up with two runners. Runners are
//! signalled under the lock and joined after it is released; while a join
//! is pending the task is marked stopping and nothing may start it.
//!
//! Reconciliation rules, per task:
//! - enabled, inside its window, no runner, no operator hold: start
//! - outside its window (or disabled) with a runner: stop
//! - leaving the window also clears an operator hold and a task in `Error`
//! - anything else is left alone, so repeated passes are no-ops

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};

use crate::detect::BackendDescriptor;
use crate::error::EngineError;
use crate::runner::{RunnerContext, TaskConfig, TaskRunner, TaskSnapshot, TaskStatus};

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

struct TaskEntry {
    config: TaskConfig,
    runner: Option<TaskRunner>,
    /// Set by a manual stop; the scheduler will not restart the task until
    /// its window closes or an operator starts it again.
    hold: bool,
    /// A detached runner is being joined outside the lock.
    stopping: bool,
    last: Option<TaskSnapshot>,
}

impl TaskEntry {
    fn new(config: TaskConfig) -> Self {
        Self {
            config,
            runner: None,
            hold: false,
            stopping: false,
            last: None,
        }
    }

    fn is_live(&self) -> bool {
        self.runner
            .as_ref()
            .is_some_and(|r| !r.status().is_finished())
    }

    /// Signal the runner and hand it back for joining once the lock is gone.
    fn detach(&mut self) -> Option<TaskRunner> {
        let runner = self.runner.take()?;
        runner.request_stop();
        self.last = Some(runner.snapshot());
        self.stopping = true;
        Some(runner)
    }
}

struct ManagerState {
    tasks: BTreeMap<String, TaskEntry>,
    backends: HashMap<String, BackendDescriptor>,
}

/// Result of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

pub struct TaskManager {
    state: Mutex<ManagerState>,
    context: Arc<RunnerContext>,
}

impl TaskManager {
    pub fn new(
        context: Arc<RunnerContext>,
        backends: Vec<BackendDescriptor>,
        tasks: Vec<TaskConfig>,
    ) -> Result<Self, EngineError> {
        let backends: HashMap<String, BackendDescriptor> =
            backends.into_iter().map(|b| (b.id.clone(), b)).collect();
        let mut entries = BTreeMap::new();
        for task in tasks {
            if !backends.contains_key(&task.backend_id) {
                return Err(EngineError::UnknownBackend {
                    task: task.id,
                    backend: task.backend_id,
                });
            }
            if entries.contains_key(&task.id) {
                return Err(EngineError::Config(format!("duplicate task id '{}'", task.id)));
            }
            entries.insert(task.id.clone(), TaskEntry::new(task));
        }
        Ok(Self {
            state: Mutex::new(ManagerState {
                tasks: entries,
                backends,
            }),
            context,
        })
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        &self.context
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.lock().tasks.keys().cloned().collect()
    }

    pub fn start(&self, task_id: &str) -> Result<(), EngineError> {
        self.relaunch(task_id, false)
    }

    /// Stop the task and hold it stopped until started again or its window
    /// closes.
    pub fn stop(&self, task_id: &str) -> Result<(), EngineError> {
        let detached = {
            let mut state = self.lock();
            let entry = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
            entry.hold = true;
            entry.detach()
        };
        if let Some(runner) = detached {
            self.join(task_id, runner);
        }
        Ok(())
    }

    pub fn pause(&self, task_id: &str) -> Result<(), EngineError> {
        self.with_runner(task_id, |runner| runner.pause())
    }

    pub fn resume(&self, task_id: &str) -> Result<(), EngineError> {
        self.with_runner(task_id, |runner| runner.resume())
    }

    pub fn restart(&self, task_id: &str) -> Result<(), EngineError> {
        self.relaunch(task_id, true)
    }

    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot, EngineError> {
        let state = self.lock();
        let entry = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        Ok(snapshot_of(task_id, entry))
    }

    pub fn statuses(&self) -> Vec<TaskSnapshot> {
        let state = self.lock();
        state
            .tasks
            .iter()
            .map(|(id, entry)| snapshot_of(id, entry))
            .collect()
    }

    /// Add or replace a task. A running task whose configuration changed is
    /// restarted with the new one; a disabled one is stopped.
    pub fn upsert_task(&self, config: TaskConfig) -> Result<(), EngineError> {
        let task_id = config.id.clone();
        let (detached, relaunch) = {
            let mut state = self.lock();
            let ManagerState { tasks, backends } = &mut *state;
            if !backends.contains_key(&config.backend_id) {
                return Err(EngineError::UnknownBackend {
                    task: config.id,
                    backend: config.backend_id,
                });
            }
            match tasks.get_mut(&config.id) {
                None => {
                    log::info!("task {}: added", config.id);
                    tasks.insert(config.id.clone(), TaskEntry::new(config));
                    return Ok(());
                }
                Some(entry) if entry.config == config => return Ok(()),
                Some(entry) => {
                    log::info!("task {}: configuration updated", config.id);
                    let was_running = entry.is_live();
                    let detached = entry.detach();
                    entry.config = config;
                    (detached, was_running && entry.config.enabled)
                }
            }
        };
        if let Some(runner) = detached {
            self.join(&task_id, runner);
        }
        if relaunch {
            self.start_idle(&task_id)?;
        }
        Ok(())
    }

    pub fn remove_task(&self, task_id: &str) -> Result<TaskConfig, EngineError> {
        let mut entry = self
            .lock()
            .tasks
            .remove(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        if let Some(mut runner) = entry.detach() {
            runner.stop();
        }
        log::info!("task {}: removed", task_id);
        Ok(entry.config)
    }

    /// Add or replace a backend descriptor; running tasks on it restart.
    pub fn upsert_backend(&self, descriptor: BackendDescriptor) -> Result<(), EngineError> {
        let detached: Vec<(String, TaskRunner)> = {
            let mut state = self.lock();
            let ManagerState { tasks, backends } = &mut *state;
            let changed = backends.get(&descriptor.id) != Some(&descriptor);
            backends.insert(descriptor.id.clone(), descriptor.clone());
            if !changed {
                return Ok(());
            }
            tasks
                .iter_mut()
                .filter(|(_, entry)| entry.config.backend_id == descriptor.id && entry.is_live())
                .filter_map(|(id, entry)| entry.detach().map(|r| (id.clone(), r)))
                .collect()
        };
        let mut result = Ok(());
        for (id, runner) in detached {
            self.join(&id, runner);
            if let Err(e) = self.start_idle(&id) {
                log::error!("task {}: {}", id, e);
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Align runners with each task's window at local time `now`.
    pub fn reconcile(&self, now: NaiveDateTime) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut detached = Vec::new();
        {
            let mut state = self.lock();
            let ManagerState { tasks, backends } = &mut *state;
            for (id, entry) in tasks.iter_mut() {
                if entry.stopping {
                    continue;
                }
                let active = entry.config.enabled && entry.config.schedule.is_active(now);
                if !active {
                    entry.hold = false;
                    if let Some(runner) = entry.detach() {
                        log::info!("task {}: outside schedule window, stopping", id);
                        detached.push((id.clone(), runner));
                        report.stopped.push(id.clone());
                    }
                    continue;
                }
                if entry.runner.is_some() || entry.hold {
                    continue;
                }
                log::info!("task {}: inside schedule window, starting", id);
                match start_entry(entry, backends, &self.context) {
                    Ok(()) => report.started.push(id.clone()),
                    Err(e) => log::error!("task {}: {}", id, e),
                }
            }
        }
        // Every runner was already signalled, so their teardowns overlap.
        for (id, runner) in detached {
            self.join(&id, runner);
        }
        report
    }

    /// Stop every runner; used at shutdown.
    pub fn stop_all(&self) {
        let detached: Vec<(String, TaskRunner)> = self
            .lock()
            .tasks
            .iter_mut()
            .filter_map(|(id, entry)| entry.detach().map(|r| (id.clone(), r)))
            .collect();
        for (id, runner) in detached {
            self.join(&id, runner);
        }
    }

    /// Start a task, replacing a finished runner, or any runner when
    /// `replace` is set.
    fn relaunch(&self, task_id: &str, replace: bool) -> Result<(), EngineError> {
        let detached = {
            let mut state = self.lock();
            let entry = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
            if !entry.config.enabled {
                return Err(EngineError::Disabled(task_id.to_string()));
            }
            if entry.stopping {
                return Err(EngineError::Stopping(task_id.to_string()));
            }
            entry.hold = false;
            if !replace && entry.is_live() {
                return Ok(());
            }
            entry.detach()
        };
        if let Some(runner) = detached {
            self.join(task_id, runner);
        }
        self.start_idle(task_id)
    }

    /// Start the task unless something else already did, or is tearing it
    /// down, since the lock was last held.
    fn start_idle(&self, task_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let ManagerState { tasks, backends } = &mut *state;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        if entry.runner.is_some() || entry.stopping || !entry.config.enabled {
            return Ok(());
        }
        start_entry(entry, backends, &self.context)
    }

    /// Wait for a detached runner with the lock released, then record its
    /// final snapshot and clear the stopping mark.
    fn join(&self, task_id: &str, mut runner: TaskRunner) {
        runner.stop();
        if let Some(entry) = self.lock().tasks.get_mut(task_id) {
            entry.last = Some(runner.snapshot());
            entry.stopping = false;
        }
    }

    fn with_runner(
        &self,
        task_id: &str,
        f: impl FnOnce(&TaskRunner) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let state = self.lock();
        let entry = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        match &entry.runner {
            Some(runner) => f(runner),
            None => Err(EngineError::NotRunning(task_id.to_string())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn start_entry(
    entry: &mut TaskEntry,
    backends: &HashMap<String, BackendDescriptor>,
    context: &Arc<RunnerContext>,
) -> Result<(), EngineError> {
    let backend = backends
        .get(&entry.config.backend_id)
        .cloned()
        .ok_or_else(|| EngineError::UnknownBackend {
            task: entry.config.id.clone(),
            backend: entry.config.backend_id.clone(),
        })?;
    let runner = TaskRunner::start(entry.config.clone(), backend, Arc::clone(context))?;
    entry.runner = Some(runner);
    Ok(())
}

fn snapshot_of(task_id: &str, entry: &TaskEntry) -> TaskSnapshot {
    match (&entry.runner, &entry.last) {
        (Some(runner), _) => runner.snapshot(),
        (None, Some(last)) => TaskSnapshot {
            status: if entry.stopping {
                TaskStatus::Stopping
            } else {
                TaskStatus::Stopped
            },
            ..last.clone()
        },
        (None, None) => TaskSnapshot::new(task_id, TaskStatus::Stopped),
    }
}

/// Periodic reconciliation on its own thread.
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(manager: Arc<TaskManager>, tick: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let tick = tick.max(Duration::from_millis(10));
        let handle = std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                log::info!("scheduler: reconciling every {:?}", tick);
                while !flag.load(Ordering::SeqCst) {
                    let report = manager.reconcile(Local::now().naive_local());
                    if !report.is_noop() {
                        log::info!(
                            "scheduler: started {:?}, stopped {:?}",
                            report.started,
                            report.stopped
                        );
                    }
                    sleep_unless(&flag, tick);
                }
                log::info!("scheduler: stopped");
            })
            .context("spawn scheduler thread")?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("scheduler: thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_unless(flag: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !flag.load(Ordering::SeqCst) {
        let nap = step.min(total - slept);
        std::thread::sleep(nap);
        slept += nap;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::InMemoryAlertSink;
    use crate::broadcast::OverlayHub;
    use crate::detect::{BackendPool, BackendRegistry, HardwareKind, RuntimeLoader};
    use crate::ingest::VideoSourceDescriptor;
    use crate::notify::Dispatcher;
    use crate::runner::RunnerSettings;
    use crate::schedule::{Schedule, ScheduleType};
    use chrono::NaiveDate;
    use std::time::Instant;

    fn context() -> Arc<RunnerContext> {
        Arc::new(RunnerContext {
            pool: BackendPool::new(BackendRegistry::with_defaults(RuntimeLoader::default())),
            dispatcher: Arc::new(Dispatcher::empty()),
            sink: Arc::new(InMemoryAlertSink::default()),
            snapshots: None,
            overlay: Arc::new(OverlayHub::default()),
            settings: RunnerSettings {
                frame_wait: Duration::from_millis(100),
                max_consecutive_failures: 3,
            },
        })
    }

    fn backend() -> BackendDescriptor {
        let mut d = BackendDescriptor::new("m", HardwareKind::Cpu, "stub://m");
        d.input_width = 16;
        d.input_height = 16;
        d
    }

    fn task(id: &str, schedule: Schedule) -> TaskConfig {
        let mut t = TaskConfig::new(id, "m", VideoSourceDescriptor::new("stub://cam"));
        t.inference_interval = Duration::from_millis(20);
        t.schedule = schedule;
        t
    }

    fn night() -> Schedule {
        Schedule::new(ScheduleType::Daily, Some("22:00"), Some("06:00"), &[]).unwrap()
    }

    fn at(hh: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hh, 0, 0)
            .unwrap()
    }

    fn wait_status(manager: &TaskManager, id: &str, status: TaskStatus) -> TaskStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let current = manager.status(id).unwrap().status;
            if current == status || Instant::now() >= deadline {
                return current;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn reconcile_follows_window_and_is_idempotent() {
        let manager =
            TaskManager::new(context(), vec![backend()], vec![task("n", night())]).unwrap();

        let report = manager.reconcile(at(23));
        assert_eq!(report.started, vec!["n".to_string()]);
        assert_eq!(wait_status(&manager, "n", TaskStatus::Running), TaskStatus::Running);
        assert!(manager.reconcile(at(23)).is_noop());

        let report = manager.reconcile(at(12));
        assert_eq!(report.stopped, vec!["n".to_string()]);
        assert_eq!(manager.status("n").unwrap().status, TaskStatus::Stopped);
        assert!(manager.reconcile(at(12)).is_noop());
    }

    #[test]
    fn disabled_task_is_never_started() {
        let mut t = task("d", Schedule::continuous());
        t.enabled = false;
        let manager = TaskManager::new(context(), vec![backend()], vec![t]).unwrap();
        assert!(manager.reconcile(at(10)).is_noop());
        assert!(matches!(manager.start("d"), Err(EngineError::Disabled(_))));
    }

    #[test]
    fn manual_stop_holds_until_window_closes() {
        let manager =
            TaskManager::new(context(), vec![backend()], vec![task("n", night())]).unwrap();
        manager.reconcile(at(23));
        manager.stop("n").unwrap();
        assert!(manager.reconcile(at(23)).is_noop());
        assert_eq!(manager.status("n").unwrap().status, TaskStatus::Stopped);

        manager.reconcile(at(12));
        assert_eq!(manager.reconcile(at(23)).started, vec!["n".to_string()]);
    }

    #[test]
    fn lifecycle_operations() {
        let manager =
            TaskManager::new(context(), vec![backend()], vec![task("c", Schedule::continuous())])
                .unwrap();
        assert!(matches!(manager.pause("c"), Err(EngineError::NotRunning(_))));
        manager.start("c").unwrap();
        manager.start("c").unwrap();
        assert_eq!(wait_status(&manager, "c", TaskStatus::Running), TaskStatus::Running);
        manager.pause("c").unwrap();
        assert_eq!(manager.status("c").unwrap().status, TaskStatus::Paused);
        manager.resume("c").unwrap();
        assert_eq!(manager.status("c").unwrap().status, TaskStatus::Running);
        manager.restart("c").unwrap();
        assert_eq!(wait_status(&manager, "c", TaskStatus::Running), TaskStatus::Running);
        manager.stop("c").unwrap();
        assert_eq!(manager.status("c").unwrap().status, TaskStatus::Stopped);
        assert!(matches!(manager.start("missing"), Err(EngineError::UnknownTask(_))));
    }

    #[test]
    fn errored_task_waits_for_window_or_restart() {
        let mut t = task("e", Schedule::continuous());
        t.source = VideoSourceDescriptor::new("stub://cam?unreachable=true");
        t.source.reconnect.max_attempts = 1;
        t.source.reconnect.delay = Duration::from_millis(10);
        let manager = TaskManager::new(context(), vec![backend()], vec![t]).unwrap();
        manager.reconcile(at(10));
        assert_eq!(wait_status(&manager, "e", TaskStatus::Error), TaskStatus::Error);
        assert!(manager.reconcile(at(11)).is_noop());
        assert_eq!(manager.status("e").unwrap().status, TaskStatus::Error);
    }

    #[test]
    fn slow_teardown_does_not_block_other_tasks() {
        let mut slow = task("slow", Schedule::continuous());
        slow.source = VideoSourceDescriptor::new("stub://cam?connect_delay_ms=2000");
        let other = task("other", Schedule::continuous());
        let manager = TaskManager::new(context(), vec![backend()], vec![slow, other]).unwrap();
        manager.start("other").unwrap();
        manager.start("slow").unwrap();
        assert_eq!(wait_status(&manager, "other", TaskStatus::Running), TaskStatus::Running);
        std::thread::sleep(Duration::from_millis(100));

        std::thread::scope(|scope| {
            let stopper = scope.spawn(|| manager.stop("slow"));
            std::thread::sleep(Duration::from_millis(100));

            let begun = Instant::now();
            assert_eq!(manager.status("other").unwrap().status, TaskStatus::Running);
            assert_eq!(manager.status("slow").unwrap().status, TaskStatus::Stopping);
            assert!(matches!(manager.start("slow"), Err(EngineError::Stopping(_))));
            manager.pause("other").unwrap();
            manager.resume("other").unwrap();
            assert!(begun.elapsed() < Duration::from_millis(500));

            stopper.join().unwrap().unwrap();
        });
        assert_eq!(manager.status("slow").unwrap().status, TaskStatus::Stopped);
        assert_eq!(manager.status("other").unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn upsert_and_remove() {
        let manager =
            TaskManager::new(context(), vec![backend()], vec![task("c", Schedule::continuous())])
                .unwrap();
        manager.start("c").unwrap();

        let mut changed = task("c", Schedule::continuous());
        changed.debounce_interval = Duration::from_secs(5);
        manager.upsert_task(changed.clone()).unwrap();
        assert_eq!(wait_status(&manager, "c", TaskStatus::Running), TaskStatus::Running);

        let mut orphan = task("x", Schedule::continuous());
        orphan.backend_id = "nope".into();
        assert!(matches!(
            manager.upsert_task(orphan),
            Err(EngineError::UnknownBackend { .. })
        ));

        assert_eq!(manager.remove_task("c").unwrap(), changed);
        assert!(manager.task_ids().is_empty());
        assert_eq!(manager.context().pool.loaded(), 0);
    }

    #[test]
    fn unknown_backend_is_rejected_at_construction() {
        let mut t = task("c", Schedule::continuous());
        t.backend_id = "other".into();
        assert!(matches!(
            TaskManager::new(context(), vec![backend()], vec![t]),
            Err(EngineError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn scheduler_thread_starts_continuous_tasks() {
        let manager = Arc::new(
            TaskManager::new(context(), vec![backend()], vec![task("c", Schedule::continuous())])
                .unwrap(),
        );
        let mut scheduler =
            Scheduler::spawn(Arc::clone(&manager), Duration::from_millis(20)).unwrap();
        assert_eq!(wait_status(&manager, "c", TaskStatus::Running), TaskStatus::Running);
        scheduler.stop();
        manager.stop_all();
        assert_eq!(manager.status("c").unwrap().status, TaskStatus::Stopped);
    }
}
