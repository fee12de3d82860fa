use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tempfile::tempdir;

use edgewatch::alert::{AlertSink, SnapshotStore, SqliteAlertSink};
use edgewatch::detect::{
    BackendDescriptor, BackendPool, BackendRegistry, HardwareKind, RuntimeLoader,
};
use edgewatch::ingest::VideoSourceDescriptor;
use edgewatch::notify::{Dispatcher, RecordingNotifier, RetryPolicy};
use edgewatch::runner::{RunnerContext, RunnerSettings, TaskConfig, TaskStatus};
use edgewatch::schedule::{Schedule, ScheduleType};
use edgewatch::{OverlayHub, TaskManager};

const PERSON_MODEL: &str = "stub://detector?boxes=0:0.92:2:2:12:12";

struct Rig {
    manager: TaskManager,
    sink: Arc<SqliteAlertSink>,
    dispatcher: Arc<Dispatcher>,
    healthy: RecordingNotifier,
    broken: RecordingNotifier,
}

fn backend() -> BackendDescriptor {
    let mut d = BackendDescriptor::new("detector", HardwareKind::Cpu, PERSON_MODEL);
    d.input_width = 32;
    d.input_height = 32;
    d.labels = vec!["person".into()];
    d
}

fn task(id: &str, debounce: Duration) -> TaskConfig {
    let mut source = VideoSourceDescriptor::new(format!("stub://{}", id));
    source.name = format!("{} camera", id);
    source.fps = 50;
    let mut t = TaskConfig::new(id, "detector", source);
    t.name = format!("watch {}", id);
    t.inference_interval = Duration::from_millis(20);
    t.confidence_threshold = 0.5;
    t.debounce_interval = debounce;
    t
}

fn rig(db: &str, snapshots: Option<Arc<SnapshotStore>>, tasks: Vec<TaskConfig>) -> Rig {
    let sink = Arc::new(SqliteAlertSink::open(db).expect("open alert db"));
    let healthy = RecordingNotifier::new();
    let broken = RecordingNotifier::failing();
    let retry = RetryPolicy {
        attempts: 2,
        delay: Duration::from_millis(5),
    };
    let mut dispatcher = Dispatcher::empty();
    dispatcher.add("broken", Box::new(broken.clone()), retry, 64);
    dispatcher.add("healthy", Box::new(healthy.clone()), retry, 64);
    let dispatcher = Arc::new(dispatcher);

    let context = Arc::new(RunnerContext {
        pool: BackendPool::new(BackendRegistry::with_defaults(RuntimeLoader::default())),
        dispatcher: Arc::clone(&dispatcher),
        sink: sink.clone(),
        snapshots,
        overlay: Arc::new(OverlayHub::default()),
        settings: RunnerSettings {
            frame_wait: Duration::from_millis(200),
            max_consecutive_failures: 5,
        },
    });
    let manager = TaskManager::new(context, vec![backend()], tasks).expect("manager");
    Rig {
        manager,
        sink,
        dispatcher,
        healthy,
        broken,
    }
}

fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}

fn noon() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
}

#[test]
fn debounced_alert_reaches_store_and_healthy_channel() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("alerts.db");
    let rig = rig(
        db.to_str().unwrap(),
        None,
        vec![task("lobby", Duration::from_secs(60))],
    );

    let report = rig.manager.reconcile(noon());
    assert_eq!(report.started, vec!["lobby".to_string()]);

    assert!(wait_until(|| rig
        .manager
        .status("lobby")
        .map(|s| s.frames_processed >= 10)
        .unwrap_or(false)));
    assert!(wait_until(|| rig.healthy.sent().len() == 1));

    let status = rig.manager.status("lobby").unwrap();
    assert_eq!(status.status, TaskStatus::Running);
    assert_eq!(status.alerts_emitted, 1);
    assert!(status.alerts_suppressed > 0);

    let alerts = rig.sink.recent(10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].class, "person");
    assert_eq!(alerts[0].task_name, "watch lobby");
    assert!(alerts[0].message.contains("lobby camera"));

    let sent = rig.healthy.sent();
    assert_eq!(sent[0].alert_id, alerts[0].id);
    assert_eq!(sent[0].class_name, "person");

    rig.manager.stop_all();
    rig.dispatcher.shutdown();
    assert_eq!(rig.healthy.sent().len(), 1);
    assert_eq!(rig.broken.attempts(), 2);

    let stats = rig.dispatcher.stats();
    let broken = stats.iter().find(|s| s.name == "broken").unwrap();
    assert_eq!((broken.delivered, broken.failed, broken.retries), (0, 1, 1));
    let healthy = stats.iter().find(|s| s.name == "healthy").unwrap();
    assert_eq!((healthy.delivered, healthy.failed), (1, 0));

    // Persisted alerts survive a reopen.
    let reopened = SqliteAlertSink::open(db.to_str().unwrap()).unwrap();
    assert_eq!(reopened.count().unwrap(), 1);
}

#[test]
fn snapshots_are_capped_on_disk() {
    let dir = tempdir().unwrap();
    let images = dir.path().join("images");
    let store = Arc::new(
        SnapshotStore::open(&images, 3, 80, Some("http://edge.local/img".into())).unwrap(),
    );
    let mut t = task("yard", Duration::ZERO);
    t.save_images = true;
    let rig = rig(
        dir.path().join("alerts.db").to_str().unwrap(),
        Some(store.clone()),
        vec![t],
    );

    rig.manager.start("yard").unwrap();
    assert!(wait_until(|| rig.sink.count().unwrap_or(0) >= 6));
    rig.manager.stop("yard").unwrap();

    let on_disk = std::fs::read_dir(&images)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "jpg"))
        .count();
    assert_eq!(on_disk, 3);
    assert_eq!(store.len(), 3);

    let latest = &rig.sink.recent(1).unwrap()[0];
    let image_ref = latest.image_ref.as_deref().unwrap();
    assert!(image_ref.starts_with("http://edge.local/img/person_"));
    assert!(image_ref.ends_with(".jpg"));
}

#[test]
fn schedule_window_drives_lifecycle() {
    let dir = tempdir().unwrap();
    let mut t = task("dock", Duration::from_secs(60));
    t.schedule = Schedule::new(ScheduleType::Daily, Some("09:00"), Some("17:00"), &[]).unwrap();
    let rig = rig(dir.path().join("alerts.db").to_str().unwrap(), None, vec![t]);

    let night = NaiveDate::from_ymd_opt(2024, 6, 3)
        .and_then(|d| d.and_hms_opt(23, 0, 0))
        .unwrap();
    assert!(rig.manager.reconcile(night).is_noop());
    assert_eq!(rig.manager.status("dock").unwrap().status, TaskStatus::Stopped);

    assert_eq!(rig.manager.reconcile(noon()).started, vec!["dock".to_string()]);
    assert!(rig.manager.reconcile(noon()).is_noop());
    assert!(wait_until(|| rig
        .manager
        .status("dock")
        .map(|s| s.status == TaskStatus::Running)
        .unwrap_or(false)));

    assert_eq!(rig.manager.reconcile(night).stopped, vec!["dock".to_string()]);
    let status = rig.manager.status("dock").unwrap();
    assert_eq!(status.status, TaskStatus::Stopped);
    assert_eq!(rig.manager.context().pool.loaded(), 0);
}
