use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use edgewatch::config::EngineConfig;
use edgewatch::detect::HardwareKind;
use edgewatch::notify::ChannelKind;
use edgewatch::postprocess::Region;
use edgewatch::schedule::ScheduleType;
use edgewatch::TransportKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EDGEWATCH_CONFIG",
        "EDGEWATCH_TICK_SECS",
        "EDGEWATCH_ALERT_DB",
        "EDGEWATCH_IMAGE_DIR",
        "EDGEWATCH_MAX_SAVED_IMAGES",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "scheduler": {"tick_seconds": 2},
            "runner": {"frame_wait_ms": 250, "max_consecutive_failures": 3},
            "alerts": {"save_images": true, "image_dir": "/tmp/shots", "db_path": "alerts.db"},
            "backends": [{
                "id": "yolo",
                "platform": "nvidia_gpu",
                "model_path": "yolov5s.onnx",
                "input_size": [640, 384],
                "labels": ["person", "car"],
                "nms_threshold": 0.5,
                "concurrency_limit": 4
            }],
            "tasks": [{
                "id": "gate",
                "name": "Front gate",
                "backend": "yolo",
                "video": {
                    "name": "gate cam",
                    "uri": "rtsp://cam.local/stream1",
                    "username": "admin",
                    "password": "hunter2",
                    "fps": 15,
                    "max_reconnect_attempts": 3
                },
                "regions": [{"type": "rect", "x": 0.1, "y": 0.1, "w": 0.5, "h": 0.5}],
                "class_thresholds": {"car": 0.6},
                "schedule_type": "daily",
                "start_time": "22:00",
                "end_time": "06:00",
                "alert_debounce_interval": 5,
                "inference_interval": 0.5
            }],
            "channels": [{
                "name": "ops",
                "type": "mqtt",
                "broker": "mqtt://broker.local",
                "topic": "alerts/vision",
                "retry_attempts": 5
            }]
        }"#,
    );

    std::env::set_var("EDGEWATCH_CONFIG", file.path());
    std::env::set_var("EDGEWATCH_ALERT_DB", "/var/lib/edgewatch/alerts.db");
    std::env::set_var("EDGEWATCH_MAX_SAVED_IMAGES", "50");

    let cfg = EngineConfig::load().expect("load config");

    assert_eq!(cfg.tick, Duration::from_secs(2));
    assert_eq!(cfg.runner.frame_wait, Duration::from_millis(250));
    assert_eq!(cfg.runner.max_consecutive_failures, 3);
    assert!(cfg.alerts.save_images);
    assert_eq!(cfg.alerts.db_path, "/var/lib/edgewatch/alerts.db");
    assert_eq!(cfg.alerts.max_saved_images, 50);

    let backend = &cfg.backends[0];
    assert_eq!(backend.hardware, HardwareKind::Gpu);
    assert_eq!((backend.input_width, backend.input_height), (640, 384));
    assert_eq!(backend.concurrency_limit, 4);

    let task = &cfg.tasks[0];
    assert_eq!(task.name, "Front gate");
    assert_eq!(task.source.name, "gate cam");
    assert_eq!(task.source.transport, TransportKind::Rtsp);
    assert_eq!(task.source.fps, 15);
    assert_eq!(task.source.reconnect.max_attempts, 3);
    assert_eq!(
        task.source.credentials.as_ref().map(|c| c.username.as_str()),
        Some("admin")
    );
    assert_eq!(task.schedule.kind(), ScheduleType::Daily);
    assert_eq!(task.debounce_interval, Duration::from_secs(5));
    assert_eq!(task.inference_interval, Duration::from_millis(500));
    assert_eq!(task.class_thresholds.get("car"), Some(&0.6));
    assert!(matches!(task.regions[0], Region::Rect { .. }));
    assert!(task.save_images, "tasks inherit the global snapshot setting");

    let channel = &cfg.channels[0];
    assert_eq!(channel.kind, ChannelKind::Mqtt);
    assert_eq!(channel.endpoint, "mqtt://broker.local");
    assert_eq!(channel.retry.attempts, 5);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
models_dir = "/opt/models"

[[backends]]
id = "edge"
hardware = "npu"
model_path = "yolo.om"
input_size = 416

[[tasks]]
id = "dock"
backend = "edge"
schedule_type = "weekly"
schedule_days = ["mon", "wed", 5]
start_time = "08:00"
end_time = "17:30"

[tasks.video]
uri = "/dev/video0"

[[channels]]
name = "hook"
kind = "http"
url = "https://hooks.example.com/alert"
method = "get"
enabled = false
"#,
    );

    let cfg = EngineConfig::load_from(Some(file.path())).expect("load toml config");
    assert_eq!(
        cfg.models_dir.as_deref(),
        Some(std::path::Path::new("/opt/models"))
    );
    assert_eq!(cfg.backends[0].hardware, HardwareKind::Npu);
    assert_eq!(cfg.backends[0].input_width, 416);
    assert_eq!(cfg.tasks[0].source.transport, TransportKind::Usb);
    assert_eq!(cfg.tasks[0].schedule.kind(), ScheduleType::Weekly);
    assert!(!cfg.channels[0].enabled);

    clear_env();
}

#[test]
fn missing_config_file_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EngineConfig::load().expect("defaults");
    assert!(cfg.tasks.is_empty());
    assert_eq!(cfg.tick, Duration::from_secs(5));
    assert_eq!(cfg.alerts.max_saved_images, 1000);
    assert_eq!(cfg.alerts.image_quality, 95);

    std::env::set_var("EDGEWATCH_TICK_SECS", "soon");
    let err = EngineConfig::load().unwrap_err();
    assert!(err.to_string().contains("EDGEWATCH_TICK_SECS"));

    clear_env();
}

#[test]
fn rejects_invalid_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let unreadable = EngineConfig::load_from(Some(std::path::Path::new(
        "/nonexistent/edgewatch.json",
    )))
    .unwrap_err();
    assert!(unreadable.to_string().contains("failed to read config file"));

    let malformed = write_config(".json", "{ not json");
    let err = EngineConfig::load_from(Some(malformed.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    let unknown_backend = write_config(
        ".json",
        r#"{"tasks": [{"id": "t", "backend": "missing", "video": {"uri": "stub://cam"}}]}"#,
    );
    let err = EngineConfig::load_from(Some(unknown_backend.path())).unwrap_err();
    assert!(err.to_string().contains("unknown backend"));

    let bad_region = write_config(
        ".json",
        r#"{
            "backends": [{"id": "b", "hardware": "cpu", "model_path": "stub://m"}],
            "tasks": [{"id": "t", "backend": "b", "video": {"uri": "stub://cam"},
                       "regions": [{"type": "polygon", "points": [[0, 0], [1, 1]]}]}]
        }"#,
    );
    let err = EngineConfig::load_from(Some(bad_region.path())).unwrap_err();
    assert!(err.to_string().contains("invalid region"));

    let duplicate_channel = write_config(
        ".json",
        r#"{"channels": [
            {"name": "a", "type": "http", "url": "http://x/"},
            {"name": "a", "type": "kafka", "endpoint": "k1:9092"}]}"#,
    );
    let err = EngineConfig::load_from(Some(duplicate_channel.path())).unwrap_err();
    assert!(err.to_string().contains("duplicate channel"));

    clear_env();
}
