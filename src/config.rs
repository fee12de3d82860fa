use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::{DEFAULT_IMAGE_QUALITY, DEFAULT_MAX_SAVED_IMAGES, DEFAULT_MESSAGE_TEMPLATE};
use crate::broadcast::DEFAULT_SUBSCRIBER_DEPTH;
use crate::detect::{
    BackendDescriptor, HardwareKind, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_INPUT_SIZE, DEFAULT_NMS_THRESHOLD, DEFAULT_PREDICT_TIMEOUT,
};
use crate::ingest::{
    Credentials, ReconnectPolicy, TransportKind, VideoSourceDescriptor, DEFAULT_BUFFER_SIZE,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_FPS, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
};
use crate::notify::{
    ChannelKind, NotificationChannel, RetryPolicy, DEFAULT_CHANNEL_QUEUE_DEPTH,
    DEFAULT_CHANNEL_TIMEOUT, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY,
};
use crate::postprocess::Region;
use crate::runner::{
    RunnerSettings, TaskConfig, DEFAULT_DEBOUNCE_INTERVAL, DEFAULT_FRAME_WAIT,
    DEFAULT_INFERENCE_INTERVAL, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_TASK_CONFIDENCE,
};
use crate::schedule::{Schedule, ScheduleType};
use crate::scheduler::DEFAULT_TICK;

pub const CONFIG_ENV: &str = "EDGEWATCH_CONFIG";
const DEFAULT_ALERT_DB: &str = "edgewatch.db";
const DEFAULT_IMAGE_DIR: &str = "alert_images";

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    scheduler: Option<SchedulerConfigFile>,
    runner: Option<RunnerConfigFile>,
    alerts: Option<AlertsConfigFile>,
    models_dir: Option<PathBuf>,
    #[serde(default)]
    backends: Vec<BackendConfigFile>,
    #[serde(default)]
    tasks: Vec<TaskConfigFile>,
    #[serde(default)]
    channels: Vec<ChannelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    tick_seconds: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RunnerConfigFile {
    frame_wait_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    overlay_queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    save_images: Option<bool>,
    image_dir: Option<PathBuf>,
    image_quality: Option<u8>,
    max_saved_images: Option<usize>,
    image_base_url: Option<String>,
    db_path: Option<String>,
    message_template: Option<String>,
}

/// `640` or `[640, 384]`.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(untagged)]
enum InputSize {
    Square(u32),
    Pair([u32; 2]),
}

#[derive(Debug, Deserialize)]
struct BackendConfigFile {
    id: String,
    #[serde(alias = "platform")]
    hardware: HardwareKind,
    model_path: String,
    input_size: Option<InputSize>,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
    labels: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    concurrency_limit: Option<usize>,
    timeout_seconds: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    name: Option<String>,
    #[serde(alias = "url")]
    uri: Option<String>,
    transport: Option<TransportKind>,
    username: Option<String>,
    password: Option<String>,
    fps: Option<u32>,
    buffer_size: Option<usize>,
    reconnect_delay_seconds: Option<f64>,
    max_reconnect_attempts: Option<u32>,
    timeout: Option<f64>,
}

/// Weekday or day-of-month, as a number or a string (`"3"`, `"mon"`, `"Monday"`).
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum DayValue {
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct TaskConfigFile {
    id: String,
    name: Option<String>,
    #[serde(alias = "model")]
    backend: String,
    #[serde(default)]
    video: VideoConfigFile,
    regions: Option<Vec<Region>>,
    confidence_threshold: Option<f32>,
    class_thresholds: Option<HashMap<String, f32>>,
    schedule_type: Option<ScheduleType>,
    schedule_days: Option<Vec<DayValue>>,
    start_time: Option<String>,
    end_time: Option<String>,
    alert_debounce_interval: Option<f64>,
    inference_interval: Option<f64>,
    enabled: Option<bool>,
    save_images: Option<bool>,
    alert_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelConfigFile {
    name: String,
    #[serde(alias = "type")]
    kind: ChannelKind,
    enabled: Option<bool>,
    #[serde(alias = "url", alias = "broker", alias = "bootstrap_servers")]
    endpoint: String,
    #[serde(alias = "routing_key")]
    topic: Option<String>,
    username: Option<String>,
    password: Option<String>,
    method: Option<String>,
    headers: Option<BTreeMap<String, String>>,
    exchange: Option<String>,
    timeout_seconds: Option<f64>,
    retry_attempts: Option<u32>,
    retry_delay_seconds: Option<f64>,
    queue_depth: Option<usize>,
}

/// Alert persistence and snapshot settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertSettings {
    pub save_images: bool,
    pub image_dir: PathBuf,
    pub image_quality: u8,
    pub max_saved_images: usize,
    pub image_base_url: Option<String>,
    pub db_path: String,
}

/// Full engine configuration: file, then environment overrides, then
/// validation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick: Duration,
    pub runner: RunnerSettings,
    pub overlay_queue_depth: usize,
    pub alerts: AlertSettings,
    pub models_dir: Option<PathBuf>,
    pub backends: Vec<BackendDescriptor>,
    pub tasks: Vec<TaskConfig>,
    pub channels: Vec<NotificationChannel>,
}

impl EngineConfig {
    /// Load from the file named by `EDGEWATCH_CONFIG` (defaults when unset).
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Result<Self> {
        let tick = match file.scheduler.and_then(|s| s.tick_seconds) {
            Some(secs) => seconds(secs, "scheduler.tick_seconds")?,
            None => DEFAULT_TICK,
        };
        let runner_file = file.runner.unwrap_or_default();
        let runner = RunnerSettings {
            frame_wait: runner_file
                .frame_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_FRAME_WAIT),
            max_consecutive_failures: runner_file
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
        };
        let alerts_file = file.alerts.unwrap_or_default();
        let template = alerts_file
            .message_template
            .clone()
            .unwrap_or_else(|| DEFAULT_MESSAGE_TEMPLATE.to_string());
        let alerts = AlertSettings {
            save_images: alerts_file.save_images.unwrap_or(false),
            image_dir: alerts_file
                .image_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR)),
            image_quality: alerts_file.image_quality.unwrap_or(DEFAULT_IMAGE_QUALITY),
            max_saved_images: alerts_file
                .max_saved_images
                .unwrap_or(DEFAULT_MAX_SAVED_IMAGES),
            image_base_url: alerts_file.image_base_url,
            db_path: alerts_file
                .db_path
                .unwrap_or_else(|| DEFAULT_ALERT_DB.to_string()),
        };

        let backends = file
            .backends
            .into_iter()
            .map(backend_from_file)
            .collect::<Result<Vec<_>>>()?;
        let tasks = file
            .tasks
            .into_iter()
            .map(|t| {
                let global = backends
                    .iter()
                    .find(|b| b.id == t.backend)
                    .map(|b| b.confidence_threshold);
                task_from_file(t, &template, alerts.save_images, global)
            })
            .collect::<Result<Vec<_>>>()?;
        let channels = file
            .channels
            .into_iter()
            .map(channel_from_file)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tick,
            runner,
            overlay_queue_depth: runner_file
                .overlay_queue_depth
                .unwrap_or(DEFAULT_SUBSCRIBER_DEPTH),
            alerts,
            models_dir: file.models_dir,
            backends,
            tasks,
            channels,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(tick) = std::env::var("EDGEWATCH_TICK_SECS") {
            let secs: f64 = tick
                .trim()
                .parse()
                .map_err(|_| anyhow!("EDGEWATCH_TICK_SECS must be a number of seconds"))?;
            self.tick = seconds(secs, "EDGEWATCH_TICK_SECS")?;
        }
        if let Ok(path) = std::env::var("EDGEWATCH_ALERT_DB") {
            if !path.trim().is_empty() {
                self.alerts.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("EDGEWATCH_IMAGE_DIR") {
            if !dir.trim().is_empty() {
                self.alerts.image_dir = PathBuf::from(dir);
            }
        }
        if let Ok(max) = std::env::var("EDGEWATCH_MAX_SAVED_IMAGES") {
            self.alerts.max_saved_images = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("EDGEWATCH_MAX_SAVED_IMAGES must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(anyhow!("scheduler tick must be greater than zero"));
        }
        if self.alerts.max_saved_images == 0 {
            return Err(anyhow!("max_saved_images must be greater than zero"));
        }
        if !(1..=100).contains(&self.alerts.image_quality) {
            return Err(anyhow!("image_quality must be within 1..=100"));
        }

        let mut backend_ids = HashSet::new();
        for backend in &self.backends {
            if !backend_ids.insert(backend.id.as_str()) {
                return Err(anyhow!("duplicate backend id '{}'", backend.id));
            }
            if backend.input_width == 0 || backend.input_height == 0 {
                return Err(anyhow!("backend '{}': input size must be non-zero", backend.id));
            }
            if backend.std.iter().any(|s| *s == 0.0) {
                return Err(anyhow!("backend '{}': std must be non-zero", backend.id));
            }
            check_unit(backend.confidence_threshold, &backend.id, "confidence_threshold")?;
            check_unit(backend.nms_threshold, &backend.id, "nms_threshold")?;
            if backend.concurrency_limit == 0 {
                return Err(anyhow!(
                    "backend '{}': concurrency_limit must be at least 1",
                    backend.id
                ));
            }
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(anyhow!("duplicate task id '{}'", task.id));
            }
            if !backend_ids.contains(task.backend_id.as_str()) {
                return Err(anyhow!(
                    "task '{}' references unknown backend '{}'",
                    task.id,
                    task.backend_id
                ));
            }
            if task.source.uri.trim().is_empty() {
                return Err(anyhow!("task '{}': video uri is empty", task.id));
            }
            if task.source.buffer_size == 0 {
                return Err(anyhow!("task '{}': buffer_size must be at least 1", task.id));
            }
            check_unit(task.confidence_threshold, &task.id, "confidence_threshold")?;
            for (class, threshold) in &task.class_thresholds {
                check_unit(*threshold, &task.id, &format!("class_thresholds.{}", class))?;
            }
            if let Some(region) = task.regions.iter().find(|r| !r.is_valid()) {
                return Err(anyhow!("task '{}': invalid region {:?}", task.id, region));
            }
        }

        let mut channel_names = HashSet::new();
        for channel in &self.channels {
            if !channel_names.insert(channel.name.as_str()) {
                return Err(anyhow!("duplicate channel name '{}'", channel.name));
            }
            if channel.endpoint.trim().is_empty() {
                return Err(anyhow!("channel '{}': endpoint is empty", channel.name));
            }
        }
        Ok(())
    }
}

fn backend_from_file(file: BackendConfigFile) -> Result<BackendDescriptor> {
    let mut d = BackendDescriptor::new(file.id, file.hardware, file.model_path);
    let (w, h) = match file.input_size {
        Some(InputSize::Square(n)) => (n, n),
        Some(InputSize::Pair([w, h])) => (w, h),
        None => (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE),
    };
    d.input_width = w;
    d.input_height = h;
    if let Some(mean) = file.mean {
        d.mean = mean;
    }
    if let Some(std) = file.std {
        d.std = std;
    }
    d.labels = file.labels.unwrap_or_default();
    d.confidence_threshold = file
        .confidence_threshold
        .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);
    d.nms_threshold = file.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD);
    d.concurrency_limit = file.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT);
    d.timeout = match file.timeout_seconds {
        Some(secs) => seconds(secs, "timeout_seconds")?,
        None => DEFAULT_PREDICT_TIMEOUT,
    };
    Ok(d)
}

/// `global` is the confidence threshold of the task's backend, used when the
/// task sets none of its own.
fn task_from_file(
    file: TaskConfigFile,
    template: &str,
    save_images: bool,
    global: Option<f32>,
) -> Result<TaskConfig> {
    let id = file.id;
    let ctx = |field: &str| format!("task '{}': {}", id, field);
    let video = file.video;
    let mut source = VideoSourceDescriptor::new(video.uri.unwrap_or_default());
    if let Some(transport) = video.transport {
        source.transport = transport;
    }
    source.name = video
        .name
        .or_else(|| file.name.clone())
        .unwrap_or_else(|| id.clone());
    source.credentials = video.username.map(|username| Credentials {
        username,
        password: video.password,
    });
    source.fps = video.fps.unwrap_or(DEFAULT_FPS);
    source.buffer_size = video.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
    source.reconnect = ReconnectPolicy {
        delay: match video.reconnect_delay_seconds {
            Some(secs) => seconds(secs, &ctx("reconnect_delay_seconds"))?,
            None => DEFAULT_RECONNECT_DELAY,
        },
        max_attempts: video
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        timeout: match video.timeout {
            Some(secs) => seconds(secs, &ctx("timeout"))?,
            None => DEFAULT_CONNECT_TIMEOUT,
        },
    };

    let kind = file.schedule_type.unwrap_or(ScheduleType::Continuous);
    let days = file
        .schedule_days
        .unwrap_or_default()
        .iter()
        .map(|d| parse_day(d, kind))
        .collect::<Result<Vec<u32>>>()
        .with_context(|| ctx("schedule_days"))?;
    let schedule = match kind {
        ScheduleType::Continuous => Schedule::continuous(),
        _ => Schedule::new(
            kind,
            file.start_time.as_deref(),
            file.end_time.as_deref(),
            &days,
        )
        .with_context(|| ctx("schedule"))?,
    };

    let mut task = TaskConfig::new(id.clone(), file.backend, source);
    task.name = file.name.unwrap_or_else(|| id.clone());
    task.regions = file.regions.unwrap_or_default();
    task.confidence_threshold = file
        .confidence_threshold
        .or(global)
        .unwrap_or(DEFAULT_TASK_CONFIDENCE);
    task.class_thresholds = file.class_thresholds.unwrap_or_default();
    task.schedule = schedule;
    task.debounce_interval = match file.alert_debounce_interval {
        Some(secs) => seconds(secs, &ctx("alert_debounce_interval"))?,
        None => DEFAULT_DEBOUNCE_INTERVAL,
    };
    task.inference_interval = match file.inference_interval {
        Some(secs) => seconds(secs, &ctx("inference_interval"))?,
        None => DEFAULT_INFERENCE_INTERVAL,
    };
    task.enabled = file.enabled.unwrap_or(true);
    task.save_images = file.save_images.unwrap_or(save_images);
    task.alert_message = file.alert_message.unwrap_or_else(|| template.to_string());
    Ok(task)
}

fn channel_from_file(file: ChannelConfigFile) -> Result<NotificationChannel> {
    let mut c = NotificationChannel::new(file.name, file.kind, file.endpoint);
    c.enabled = file.enabled.unwrap_or(true);
    c.topic = file.topic;
    c.username = file.username;
    c.password = file.password;
    if let Some(method) = file.method {
        c.method = method;
    }
    c.headers = file.headers.unwrap_or_default();
    c.exchange = file.exchange;
    c.timeout = match file.timeout_seconds {
        Some(secs) => seconds(secs, "timeout_seconds")?,
        None => DEFAULT_CHANNEL_TIMEOUT,
    };
    c.retry = RetryPolicy {
        attempts: file.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
        delay: match file.retry_delay_seconds {
            Some(secs) => seconds(secs, "retry_delay_seconds")?,
            None => DEFAULT_RETRY_DELAY,
        },
    };
    c.queue_depth = file.queue_depth.unwrap_or(DEFAULT_CHANNEL_QUEUE_DEPTH);
    Ok(c)
}

fn parse_day(value: &DayValue, kind: ScheduleType) -> Result<u32> {
    match value {
        DayValue::Number(n) => Ok(*n),
        DayValue::Text(text) => {
            let text = text.trim().to_ascii_lowercase();
            if let Ok(n) = text.parse::<u32>() {
                return Ok(n);
            }
            if kind != ScheduleType::Weekly {
                return Err(anyhow!("day '{}' must be numeric", text));
            }
            const NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
            NAMES
                .iter()
                .position(|n| text.starts_with(n))
                .map(|i| i as u32 + 1)
                .ok_or_else(|| anyhow!("unknown weekday '{}'", text))
        }
    }
}

fn seconds(value: f64, field: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", field))
}

fn check_unit(value: f32, owner: &str, field: &str) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("'{}': {} must be within [0, 1], got {}", owner, field, value))
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
