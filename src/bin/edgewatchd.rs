//! edgewatchd - edge detection daemon
//!
//! Loads backends, tasks and notification channels from the configuration
//! file, then keeps each task running inside its schedule window until
//! Ctrl-C. Per-task status is logged at every health interval.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use edgewatch::alert::{AlertSink, SnapshotStore, SqliteAlertSink};
use edgewatch::config::EngineConfig;
use edgewatch::detect::{BackendPool, BackendRegistry, RuntimeLoader};
use edgewatch::notify::Dispatcher;
use edgewatch::{OverlayHub, RunnerContext, Scheduler, TaskManager};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run scheduled object detection tasks on live video")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "EDGEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the schedule reconcile interval, in seconds.
    #[arg(long)]
    tick_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = EngineConfig::load_from(args.config.as_deref())?;
    if let Some(secs) = args.tick_secs.filter(|s| *s > 0) {
        cfg.tick = Duration::from_secs(secs);
    }

    let sink: Arc<dyn AlertSink> = Arc::new(
        SqliteAlertSink::open(&cfg.alerts.db_path)
            .with_context(|| format!("open alert store {}", cfg.alerts.db_path))?,
    );
    let snapshots = if cfg.alerts.save_images || cfg.tasks.iter().any(|t| t.save_images) {
        Some(Arc::new(SnapshotStore::open(
            &cfg.alerts.image_dir,
            cfg.alerts.max_saved_images,
            cfg.alerts.image_quality,
            cfg.alerts.image_base_url.clone(),
        )?))
    } else {
        None
    };

    let dispatcher = Arc::new(Dispatcher::from_channels(&cfg.channels));
    let pool = BackendPool::new(BackendRegistry::with_defaults(RuntimeLoader::new(
        cfg.models_dir.clone(),
    )));
    let context = Arc::new(RunnerContext {
        pool,
        dispatcher: Arc::clone(&dispatcher),
        sink,
        snapshots,
        overlay: Arc::new(OverlayHub::new(cfg.overlay_queue_depth)),
        settings: cfg.runner,
    });

    log::info!(
        "edgewatchd starting: {} backends, {} tasks, {} notification channels",
        cfg.backends.len(),
        cfg.tasks.len(),
        dispatcher.channel_count()
    );
    log::info!("alerts written to {}", cfg.alerts.db_path);

    let manager = Arc::new(TaskManager::new(context, cfg.backends, cfg.tasks)?);
    let mut scheduler = Scheduler::spawn(Arc::clone(&manager), cfg.tick)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log_health(&manager, &dispatcher);
            last_health_log = Instant::now();
        }
    }

    log::info!("shutdown signal received, stopping tasks...");
    scheduler.stop();
    manager.stop_all();
    dispatcher.shutdown();
    log_health(&manager, &dispatcher);
    log::info!("edgewatchd stopped");
    Ok(())
}

fn log_health(manager: &TaskManager, dispatcher: &Dispatcher) {
    for s in manager.statuses() {
        log::info!(
            "task {}: {} frames={} detections={} alerts={} suppressed={} avg_latency={:.1}ms{}",
            s.task_id,
            s.status,
            s.frames_processed,
            s.detections,
            s.alerts_emitted,
            s.alerts_suppressed,
            s.average_latency_ms.unwrap_or(0.0),
            s.last_error
                .as_deref()
                .map(|e| format!(" last_error={}", e))
                .unwrap_or_default()
        );
    }
    for c in dispatcher.stats() {
        log::info!(
            "channel {}: delivered={} failed={} retries={} dropped={}",
            c.name,
            c.delivered,
            c.failed,
            c.retries,
            c.dropped
        );
    }
}
