//! sentryd - Frigate Sentry daemon
//!
//! This daemon:
//! 1. Subscribes to the Frigate events topic and filters person detections
//! 2. Enforces a per-camera cooldown and a bounded in-flight queue
//! 3. Runs the analysis pipeline (snapshot, vision, scoring, confirmation)
//! 4. Executes allowlisted smart-home actions
//! 5. Publishes pending + final payloads on the bus and delivers chat alerts
//! 6. Appends every final decision to the event history

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frigate_sentry::intake::IntakeRunner;
use frigate_sentry::pipeline::{run_dispatcher, EventPipeline};
use frigate_sentry::publish::BusHandle;
use frigate_sentry::snapshot::spawn_staging_sweeper;
use frigate_sentry::vision::VisionClient;
use frigate_sentry::{CameraRegistry, ConfigStore, EventMemory, EventQueue};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WORKER_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bridge Frigate person detections to risk-scored security alerts"
)]
struct Args {
    /// Path to the runtime configuration file (JSON or TOML).
    #[arg(
        long,
        env = "SENTRY_CONFIG",
        default_value = "/etc/frigate-sentry/config.json"
    )]
    config: PathBuf,

    /// Skip the startup probe of the vision endpoint.
    #[arg(long, env = "SENTRY_SKIP_VISION_PROBE")]
    skip_vision_probe: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();
    let args = Args::parse();

    // The only fatal error in the process: an invalid config at startup.
    let store = ConfigStore::load(&args.config)
        .with_context(|| format!("load config from {}", args.config.display()))?;
    let cfg = store.snapshot();

    log::info!("frigate-sentry starting");
    log::info!("  config: {}", args.config.display());
    log::info!("  bus: {} topic={}", cfg.mqtt.broker_addr, cfg.mqtt.events_topic);
    log::info!("  analysis topic: {}", cfg.mqtt.analysis_topic());
    log::info!("  nvr: {}", cfg.nvr.url);
    log::info!("  vision: {} model={}", cfg.vision.endpoint, cfg.vision.model);
    log::info!(
        "  cooldown: {:?}, queue depth: {}",
        cfg.pipeline.cooldown,
        cfg.pipeline.queue_max_depth
    );
    log::info!(
        "  phases: confirmation={} actions={} delivery={}",
        cfg.phases.confirmation,
        cfg.phases.actions,
        cfg.phases.delivery
    );

    if !args.skip_vision_probe {
        match VisionClient::new().check_liveness(&cfg.vision) {
            Ok(()) => log::info!("vision endpoint is up"),
            Err(e) => log::warn!("vision endpoint probe failed: {e:#}"),
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(EventQueue::new(cfg.pipeline.queue_max_depth));
    let registry = Arc::new(CameraRegistry::new());
    let bus = Arc::new(BusHandle::new());
    let memory = Arc::new(EventMemory::open(&cfg.storage));

    {
        let shutdown = Arc::clone(&shutdown);
        let queue = Arc::clone(&queue);
        ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
            queue.close();
        })
        .context("install signal handler")?;
    }

    let watcher = ConfigStore::spawn_watcher(
        Arc::clone(&store),
        CONFIG_POLL_INTERVAL,
        Arc::clone(&shutdown),
    );
    let _sweeper = spawn_staging_sweeper(Arc::clone(&store), Arc::clone(&shutdown));

    let pipeline = Arc::new(EventPipeline::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&memory),
    ));
    let dispatcher = {
        let pipeline = Arc::clone(&pipeline);
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || run_dispatcher(pipeline, queue))
    };

    // The intake loop owns the bus connection and runs on the main thread.
    let intake = IntakeRunner::new(
        Arc::clone(&store),
        registry,
        Arc::clone(&queue),
        Arc::clone(&bus),
        Arc::clone(&shutdown),
    );
    intake.run()?;

    queue.close();
    if dispatcher.join().is_err() {
        log::warn!("dispatcher thread panicked");
    }
    // Give in-flight workers a moment to finish their publishes.
    std::thread::sleep(WORKER_GRACE_PERIOD);
    let _ = watcher.join();
    log::info!("frigate-sentry stopped");
    Ok(())
}
