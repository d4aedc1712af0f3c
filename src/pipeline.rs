//! The per-event pipeline: INTAKE -> PENDING_PUBLISHED -> SNAPSHOT -> VISION
//! -> SCORE -> [CONFIRM] -> ACTION -> FINAL_PUBLISHED -> FORMAT -> DELIVER ->
//! MEMORY_APPEND.
//!
//! Snapshot, vision, and scoring failures terminate the event (the pending
//! publication is deliberately not retracted); action, delivery, and memory
//! failures are logged and the remaining stages still run.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::actions::ActionExecutor;
use crate::alert::format_alert;
use crate::confirm::run_confirmation;
use crate::deliver::{should_deliver, DeliveryClient};
use crate::history::HistoryRecord;
use crate::media::MediaPlan;
use crate::policy::{self, HubClient};
use crate::publish::{publish_analysis, AnalysisPayload, BusHandle};
use crate::score::score_decision;
use crate::snapshot::SnapshotFetcher;
use crate::vision::{self, VisionClient};
use crate::config::PhaseToggles;
use crate::{ConfigStore, DetectionEvent, EventMemory, EventQueue, RiskLevel};

/// Everything a worker needs to run one event end to end.
pub struct EventPipeline {
    pub store: Arc<ConfigStore>,
    pub bus: Arc<BusHandle>,
    pub memory: Arc<EventMemory>,
    pub hub: Arc<HubClient>,
    pub fetcher: SnapshotFetcher,
    pub vision: VisionClient,
    pub executor: ActionExecutor,
    pub delivery: DeliveryClient,
}

impl EventPipeline {
    pub fn new(store: Arc<ConfigStore>, bus: Arc<BusHandle>, memory: Arc<EventMemory>) -> Self {
        Self {
            store,
            bus,
            memory,
            hub: Arc::new(HubClient::new()),
            fetcher: SnapshotFetcher::new(),
            vision: VisionClient::new(),
            executor: ActionExecutor::new(),
            delivery: DeliveryClient::new(),
        }
    }

    /// Run one accepted detection to completion. Never panics; terminal
    /// failures are logged here.
    pub fn run_event(&self, event: DetectionEvent) {
        if let Err(e) = self.run_event_inner(&event) {
            log::error!(
                "pipeline terminated for event_id={} camera={}: {e:#}",
                event.event_id,
                event.camera
            );
        }
    }

    fn run_event_inner(&self, event: &DetectionEvent) -> Result<()> {
        let cfg = self.store.snapshot();
        let profile = cfg.camera_profile(&event.camera);
        let analysis_topic = cfg.mqtt.analysis_topic();

        // PENDING_PUBLISHED: downstream consumers see the event immediately.
        let pending = AnalysisPayload::pending(event, &profile.zone);
        if let Err(e) = publish_analysis(&self.bus, &analysis_topic, &pending) {
            log::warn!("pending publish failed for {}: {e:#}", event.event_id);
        }

        // SNAPSHOT
        let staged = self
            .fetcher
            .fetch_and_stage(&cfg, &event.event_id)
            .context("snapshot stage")?;
        let image = std::fs::read(&staged.detection_path)
            .with_context(|| format!("read {}", staged.detection_path.display()))?;

        // Context gathering cannot fail the event.
        let context = policy::gather_context(&cfg, &self.hub, &self.memory, &event.camera);

        // VISION
        let prompt = vision::build_prompt(event, &context, &staged.relative_path);
        let response = self
            .vision
            .analyze(&cfg.vision, &prompt, &image)
            .context("vision stage")?;
        let ai_decision = vision::decide(&response);

        // SCORE
        let mut decision = score_decision(&ai_decision, &context);

        // CONFIRM: second look for high and critical only.
        if should_confirm(&cfg.phases, decision.risk_level) {
            decision = run_confirmation(Arc::clone(&cfg), event, &context, &decision);
        }

        let media = MediaPlan::for_level(decision.risk_level);
        let alert = format_alert(
            event,
            &decision,
            &context,
            &media,
            &staged.relative_path,
            None,
        );

        // ACTION: side effects never block messaging.
        let quiet_now = policy::in_quiet_hours(&cfg.quiet_hours);
        let outcome = if cfg.phases.actions {
            self.executor.execute(
                &cfg,
                &event.event_id,
                &profile.zone,
                decision.action,
                decision.risk_level,
                &media,
                quiet_now,
                &alert.speech,
            )
        } else {
            Default::default()
        };

        // FINAL_PUBLISHED
        let alert = format_alert(
            event,
            &decision,
            &context,
            &media,
            &staged.relative_path,
            outcome.clip_url.as_deref(),
        );
        let final_payload = AnalysisPayload::finalized(
            event,
            &decision,
            &context,
            &media,
            alert.body.clone(),
            alert.speech.clone(),
            staged.relative_path.clone(),
            outcome.clip_url.clone(),
        );
        if let Err(e) = publish_analysis(&self.bus, &analysis_topic, &final_payload) {
            log::warn!("final publish failed for {}: {e:#}", event.event_id);
        }

        // DELIVER: chat only for medium risk and above.
        if cfg.phases.delivery && should_deliver(decision.risk_level) {
            if let Err(e) = self.delivery.deliver(&cfg, event, &alert) {
                log::warn!("chat delivery failed for {}: {e:#}", event.event_id);
            }
        } else {
            log::debug!(
                "skipping chat delivery for {} (risk {})",
                event.event_id,
                decision.risk_level
            );
        }

        // MEMORY_APPEND
        let record = HistoryRecord::from_decision(&event.camera, &decision);
        if let Err(e) = self.memory.append(&record) {
            log::warn!("history append failed for {}: {e:#}", event.event_id);
        }

        log::info!(
            "event done event_id={} camera={} risk={} score={} action={}",
            event.event_id,
            event.camera,
            decision.risk_level,
            decision.risk_score,
            decision.action
        );
        Ok(())
    }
}

/// Confirmation runs only when the phase toggle is on and the scored risk is
/// high or critical.
pub fn should_confirm(phases: &PhaseToggles, level: RiskLevel) -> bool {
    phases.confirmation && level >= RiskLevel::High
}

/// Pop accepted events and run one worker thread per event until the queue
/// closes.
pub fn run_dispatcher(pipeline: Arc<EventPipeline>, queue: Arc<EventQueue>) {
    while let Some(event) = queue.pop() {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || pipeline.run_event(event));
    }
    log::info!("dispatcher stopped");
}
