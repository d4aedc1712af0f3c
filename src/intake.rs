//! Event intake: Frigate bus subscription, per-camera cooldown, and the
//! bounded hand-off queue between the bus thread and pipeline workers.
//!
//! Frigate publishes `{ "before": {...}, "after": {...}, "type": "new" }`
//! wrappers on its events topic. Only `type="new"` person detections are
//! accepted; everything else is dropped before it can touch the pipeline.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::MqttSettings;
use crate::publish::BusHandle;
use crate::ConfigStore;

const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

// -------------------- Detection Events --------------------

/// A single accepted person detection, alive until its pipeline run ends.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    pub event_id: String,
    pub camera: String,
    pub label: String,
    pub score: f64,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct FrigateEventWrapper {
    #[serde(rename = "type")]
    event_type: Option<String>,
    after: Option<FrigateEventData>,
}

#[derive(Debug, Deserialize)]
struct FrigateEventData {
    id: Option<String>,
    camera: Option<String>,
    label: Option<String>,
    #[serde(default)]
    score: f64,
    top_score: Option<f64>,
    start_time: Option<f64>,
    #[serde(default)]
    false_positive: bool,
}

/// Decode one bus payload into a `DetectionEvent`, rejecting everything that
/// is not a fresh person detection. Rejections are ordinary `Err`s the caller
/// logs at debug level; a malformed message never blocks the intake loop.
pub fn decode_detection(payload: &[u8]) -> Result<DetectionEvent> {
    let wrapper: FrigateEventWrapper =
        serde_json::from_slice(payload).context("parse Frigate event JSON")?;

    match wrapper.event_type.as_deref() {
        Some("new") => {}
        Some(other) => return Err(anyhow!("ignoring event type '{}'", other)),
        None => return Err(anyhow!("event missing 'type'")),
    }

    let after = wrapper
        .after
        .ok_or_else(|| anyhow!("missing 'after' section in event"))?;
    if after.false_positive {
        return Err(anyhow!("false positive event"));
    }

    let label = after.label.unwrap_or_default();
    if !label.eq_ignore_ascii_case("person") {
        return Err(anyhow!("ignoring label '{}'", label));
    }

    let event_id = after
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| anyhow!("event missing id"))?;
    let camera = after
        .camera
        .filter(|camera| !camera.trim().is_empty())
        .ok_or_else(|| anyhow!("event missing camera"))?;

    let start_time = match after.start_time {
        Some(epoch) if epoch.is_finite() && epoch >= 0.0 => Utc
            .timestamp_opt(epoch as i64, 0)
            .single()
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    };

    Ok(DetectionEvent {
        event_id,
        camera,
        label: label.to_lowercase(),
        score: after.top_score.unwrap_or(after.score).clamp(0.0, 1.0),
        start_time,
    })
}

// -------------------- Camera Registry --------------------

#[derive(Debug, Default)]
struct CameraState {
    last_alert_at: Option<Instant>,
}

/// Per-camera cooldown state. One small mutex per camera; no global lock is
/// held while a camera decision is made.
#[derive(Default)]
pub struct CameraRegistry {
    cameras: Mutex<HashMap<String, Arc<Mutex<CameraState>>>>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, camera: &str) -> Arc<Mutex<CameraState>> {
        let mut cameras = match self.cameras.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            cameras
                .entry(camera.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CameraState::default()))),
        )
    }

    /// Check the cooldown and, if the event is accepted, advance
    /// `last_alert_at` in the same critical section.
    pub fn try_accept(&self, camera: &str, cooldown: Duration) -> bool {
        let state = self.state_for(camera);
        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if let Some(last) = state.last_alert_at {
            if now.duration_since(last) < cooldown {
                return false;
            }
        }
        state.last_alert_at = Some(now);
        true
    }
}

// -------------------- Event Queue --------------------

struct QueueInner {
    events: VecDeque<DetectionEvent>,
    closed: bool,
}

/// Bounded hand-off queue between the bus thread and the dispatcher. During
/// detection storms the oldest undelivered events are dropped first so the
/// most recent detections survive.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    max_depth: usize,
}

impl EventQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Enqueue one event; returns how many old events were evicted to make
    /// room so the caller can log the overflow.
    pub fn push(&self, event: DetectionEvent) -> usize {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.closed {
            return 0;
        }
        let mut dropped = 0;
        while inner.events.len() >= self.max_depth {
            inner.events.pop_front();
            dropped += 1;
        }
        inner.events.push_back(event);
        drop(inner);
        self.ready.notify_one();
        dropped
    }

    /// Block until an event is available or the queue is closed and drained.
    pub fn pop(&self) -> Option<DetectionEvent> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Some(event);
            }
            if inner.closed {
                return None;
            }
            inner = match self.ready.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn close(&self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.closed = true;
        drop(inner);
        self.ready.notify_all();
    }
}

// -------------------- Bus Intake Loop --------------------

/// Owns the MQTT connection for the whole process: incoming detections are
/// filtered and queued here, and polling the connection also flushes the
/// publishes that workers enqueue through the shared [`BusHandle`].
pub struct IntakeRunner {
    store: Arc<ConfigStore>,
    registry: Arc<CameraRegistry>,
    queue: Arc<EventQueue>,
    bus: Arc<BusHandle>,
    shutdown: Arc<AtomicBool>,
}

impl IntakeRunner {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<CameraRegistry>,
        queue: Arc<EventQueue>,
        bus: Arc<BusHandle>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            bus,
            shutdown,
        }
    }

    /// Subscribe and consume until shutdown. Reconnects with exponential
    /// backoff capped at 30 s, re-subscribing after every reconnect.
    pub fn run(&self) -> Result<()> {
        let mut backoff = RECONNECT_BACKOFF_START;

        while !self.shutdown.load(Ordering::Relaxed) {
            let cfg = self.store.snapshot();
            let (client, mut connection) = match connect_bus(&cfg.mqtt) {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("bus connect failed: {e:#}; retrying in {:?}", backoff);
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                    continue;
                }
            };

            if let Err(e) = client.subscribe(&cfg.mqtt.events_topic, QoS::AtLeastOnce) {
                log::warn!("bus subscribe failed: {e}; retrying in {:?}", backoff);
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                continue;
            }
            log::info!("subscribed to {}", cfg.mqtt.events_topic);
            self.bus.set_client(client);
            let _ = self
                .bus
                .publish_raw(&cfg.mqtt.availability_topic(), PAYLOAD_ONLINE.as_bytes(), true);
            backoff = RECONNECT_BACKOFF_START;

            let mut disconnecting = false;
            for event in connection.iter() {
                if self.shutdown.load(Ordering::Relaxed) && !disconnecting {
                    // Keep polling so queued QoS-1 publishes flush before the
                    // clean disconnect terminates the iterator.
                    self.bus
                        .shutdown(&cfg.mqtt.availability_topic(), PAYLOAD_OFFLINE);
                    disconnecting = true;
                }
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if !disconnecting {
                            self.handle_payload(&publish.payload);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if disconnecting {
                            return Ok(());
                        }
                        log::error!("bus connection error: {e}; reconnecting");
                        break;
                    }
                }
            }
            if disconnecting {
                return Ok(());
            }

            self.bus.clear_client();
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }

        Ok(())
    }

    fn handle_payload(&self, payload: &[u8]) {
        let event = match decode_detection(payload) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("skipping bus message: {e:#}");
                return;
            }
        };

        let cfg = self.store.snapshot();
        if !self
            .registry
            .try_accept(&event.camera, cfg.pipeline.cooldown)
        {
            log::info!(
                "cooldown drop camera={} event_id={}",
                event.camera,
                event.event_id
            );
            return;
        }

        log::info!(
            "accepted detection camera={} event_id={} score={:.2}",
            event.camera,
            event.event_id,
            event.score
        );
        let dropped = self.queue.push(event);
        if dropped > 0 {
            log::warn!("event queue overflow: dropped {} oldest event(s)", dropped);
        }
    }
}

fn connect_bus(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let (host, port) = split_host_port(&settings.broker_addr)?;
    let mut options = MqttOptions::new(&settings.client_id, host, port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = &settings.username {
        options.set_credentials(user, settings.password.clone().unwrap_or_default());
    }
    let will = LastWill::new(
        settings.availability_topic(),
        PAYLOAD_OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
        None,
    );
    options.set_last_will(will);

    let (client, connection) = Client::new(options, 32);
    log::info!(
        "connected to bus at {} (auth: {})",
        settings.broker_addr,
        settings.username.is_some()
    );
    Ok((client, connection))
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_person_payload(id: &str, camera: &str) -> Vec<u8> {
        serde_json::json!({
            "type": "new",
            "after": {
                "id": id,
                "camera": camera,
                "label": "person",
                "score": 0.62,
                "top_score": 0.81,
                "start_time": 1_700_000_000.5
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn decodes_new_person_event() {
        let event = decode_detection(&new_person_payload("1700000000.5-abc", "front_door"))
            .expect("decode");
        assert_eq!(event.event_id, "1700000000.5-abc");
        assert_eq!(event.camera, "front_door");
        assert_eq!(event.label, "person");
        assert_eq!(event.score, 0.81);
    }

    #[test]
    fn rejects_update_and_end_events() {
        for kind in ["update", "end"] {
            let payload = serde_json::json!({
                "type": kind,
                "after": { "id": "x", "camera": "c", "label": "person" }
            })
            .to_string();
            assert!(decode_detection(payload.as_bytes()).is_err());
        }
    }

    #[test]
    fn rejects_non_person_labels() {
        let payload = serde_json::json!({
            "type": "new",
            "after": { "id": "x", "camera": "c", "label": "car", "score": 0.9 }
        })
        .to_string();
        assert!(decode_detection(payload.as_bytes()).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(decode_detection(b"{not json").is_err());
    }

    #[test]
    fn cooldown_drops_second_event_and_not_other_cameras() {
        let registry = CameraRegistry::new();
        let cooldown = Duration::from_secs(30);
        assert!(registry.try_accept("front_door", cooldown));
        assert!(!registry.try_accept("front_door", cooldown));
        assert!(registry.try_accept("driveway", cooldown));
    }

    #[test]
    fn zero_cooldown_accepts_back_to_back_events() {
        let registry = CameraRegistry::new();
        assert!(registry.try_accept("front_door", Duration::ZERO));
        assert!(registry.try_accept("front_door", Duration::ZERO));
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = EventQueue::new(2);
        let make = |id: &str| DetectionEvent {
            event_id: id.to_string(),
            camera: "cam".to_string(),
            label: "person".to_string(),
            score: 0.5,
            start_time: Utc::now(),
        };
        assert_eq!(queue.push(make("a")), 0);
        assert_eq!(queue.push(make("b")), 0);
        assert_eq!(queue.push(make("c")), 1);
        assert_eq!(queue.pop().expect("pop").event_id, "b");
        assert_eq!(queue.pop().expect("pop").event_id, "c");
    }

    #[test]
    fn closed_queue_drains_then_returns_none() {
        let queue = EventQueue::new(4);
        queue.push(DetectionEvent {
            event_id: "a".to_string(),
            camera: "cam".to_string(),
            label: "person".to_string(),
            score: 0.5,
            start_time: Utc::now(),
        });
        queue.close();
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn splits_broker_addr_with_optional_scheme() {
        assert_eq!(
            split_host_port("mqtt://broker.local:1883").expect("parse"),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            split_host_port("127.0.0.1:1883").expect("parse"),
            ("127.0.0.1".to_string(), 1883)
        );
        assert!(split_host_port("no-port").is_err());
    }
}
