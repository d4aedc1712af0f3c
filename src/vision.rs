//! Vision client: structured risk analysis of a snapshot.
//!
//! The model is asked for a MEDIA line, a short prose description, and a
//! strict JSON block. Models are unreliable about the last part, so the
//! response text goes through four extraction strategies in order, and a
//! keyword heuristic produces a decision when all of them fail. A parse
//! failure never reaches the rest of the pipeline.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::VisionSettings;
use crate::policy::EventContext;
use crate::{AlertAction, Decision, DetectionEvent, EventKind, RiskLevel, SubjectIdentity};

const FALLBACK_REASON_PREFIX: &str = "heuristic fallback";
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------- Prompt --------------------

/// Build the analysis prompt for one event. The model sees the same context
/// the scorer will use, so its judgment and the deterministic re-score stay
/// comparable.
pub fn build_prompt(event: &DetectionEvent, context: &EventContext, media_path: &str) -> String {
    format!(
        "You are a home security analyst reviewing a single camera still.\n\
         \n\
         Camera: {camera}\n\
         Zone: {zone}\n\
         Camera notes: {notes}\n\
         Local time: {local_time} ({time_of_day})\n\
         Home mode: {home_mode}\n\
         Known faces present: {known_faces}\n\
         Detections on this camera in the last hour: {recent}\n\
         \n\
         Respond with exactly three parts:\n\
         1. A line 'MEDIA: {media_path}'.\n\
         2. Three to five sentences describing who is visible, their \
         appearance, and what they are doing.\n\
         3. A line 'JSON:' followed by one strict JSON object with these \
         fields: risk (low|medium|high|critical), confidence (0..1), reason \
         (short string), event_type (unknown_person|known_person|delivery|\
         vehicle|animal|loitering|other), action (notify_only|\
         notify_and_save_clip|notify_and_light|notify_and_speaker|\
         notify_and_alarm), subject_identity (known|unknown), \
         subject_description (string), behavior (string).\n",
        camera = event.camera,
        zone = context.camera_zone,
        notes = if context.camera_notes.is_empty() {
            "none"
        } else {
            context.camera_notes.as_str()
        },
        local_time = context.local_time_label(),
        time_of_day = context.time_of_day.as_str(),
        home_mode = context.home_mode.as_str(),
        known_faces = context.known_faces_present,
        recent = context.recent_events,
        media_path = media_path,
    )
}

// -------------------- Client --------------------

#[derive(Default)]
pub struct VisionClient;

impl VisionClient {
    pub fn new() -> Self {
        Self
    }

    /// One generate call, with a single retry against the fallback endpoint
    /// on transient failure. Returns the raw response text.
    pub fn analyze(&self, vision: &VisionSettings, prompt: &str, image: &[u8]) -> Result<String> {
        let body = serde_json::json!({
            "model": vision.model,
            "prompt": prompt,
            "images": [BASE64.encode(image)],
            "stream": false,
            "options": { "temperature": 0.1 }
        });

        match generate(&vision.endpoint, &body, vision.timeout) {
            Ok(text) => Ok(text),
            Err(call) if call.transient => {
                let Some(fallback) = &vision.fallback_endpoint else {
                    return Err(call.error);
                };
                log::warn!(
                    "vision call failed: {:#}; retrying against fallback endpoint",
                    call.error
                );
                generate(fallback, &body, vision.timeout).map_err(|call| call.error)
            }
            Err(call) => Err(call.error),
        }
    }

    /// Startup probe against the model registry endpoint.
    pub fn check_liveness(&self, vision: &VisionSettings) -> Result<()> {
        let agent = ureq::AgentBuilder::new().timeout(LIVENESS_TIMEOUT).build();
        agent
            .get(&format!("{}/api/tags", vision.endpoint))
            .call()
            .with_context(|| format!("vision liveness probe at {}", vision.endpoint))?;
        Ok(())
    }
}

/// A failed generate call, split into transient (retry against the fallback
/// endpoint) and permanent (give up, let the caller fall back on keywords).
struct CallError {
    transient: bool,
    error: anyhow::Error,
}

fn generate(endpoint: &str, body: &Value, timeout: Duration) -> std::result::Result<String, CallError> {
    let url = format!("{}/api/generate", endpoint);
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let response = agent.post(&url).send_json(body.clone()).map_err(|e| CallError {
        transient: is_transient(&e),
        error: anyhow!("POST {}: {}", url, e),
    })?;
    let value: Value = response.into_json().map_err(|e| CallError {
        transient: false,
        error: anyhow!("read vision response from {}: {}", url, e),
    })?;
    match value.get("response").and_then(Value::as_str) {
        Some(text) => Ok(text.to_string()),
        None => Err(CallError {
            transient: false,
            error: anyhow!("vision response from {} missing 'response' field", url),
        }),
    }
}

fn is_transient(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code >= 500,
    }
}

// -------------------- JSON Extraction --------------------

/// Try the four extraction strategies in order and return the first JSON
/// object that parses.
pub fn extract_decision_value(text: &str) -> Option<Value> {
    from_json_line(text)
        .or_else(|| from_fenced_block(text))
        .or_else(|| from_balanced_braces(text))
        .or_else(|| from_risk_fragment(text))
}

/// Strategy 1: a line beginning with `JSON:`.
fn from_json_line(text: &str) -> Option<Value> {
    for line in text.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("JSON:") {
            if let Ok(value) = serde_json::from_str::<Value>(rest.trim()) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Strategy 2: the first fenced code block whose tag is `json` or empty.
fn from_fenced_block(text: &str) -> Option<Value> {
    static FENCE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = FENCE_RE
        .get_or_init(|| regex::Regex::new(r"(?s)```(\w*)[ \t]*\n?(.*?)```").expect("fence regex"));

    for captures in re.captures_iter(text) {
        let tag = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        if !tag.is_empty() && !tag.eq_ignore_ascii_case("json") {
            continue;
        }
        let body = captures.get(2).map(|m| m.as_str()).unwrap_or("");
        if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

/// Strategy 3: the substring from the first `{` to its matching `}` at
/// balanced depth.
fn from_balanced_braces(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str::<Value>(candidate)
                        .ok()
                        .filter(Value::is_object);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strategy 4: any `{..."risk"...}` fragment.
fn from_risk_fragment(text: &str) -> Option<Value> {
    static FRAGMENT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = FRAGMENT_RE
        .get_or_init(|| regex::Regex::new(r#"(?s)\{[^{}]*"risk".*?\}"#).expect("fragment regex"));

    for found in re.find_iter(text) {
        if let Ok(value) = serde_json::from_str::<Value>(found.as_str()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

// -------------------- Sanitized Decision --------------------

/// Map an extracted JSON object to a `Decision`, accepting both the flat
/// shape (`"risk": "low"`) and the nested one (`"risk": {"level": ...}`).
/// Returns `None` when no usable risk level is present, which sends the
/// caller to the keyword fallback.
pub fn decision_from_value(value: &Value) -> Option<Decision> {
    let risk = value.get("risk")?;
    let (level_raw, confidence, reason) = match risk {
        Value::String(level) => (
            level.clone(),
            value
                .get("confidence")
                .or_else(|| value.get("risk_confidence"))
                .and_then(Value::as_f64)
                .unwrap_or(0.5),
            string_field(value, &["reason", "risk_reason"]),
        ),
        Value::Object(fields) => (
            fields.get("level").and_then(Value::as_str)?.to_string(),
            fields
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5),
            fields
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        _ => return None,
    };

    let risk_level = RiskLevel::parse_lenient(&level_raw)?;
    let event_type = EventKind::parse_lenient(&string_field(value, &["event_type", "type"]));
    let action = AlertAction::parse_lenient(&string_field(value, &["action"]));
    let subject_identity = match string_field(value, &["subject_identity", "identity"])
        .to_lowercase()
        .as_str()
    {
        "known" => SubjectIdentity::Known,
        _ => SubjectIdentity::Unknown,
    };

    let mut decision = Decision {
        risk_level,
        risk_score: risk_level.baseline_score(),
        risk_confidence: confidence,
        risk_reason: reason,
        event_type,
        action,
        subject_identity,
        subject_description: string_field(value, &["subject_description", "subject"]),
        behavior: string_field(value, &["behavior"]),
    };
    decision.clamp_confidence();
    decision.enforce_band();
    Some(decision)
}

fn string_field(value: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(found) = value.get(key).and_then(Value::as_str) {
            return found.trim().to_string();
        }
    }
    String::new()
}

// -------------------- Keyword Fallback --------------------

/// Derive a decision from the prose alone. Used when no JSON could be
/// extracted; always succeeds.
pub fn fallback_decision(prose: &str) -> Decision {
    let lower = prose.to_lowercase();

    let (risk_level, event_type, trigger) = if ["delivery", "package"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        (RiskLevel::Medium, EventKind::Delivery, "delivery keywords")
    } else if ["loiter", "linger", "concealment", "mask", "hood up for long"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        (
            RiskLevel::High,
            EventKind::UnknownPerson,
            "suspicion keywords",
        )
    } else {
        (RiskLevel::Low, EventKind::UnknownPerson, "no keywords")
    };

    let behavior = prose
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("MEDIA:"))
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();

    Decision {
        risk_level,
        risk_score: risk_level.baseline_score(),
        risk_confidence: 0.3,
        risk_reason: format!("{} ({})", FALLBACK_REASON_PREFIX, trigger),
        event_type,
        action: AlertAction::for_band(risk_level),
        subject_identity: SubjectIdentity::Unknown,
        subject_description: String::new(),
        behavior,
    }
}

/// Turn a raw model response into a decision: structured extraction first,
/// keyword fallback second.
pub fn decide(response_text: &str) -> Decision {
    if let Some(value) = extract_decision_value(response_text) {
        if let Some(decision) = decision_from_value(&value) {
            return decision;
        }
    }
    log::warn!("no structured decision in vision response; using keyword fallback");
    fallback_decision(response_text)
}
