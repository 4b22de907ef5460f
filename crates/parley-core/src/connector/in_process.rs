//! In-process connectors: no network hop, just a closure running in the
//! caller's task.
//!
//! These back the built-in `confidence_response_selector`,
//! `predefined_text`, and `event_set_output` services that ship with the
//! orchestrator without requiring an operator to stand up an external
//! process for trivial logic.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Connector, ServiceOutcome};

/// Picks the hypothesis with the highest `confidence` out of a
/// `{"hypotheses": [...]}` payload and returns it as
/// `{"hypotheses": [chosen]}`, matching the shape every downstream
/// formatter expects.
pub struct ConfidenceResponseSelector;

#[async_trait]
impl Connector for ConfidenceResponseSelector {
    async fn call(&self, payload: Value) -> ServiceOutcome {
        let hypotheses = match payload.get("hypotheses").and_then(Value::as_array) {
            Some(h) if !h.is_empty() => h,
            _ => return ServiceOutcome::Err("no hypotheses to select from".into()),
        };

        let best = hypotheses.iter().max_by(|a, b| {
            let ca = a.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
            let cb = b.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
            ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
        });

        match best {
            Some(h) => ServiceOutcome::Ok(json!({ "hypotheses": [h] })),
            None => ServiceOutcome::Err("no hypotheses to select from".into()),
        }
    }
}

/// Always answers with the same fixed text and skill name, regardless
/// of input. Useful as a `last_chance` fallback or in tests.
pub struct PredefinedText {
    skill_name: String,
    text: String,
}

impl PredefinedText {
    pub fn new(skill_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl Connector for PredefinedText {
    async fn call(&self, _payload: Value) -> ServiceOutcome {
        ServiceOutcome::Ok(json!({
            "hypotheses": [{
                "skill_name": self.skill_name,
                "text": self.text,
                "confidence": 1.0,
            }]
        }))
    }
}

/// Identity pass-through. The agent loop already treats any service
/// tagged `responder` as the point where the response event is set, so
/// this connector exists only to give operators a named, no-op
/// `responder` service when the pipeline's last real step is a
/// selector.
pub struct EventSetOutput;

#[async_trait]
impl Connector for EventSetOutput {
    async fn call(&self, payload: Value) -> ServiceOutcome {
        ServiceOutcome::Ok(payload)
    }
}
