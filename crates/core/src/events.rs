//! Lifecycle events and the webhook envelope
//!
//! The event set is closed. Payload `data` is event-specific JSON; the
//! envelope is the canonical serialization signed by the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CallId, OrgId};

/// Closed set of webhook event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    CallStarted,
    CallEnded,
    TurnCompleted,
    Interruption,
    TransferRequested,
    CallbackScheduled,
    SentimentAlert,
    Error,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::CallStarted => "call_started",
            WebhookEvent::CallEnded => "call_ended",
            WebhookEvent::TurnCompleted => "turn_completed",
            WebhookEvent::Interruption => "interruption",
            WebhookEvent::TransferRequested => "transfer_requested",
            WebhookEvent::CallbackScheduled => "callback_scheduled",
            WebhookEvent::SentimentAlert => "sentiment_alert",
            WebhookEvent::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call_started" => Some(WebhookEvent::CallStarted),
            "call_ended" => Some(WebhookEvent::CallEnded),
            "turn_completed" => Some(WebhookEvent::TurnCompleted),
            "interruption" => Some(WebhookEvent::Interruption),
            "transfer_requested" => Some(WebhookEvent::TransferRequested),
            "callback_scheduled" => Some(WebhookEvent::CallbackScheduled),
            "sentiment_alert" => Some(WebhookEvent::SentimentAlert),
            "error" => Some(WebhookEvent::Error),
            _ => None,
        }
    }
}

/// Canonical webhook payload envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: WebhookEvent,
    pub conversation_id: CallId,
    pub org_id: OrgId,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: WebhookEvent, conversation_id: CallId, org_id: OrgId, data: Value) -> Self {
        Self {
            event_type,
            conversation_id,
            org_id,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Canonical bytes the HMAC signature is computed over
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // serde_json with struct field order is the canonical form
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }
}

/// Structured per-stage log row, append-only and keyed by conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub conversation_id: CallId,
    pub org_id: OrgId,
    /// Stage name, e.g. "stt", "denoise", "turn_controller"
    pub stage: String,
    /// Short digest of the stage input (never raw audio or full text)
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    pub latency_ms: Option<u64>,
    pub model_id: Option<String>,
    pub parameters: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl CallEvent {
    pub fn stage(conversation_id: CallId, org_id: OrgId, stage: impl Into<String>) -> Self {
        Self {
            conversation_id,
            org_id,
            stage: stage.into(),
            input_digest: None,
            output_digest: None,
            latency_ms: None,
            model_id: None,
            parameters: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_round_trip() {
        for e in [
            WebhookEvent::CallStarted,
            WebhookEvent::CallEnded,
            WebhookEvent::TurnCompleted,
            WebhookEvent::Interruption,
            WebhookEvent::TransferRequested,
            WebhookEvent::CallbackScheduled,
            WebhookEvent::SentimentAlert,
            WebhookEvent::Error,
        ] {
            assert_eq!(WebhookEvent::parse(e.as_str()), Some(e));
        }
        assert_eq!(WebhookEvent::parse("nonsense"), None);
    }

    #[test]
    fn test_envelope_canonical_fields() {
        let env = EventEnvelope::new(
            WebhookEvent::CallEnded,
            CallId::new(),
            OrgId::new(),
            serde_json::json!({"reason": "completed"}),
        );
        let bytes = env.canonical_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["event_type"], "call_ended");
        assert!(value["conversation_id"].is_string());
        assert!(value["timestamp"].is_string());
    }
}
