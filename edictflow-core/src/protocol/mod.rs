//! Session message envelope and payload sum type
//!
//! Every frame on the session channel is a JSON envelope:
//!
//! ```json
//! { "type": "heartbeat", "id": "<uuid>", "timestamp": "<rfc3339>", "payload": { } }
//! ```
//!
//! Envelopes are self-describing by `type`. Decoding a known type yields a
//! typed [`Message`]; unknown types decode to `None` so receivers can log and
//! drop them without probing fields.
//!
//! # Example
//!
//! ```rust
//! use edictflow_core::protocol::{Envelope, Message, AckPayload};
//!
//! let env = Envelope::new(Message::Ack(AckPayload::ok("ref-1"))).unwrap();
//! let text = env.encode().unwrap();
//!
//! let decoded = Envelope::decode(&text).unwrap();
//! assert!(matches!(decoded.message().unwrap(), Some(Message::Ack(ack)) if ack.ref_id == "ref-1"));
//! ```

mod payload;

pub use payload::*;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EdictError, Result};

/// Every message type known to this protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // controller -> agent
    ConfigUpdate,
    Ack,
    ChangeApproved,
    ChangeRejected,
    ExceptionGranted,
    ExceptionDenied,
    SyncRequest,
    // agent -> controller
    Heartbeat,
    DriftReport,
    ContextDetected,
    SyncComplete,
    ChangeDetected,
    ChangeUpdated,
    ExceptionRequest,
    RevertComplete,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConfigUpdate => "config_update",
            MessageType::Ack => "ack",
            MessageType::ChangeApproved => "change_approved",
            MessageType::ChangeRejected => "change_rejected",
            MessageType::ExceptionGranted => "exception_granted",
            MessageType::ExceptionDenied => "exception_denied",
            MessageType::SyncRequest => "sync_request",
            MessageType::Heartbeat => "heartbeat",
            MessageType::DriftReport => "drift_report",
            MessageType::ContextDetected => "context_detected",
            MessageType::SyncComplete => "sync_complete",
            MessageType::ChangeDetected => "change_detected",
            MessageType::ChangeUpdated => "change_updated",
            MessageType::ExceptionRequest => "exception_request",
            MessageType::RevertComplete => "revert_complete",
        }
    }

    /// `None` for types this build does not know
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "config_update" => MessageType::ConfigUpdate,
            "ack" => MessageType::Ack,
            "change_approved" => MessageType::ChangeApproved,
            "change_rejected" => MessageType::ChangeRejected,
            "exception_granted" => MessageType::ExceptionGranted,
            "exception_denied" => MessageType::ExceptionDenied,
            "sync_request" => MessageType::SyncRequest,
            "heartbeat" => MessageType::Heartbeat,
            "drift_report" => MessageType::DriftReport,
            "context_detected" => MessageType::ContextDetected,
            "sync_complete" => MessageType::SyncComplete,
            "change_detected" => MessageType::ChangeDetected,
            "change_updated" => MessageType::ChangeUpdated,
            "exception_request" => MessageType::ExceptionRequest,
            "revert_complete" => MessageType::RevertComplete,
            _ => return None,
        })
    }

    /// Whether the controller originates this type
    pub fn is_controller_originated(&self) -> bool {
        matches!(
            self,
            MessageType::ConfigUpdate
                | MessageType::Ack
                | MessageType::ChangeApproved
                | MessageType::ChangeRejected
                | MessageType::ExceptionGranted
                | MessageType::ExceptionDenied
                | MessageType::SyncRequest
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message payloads keyed by envelope type
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ConfigUpdate(ConfigUpdatePayload),
    Ack(AckPayload),
    ChangeApproved(ChangeApprovedPayload),
    ChangeRejected(ChangeRejectedPayload),
    ExceptionGranted(ExceptionGrantedPayload),
    ExceptionDenied(ExceptionDeniedPayload),
    SyncRequest(SyncRequestPayload),
    Heartbeat(HeartbeatPayload),
    DriftReport(DriftReportPayload),
    ContextDetected(ContextDetectedPayload),
    SyncComplete(SyncCompletePayload),
    ChangeDetected(ChangeDetectedPayload),
    ChangeUpdated(ChangeDetectedPayload),
    ExceptionRequest(ExceptionRequestPayload),
    RevertComplete(RevertCompletePayload),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConfigUpdate(_) => MessageType::ConfigUpdate,
            Message::Ack(_) => MessageType::Ack,
            Message::ChangeApproved(_) => MessageType::ChangeApproved,
            Message::ChangeRejected(_) => MessageType::ChangeRejected,
            Message::ExceptionGranted(_) => MessageType::ExceptionGranted,
            Message::ExceptionDenied(_) => MessageType::ExceptionDenied,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::DriftReport(_) => MessageType::DriftReport,
            Message::ContextDetected(_) => MessageType::ContextDetected,
            Message::SyncComplete(_) => MessageType::SyncComplete,
            Message::ChangeDetected(_) => MessageType::ChangeDetected,
            Message::ChangeUpdated(_) => MessageType::ChangeUpdated,
            Message::ExceptionRequest(_) => MessageType::ExceptionRequest,
            Message::RevertComplete(_) => MessageType::RevertComplete,
        }
    }

    fn payload_value(&self) -> Result<Value> {
        let value = match self {
            Message::ConfigUpdate(p) => serde_json::to_value(p)?,
            Message::Ack(p) => serde_json::to_value(p)?,
            Message::ChangeApproved(p) => serde_json::to_value(p)?,
            Message::ChangeRejected(p) => serde_json::to_value(p)?,
            Message::ExceptionGranted(p) => serde_json::to_value(p)?,
            Message::ExceptionDenied(p) => serde_json::to_value(p)?,
            Message::SyncRequest(p) => serde_json::to_value(p)?,
            Message::Heartbeat(p) => serde_json::to_value(p)?,
            Message::DriftReport(p) => serde_json::to_value(p)?,
            Message::ContextDetected(p) => serde_json::to_value(p)?,
            Message::SyncComplete(p) => serde_json::to_value(p)?,
            Message::ChangeDetected(p) | Message::ChangeUpdated(p) => serde_json::to_value(p)?,
            Message::ExceptionRequest(p) => serde_json::to_value(p)?,
            Message::RevertComplete(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    fn from_parts(message_type: MessageType, payload: Value) -> Result<Self> {
        Ok(match message_type {
            MessageType::ConfigUpdate => Message::ConfigUpdate(parse(payload)?),
            MessageType::Ack => Message::Ack(parse(payload)?),
            MessageType::ChangeApproved => Message::ChangeApproved(parse(payload)?),
            MessageType::ChangeRejected => Message::ChangeRejected(parse(payload)?),
            MessageType::ExceptionGranted => Message::ExceptionGranted(parse(payload)?),
            MessageType::ExceptionDenied => Message::ExceptionDenied(parse(payload)?),
            MessageType::SyncRequest => Message::SyncRequest(parse(payload)?),
            MessageType::Heartbeat => Message::Heartbeat(parse(payload)?),
            MessageType::DriftReport => Message::DriftReport(parse(payload)?),
            MessageType::ContextDetected => Message::ContextDetected(parse(payload)?),
            MessageType::SyncComplete => Message::SyncComplete(parse(payload)?),
            MessageType::ChangeDetected => Message::ChangeDetected(parse(payload)?),
            MessageType::ChangeUpdated => Message::ChangeUpdated(parse(payload)?),
            MessageType::ExceptionRequest => Message::ExceptionRequest(parse(payload)?),
            MessageType::RevertComplete => Message::RevertComplete(parse(payload)?),
        })
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T> {
    // An absent payload decodes like an empty object
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| EdictError::InvalidMessage {
        reason: e.to_string(),
    })
}

/// The wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Wrap a message with a fresh id and the current time
    pub fn new(message: Message) -> Result<Self> {
        Self::with_id(Uuid::new_v4().to_string(), message)
    }

    /// Wrap a message under a caller-chosen id
    pub fn with_id(id: impl Into<String>, message: Message) -> Result<Self> {
        Ok(Self {
            message_type: message.message_type().as_str().to_string(),
            id: id.into(),
            timestamp: Utc::now(),
            payload: message.payload_value()?,
        })
    }

    /// Agent-side constructor: the ref id doubles as the envelope id and is
    /// copied into the payload so acknowledgements can key on it
    pub fn with_ref_id(ref_id: impl Into<String>, message: Message) -> Result<Self> {
        let ref_id = ref_id.into();
        let mut env = Self::with_id(ref_id.clone(), message)?;
        if let Value::Object(map) = &mut env.payload {
            map.insert("ref_id".to_string(), Value::String(ref_id));
        }
        Ok(env)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EdictError::InvalidMessage {
            reason: e.to_string(),
        })
    }

    /// Known type parsed into its typed payload; `Ok(None)` for unknown types
    pub fn message(&self) -> Result<Option<Message>> {
        match MessageType::parse(&self.message_type) {
            Some(t) => Message::from_parts(t, self.payload.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub fn known_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    /// The key acknowledgements use: payload `ref_id`, else the envelope id
    pub fn ref_id(&self) -> &str {
        self.payload
            .get("ref_id")
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }
}
