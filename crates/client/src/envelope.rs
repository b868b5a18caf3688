//! Event envelope decoding
//!
//! Raw frames come in two shapes (bare `{type, properties}` or wrapped
//! `{directory, payload}`) and name their session in one of several nested
//! places depending on the event kind. Everything downstream sees only
//! [`EventEnvelope`].

use chatsync_protocol::{EventFrame, EventKind, GlobalEventFrame};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has no event type")]
    MissingType,
}

/// Canonical form of one inbound event
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub directory: Option<String>,
    pub properties: Value,
}

impl EventEnvelope {
    /// Deserialize one property, `None` if absent or malformed.
    pub fn property<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.properties
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Deserialize the whole property object.
    pub fn properties_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.properties.clone()).ok()
    }

    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

pub fn decode_frame(raw: &str) -> Result<EventEnvelope, EnvelopeError> {
    let value: Value = serde_json::from_str(raw)?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<EventEnvelope, EnvelopeError> {
    let wrapped = value.get("payload").is_some_and(Value::is_object);
    let body = if wrapped { &value["payload"] } else { &value };
    if !body.get("type").is_some_and(Value::is_string) {
        return Err(EnvelopeError::MissingType);
    }

    let (directory, frame) = if wrapped {
        let global: GlobalEventFrame = serde_json::from_value(value)?;
        (global.directory, global.payload)
    } else {
        (None, serde_json::from_value::<EventFrame>(value)?)
    };
    let kind = EventKind::from_type(&frame.event_type);
    let properties = match frame.properties {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let session_id = resolve_session_id(&kind, &properties);

    Ok(EventEnvelope {
        kind,
        session_id,
        directory,
        properties,
    })
}

fn nested_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty())
}

fn resolve_session_id(kind: &EventKind, properties: &Value) -> Option<String> {
    let candidates: &[&[&str]] = &[
        &["sessionID"],
        &["part", "sessionID"],
        &["message", "sessionID"],
        &["info", "sessionID"],
    ];
    let found = candidates
        .iter()
        .find_map(|path| nested_str(properties, path));
    if let Some(id) = found {
        return Some(id.to_string());
    }

    // session.* lifecycle events describe the session itself
    if kind.is_session_lifecycle() {
        return nested_str(properties, &["info", "id"])
            .or_else(|| nested_str(properties, &["session", "id"]))
            .map(str::to_string);
    }
    None
}
