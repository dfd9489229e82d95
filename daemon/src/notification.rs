//! Notifications written by the backend's hook process.
//!
//! Two backend vocabularies exist, `librespot` (`session_connected`, `track_changed`, `playing`,
//! ...) and `spotifyd` (`sessionconnected`, `change`, `start`, ...). Both are translated into a
//! single [`Event`] here, so no other module needs to know their string literals.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::state::Track;

/// A decoded, not yet interpreted, notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: String,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, PartialEq, Error)]
pub enum DecodeError {
    #[error("Empty payload")]
    Empty,
    #[error("Payload is not valid UTF-8")]
    Utf8,
    #[error("Payload is not valid JSON: {0}")]
    Json(String),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Payload carries no event kind")]
    MissingKind,
}

impl Notification {
    /// Decodes a raw payload.
    ///
    /// The kind is read from `event_kind`, or from `event` which older hook scripts write.
    ///
    /// # Errors
    /// See [`DecodeError`].
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Utf8)?;
        if text.trim().is_empty() {
            return Err(DecodeError::Empty);
        }
        let value: Value =
            serde_json::from_str(text).map_err(|err| DecodeError::Json(err.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let kind = match object.remove("event_kind") {
            Some(Value::String(kind)) => Some(kind),
            _ => None,
        };
        let legacy = object.remove("event");
        let kind = match (kind, legacy) {
            (Some(kind), _) | (None, Some(Value::String(kind))) => kind,
            _ => return Err(DecodeError::MissingKind),
        };

        let fields = object
            .into_iter()
            .filter_map(|(key, value)| flatten(value).map(|value| (key, value)))
            .collect();
        Ok(Self { kind, fields })
    }

    fn text(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(|value| value.parse().ok())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .map(|value| {
                value
                    .split('\n')
                    .filter(|item| !item.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Turns a JSON value into the textual field form.
/// Lists use `\n` as separator, like the backend does in its hook environment.
fn flatten(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Array(_) | Value::Object(_) => None,
                    other => flatten(other),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Value::Null | Value::Object(_) => None,
    }
}

/// A backend-independent playback event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A remote controller attached.
    SessionConnected {
        user: Option<String>,
        connection_id: Option<String>,
    },
    /// The remote controller detached.
    SessionDisconnected,
    /// A new track, with its metadata inline.
    TrackChanged(Track),
    /// A new track known by id only.
    TrackIdChanged { id: Option<String>, duration_ms: u64 },
    Playing { position_ms: Option<u64> },
    Paused { position_ms: Option<u64> },
    Stopped,
    /// The volume changed, its new value has to be asked for.
    VolumeChanged,
    /// Anything else, kept for logging.
    Unknown(String),
}

impl From<Notification> for Event {
    fn from(notification: Notification) -> Self {
        match notification.kind.as_str() {
            "session_connected" | "sessionconnected" => Event::SessionConnected {
                user: notification.text("user_name"),
                connection_id: notification.text("connection_id"),
            },
            "session_disconnected" => Event::SessionDisconnected,
            "track_changed" => Event::TrackChanged(Track {
                id: notification.text("track_id"),
                name: notification.text("name"),
                artists: notification.list("artists"),
                album: notification.text("album"),
                cover_url: notification
                    .text("cover_url")
                    .or_else(|| notification.list("covers").into_iter().next()),
                duration_ms: notification.number("duration_ms").unwrap_or(0),
            }),
            "change" => Event::TrackIdChanged {
                id: notification.text("track_id"),
                duration_ms: notification.number("duration_ms").unwrap_or(0),
            },
            "playing" | "start" => Event::Playing {
                position_ms: notification.number("position_ms"),
            },
            "paused" | "pause" => Event::Paused {
                position_ms: notification.number("position_ms"),
            },
            "stopped" | "stop" | "endoftrack" => Event::Stopped,
            "volumeset" | "volume_changed" => Event::VolumeChanged,
            _ => Event::Unknown(notification.kind),
        }
    }
}
