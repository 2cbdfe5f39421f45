//! Typed push events and the JSON frames that carry them.
//!
//! Server frames look like `{"event": "wine-changed", "data": {...}}`. The
//! event name selects an [`EventKind`]; the payload shapes belong to the
//! server, so each payload keeps the fields the sync layer routes on and
//! passes everything else through in `extra`.

use crate::error::{Result, SyncError};
use crate::types::{parse_timestamp, TimestampMs};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ConnectionStatus,
    PointerChanged,
    ParticipantJoined,
    ParticipantLeft,
    ParticipantReady,
    ScoreSubmitted,
    GuessSubmitted,
    EventStarted,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ConnectionStatus,
        EventKind::PointerChanged,
        EventKind::ParticipantJoined,
        EventKind::ParticipantLeft,
        EventKind::ParticipantReady,
        EventKind::ScoreSubmitted,
        EventKind::GuessSubmitted,
        EventKind::EventStarted,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::ConnectionStatus => "connection-status",
            EventKind::PointerChanged => "wine-changed",
            EventKind::ParticipantJoined => "participant-joined",
            EventKind::ParticipantLeft => "participant-left",
            EventKind::ParticipantReady => "participant-ready",
            EventKind::ScoreSubmitted => "score-submitted",
            EventKind::GuessSubmitted => "guess-submitted",
            EventKind::EventStarted => "event-started",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "connection-status" => Some(EventKind::ConnectionStatus),
            "wine-changed" | "pointer-changed" => Some(EventKind::PointerChanged),
            "participant-joined" => Some(EventKind::ParticipantJoined),
            "participant-left" => Some(EventKind::ParticipantLeft),
            "participant-ready" => Some(EventKind::ParticipantReady),
            "score-submitted" => Some(EventKind::ScoreSubmitted),
            "guess-submitted" => Some(EventKind::GuessSubmitted),
            "event-started" => Some(EventKind::EventStarted),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    de_opt_id(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("expected string or numeric id"))
}

fn de_opt_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<TimestampMs>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusPayload {
    #[serde(default, alias = "socketId")]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The host moved the shared pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerChanged {
    #[serde(alias = "eventId", deserialize_with = "de_id")]
    pub room_id: String,
    #[serde(alias = "pointer", alias = "currentWineNumber")]
    pub wine_number: u32,
    /// Server time of the change; `None` if the server omitted it.
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub timestamp: Option<TimestampMs>,
}

/// joined / left / ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantEvent {
    #[serde(default, alias = "eventId", deserialize_with = "de_opt_id")]
    pub room_id: Option<String>,
    #[serde(default, alias = "userId", alias = "playerId", deserialize_with = "de_opt_id")]
    pub participant_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A score or a guess was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEvent {
    #[serde(default, alias = "eventId", deserialize_with = "de_opt_id")]
    pub room_id: Option<String>,
    #[serde(default, alias = "userId", alias = "playerId", deserialize_with = "de_opt_id")]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub wine_number: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStarted {
    #[serde(default, alias = "eventId", deserialize_with = "de_opt_id")]
    pub room_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    ConnectionStatus(ConnectionStatusPayload),
    PointerChanged(PointerChanged),
    ParticipantJoined(ParticipantEvent),
    ParticipantLeft(ParticipantEvent),
    ParticipantReady(ParticipantEvent),
    ScoreSubmitted(SubmissionEvent),
    GuessSubmitted(SubmissionEvent),
    EventStarted(EventStarted),
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
            PushEvent::PointerChanged(_) => EventKind::PointerChanged,
            PushEvent::ParticipantJoined(_) => EventKind::ParticipantJoined,
            PushEvent::ParticipantLeft(_) => EventKind::ParticipantLeft,
            PushEvent::ParticipantReady(_) => EventKind::ParticipantReady,
            PushEvent::ScoreSubmitted(_) => EventKind::ScoreSubmitted,
            PushEvent::GuessSubmitted(_) => EventKind::GuessSubmitted,
            PushEvent::EventStarted(_) => EventKind::EventStarted,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            PushEvent::ConnectionStatus(_) => None,
            PushEvent::PointerChanged(p) => Some(&p.room_id),
            PushEvent::ParticipantJoined(p)
            | PushEvent::ParticipantLeft(p)
            | PushEvent::ParticipantReady(p) => p.room_id.as_deref(),
            PushEvent::ScoreSubmitted(s) | PushEvent::GuessSubmitted(s) => s.room_id.as_deref(),
            PushEvent::EventStarted(e) => e.room_id.as_deref(),
        }
    }

    /// Events without a room id are broadcast to every room.
    pub fn is_for_room(&self, room_id: &str) -> bool {
        self.room_id().map_or(true, |r| r == room_id)
    }

    /// Decode a server text frame. Unknown event names yield `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<PushEvent>> {
        let frame: WireFrame = serde_json::from_str(text)?;
        let Some(kind) = EventKind::from_wire(&frame.event) else {
            return Ok(None);
        };

        let data = frame.data;
        let event = match kind {
            EventKind::ConnectionStatus => {
                PushEvent::ConnectionStatus(serde_json::from_value(data)?)
            }
            EventKind::PointerChanged => PushEvent::PointerChanged(serde_json::from_value(data)?),
            EventKind::ParticipantJoined => {
                PushEvent::ParticipantJoined(serde_json::from_value(data)?)
            }
            EventKind::ParticipantLeft => PushEvent::ParticipantLeft(serde_json::from_value(data)?),
            EventKind::ParticipantReady => {
                PushEvent::ParticipantReady(serde_json::from_value(data)?)
            }
            EventKind::ScoreSubmitted => PushEvent::ScoreSubmitted(serde_json::from_value(data)?),
            EventKind::GuessSubmitted => PushEvent::GuessSubmitted(serde_json::from_value(data)?),
            EventKind::EventStarted => PushEvent::EventStarted(serde_json::from_value(data)?),
        };
        Ok(Some(event))
    }

    pub fn as_pointer_changed(&self) -> Option<&PointerChanged> {
        match self {
            PushEvent::PointerChanged(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_participant_joined(&self) -> Option<&ParticipantEvent> {
        match self {
            PushEvent::ParticipantJoined(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_participant_left(&self) -> Option<&ParticipantEvent> {
        match self {
            PushEvent::ParticipantLeft(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_participant_ready(&self) -> Option<&ParticipantEvent> {
        match self {
            PushEvent::ParticipantReady(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_score_submitted(&self) -> Option<&SubmissionEvent> {
        match self {
            PushEvent::ScoreSubmitted(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_guess_submitted(&self) -> Option<&SubmissionEvent> {
        match self {
            PushEvent::GuessSubmitted(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_event_started(&self) -> Option<&EventStarted> {
        match self {
            PushEvent::EventStarted(e) => Some(e),
            _ => None,
        }
    }
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.wire_name()), Some(kind));
        }
        assert_eq!(
            EventKind::from_wire("pointer-changed"),
            Some(EventKind::PointerChanged)
        );
        assert_eq!(EventKind::from_wire("chat-message"), None);
    }

    #[test]
    fn test_decode_pointer_changed() {
        let text = json!({
            "event": "wine-changed",
            "data": {"eventId": 42, "wineNumber": 5, "timestamp": "2025-03-01T19:04:11.200Z"}
        })
        .to_string();

        let event = PushEvent::decode(&text).unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::PointerChanged);
        let p = event.as_pointer_changed().unwrap();
        assert_eq!(p.room_id, "42");
        assert_eq!(p.wine_number, 5);
        assert_eq!(p.timestamp, Some(1_740_855_851_200));
    }

    #[test]
    fn test_decode_pointer_changed_without_timestamp() {
        let text = r#"{"event":"pointer-changed","data":{"roomId":"event-42","pointer":2}}"#;
        let event = PushEvent::decode(text).unwrap().unwrap();
        let p = event.as_pointer_changed().unwrap();
        assert_eq!(p.room_id, "event-42");
        assert_eq!(p.wine_number, 2);
        assert_eq!(p.timestamp, None);
    }

    #[test]
    fn test_decode_keeps_extra_fields() {
        let text = json!({
            "event": "score-submitted",
            "data": {"eventId": "e1", "userId": 7, "wineNumber": 3, "score": 88}
        })
        .to_string();

        let event = PushEvent::decode(&text).unwrap().unwrap();
        let s = event.as_score_submitted().unwrap();
        assert_eq!(s.room_id.as_deref(), Some("e1"));
        assert_eq!(s.participant_id.as_deref(), Some("7"));
        assert_eq!(s.wine_number, Some(3));
        assert_eq!(s.extra["score"], 88);
    }

    #[test]
    fn test_decode_unknown_event_is_none() {
        let text = r#"{"event":"chat-message","data":{"text":"cheers"}}"#;
        assert!(PushEvent::decode(text).unwrap().is_none());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(PushEvent::decode("not json").is_err());
        // pointer-changed without a pointer is rejected
        let text = r#"{"event":"wine-changed","data":{"roomId":"e1"}}"#;
        assert!(PushEvent::decode(text).is_err());
    }

    #[test]
    fn test_room_filter() {
        let event = PushEvent::decode(
            r#"{"event":"participant-ready","data":{"roomId":"e1","userId":"u1"}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(event.is_for_room("e1"));
        assert!(!event.is_for_room("e2"));

        let broadcast = PushEvent::decode(r#"{"event":"event-started","data":{}}"#)
            .unwrap()
            .unwrap();
        assert!(broadcast.is_for_room("anything"));
    }

    #[test]
    fn test_client_frame_encoding() {
        let frame = ClientFrame::JoinRoom {
            room_id: "event-42".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "join-room", "data": {"roomId": "event-42"}}));
    }
}
