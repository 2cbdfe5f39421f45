use serde::{Deserialize, Serialize};

/// Event (room) identifier; the same string keys the REST path and the push room.
pub type EventId = String;

/// Milliseconds since the Unix epoch, as produced by [`now_ms`].
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// Parse a server timestamp that may be either epoch milliseconds or an
/// RFC 3339 string (`"2025-03-01T19:04:11.200Z"`).
pub fn parse_timestamp(value: &serde_json::Value) -> Option<TimestampMs> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// Passive projection of the push channel's lifecycle.
///
/// Only the channel driver writes this; pages observe it through
/// [`crate::realtime::RealtimeChannel::subscribe_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connection_id: Option<String>,
    pub last_error: Option<String>,
    /// Set once the bounded reconnect loop has given up. Cleared by the next
    /// successful `connect()`.
    #[serde(default)]
    pub reconnect_exhausted: bool,
}

/// The subset of an event resource the sync layer needs: the shared pointer.
///
/// The full payload is kept in `raw` for page components.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSnapshot {
    pub event_id: EventId,
    pub current_wine: u32,
    /// Server-side time of the last pointer change, when the API reports it.
    pub pointer_updated_at: Option<TimestampMs>,
    /// Local time the request behind this payload was issued. Set by the
    /// client; a cache hit carries the time of the original request.
    pub observed_at_ms: Option<TimestampMs>,
    pub raw: serde_json::Value,
}

impl EventSnapshot {
    /// Parse an event resource.
    ///
    /// Accepts `currentWineNumber` or `currentWine` for the pointer, `id` or
    /// `eventId` (string or number) for the identifier, and an optional
    /// `currentWineUpdatedAt`/`updatedAt` timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::InvalidPayload`] if the value is not an
    /// object or the pointer is missing.
    pub fn from_json(json: &serde_json::Value) -> crate::error::Result<Self> {
        use crate::error::SyncError;

        let obj = json
            .as_object()
            .ok_or_else(|| SyncError::InvalidPayload("expected event object".to_string()))?;

        let event_id = match obj.get("id").or_else(|| obj.get("eventId")) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(SyncError::InvalidPayload("event id missing".to_string())),
        };

        let current_wine = obj
            .get("currentWineNumber")
            .or_else(|| obj.get("currentWine"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SyncError::InvalidPayload("currentWineNumber missing".to_string()))?;
        let current_wine = u32::try_from(current_wine).map_err(|_| {
            SyncError::InvalidPayload(format!("currentWineNumber {} out of range", current_wine))
        })?;

        let pointer_updated_at = obj
            .get("currentWineUpdatedAt")
            .or_else(|| obj.get("updatedAt"))
            .and_then(parse_timestamp);

        Ok(EventSnapshot {
            event_id,
            current_wine,
            pointer_updated_at,
            observed_at_ms: None,
            raw: json.clone(),
        })
    }

    pub fn observed_at(mut self, at: TimestampMs) -> Self {
        self.observed_at_ms = Some(at);
        self
    }
}

/// Where the last applied pointer value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerSource {
    Poll,
    Push,
}

/// Versioned "current wine" pointer.
///
/// Poll responses and push events race each other; updates are ordered by
/// when they were observed, never by arrival. Two observations that both
/// carry a server `version` are compared on the server clock. Otherwise both
/// are compared on the local clock via `observed_at`, so server and client
/// times are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerState {
    pub value: u32,
    /// Server-side time of the change, when the server reported one.
    pub version: Option<TimestampMs>,
    /// Local time of the observation. For a poll this is when the request
    /// behind the payload was issued; for a push, when it arrived.
    pub observed_at: TimestampMs,
    pub source: PointerSource,
}

/// Outcome of offering a pointer observation to [`PointerState::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerUpdate {
    /// First observation or a newer, different value.
    Changed,
    /// Same value (possibly a newer version); nothing to re-fetch.
    Confirmed,
    /// Older than what has already been applied.
    Stale,
}

impl PointerState {
    pub fn new(value: u32, observed_at: TimestampMs, source: PointerSource) -> Self {
        PointerState {
            value,
            version: None,
            observed_at,
            source,
        }
    }

    pub fn with_version(mut self, version: Option<TimestampMs>) -> Self {
        self.version = version;
        self
    }

    /// A poll that ties with a push but disagrees on value loses: the push
    /// was emitted by the server after the poll was answered.
    fn is_older_than(&self, current: &PointerState) -> bool {
        let order = match (self.version, current.version) {
            (Some(mine), Some(theirs)) => mine.cmp(&theirs),
            _ => self.observed_at.cmp(&current.observed_at),
        };
        match order {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                self.value != current.value
                    && self.source == PointerSource::Poll
                    && current.source == PointerSource::Push
            }
        }
    }

    /// Reconcile `current` with an incoming observation, returning the state
    /// to keep and what happened.
    pub fn reconcile(
        current: Option<PointerState>,
        incoming: PointerState,
    ) -> (PointerState, PointerUpdate) {
        match current {
            None => (incoming, PointerUpdate::Changed),
            Some(cur) if incoming.is_older_than(&cur) => (cur, PointerUpdate::Stale),
            Some(cur) if incoming.value == cur.value => (
                PointerState {
                    version: cur.version.max(incoming.version),
                    observed_at: cur.observed_at.max(incoming.observed_at),
                    ..cur
                },
                PointerUpdate::Confirmed,
            ),
            Some(_) => (incoming, PointerUpdate::Changed),
        }
    }
}
