use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Reconnection exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SyncError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => SyncError::Network(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Json(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(e: url::ParseError) -> Self {
        SyncError::Config(format!("invalid URL: {}", e))
    }
}

impl SyncError {
    /// HTTP-like status for this error, if it has one.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            SyncError::Http { status, .. } => StatusCode::from_u16(*status).ok(),
            SyncError::Network(_) => None,
            SyncError::Json(_) => Some(StatusCode::UNPROCESSABLE_ENTITY),
            SyncError::InvalidPayload(_) => Some(StatusCode::UNPROCESSABLE_ENTITY),
            SyncError::Config(_) => None,
            SyncError::Transport(_) => None,
            SyncError::NotConnected => Some(StatusCode::SERVICE_UNAVAILABLE),
            SyncError::ReconnectExhausted { .. } => Some(StatusCode::SERVICE_UNAVAILABLE),
        }
    }

    /// Transient failures are retried by the scheduler and the channel;
    /// everything else is reported once and the next tick proceeds normally.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Transport(_) | SyncError::NotConnected => true,
            SyncError::Http { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status >= 500
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_status_code() {
        let err = SyncError::Http {
            status: 404,
            message: "Event not found".to_string(),
        };
        assert_eq!(err.status_code(), Some(StatusCode::NOT_FOUND));
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "HTTP 404: Event not found");
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Network("reset".into()).is_transient());
        assert!(SyncError::Transport("closed".into()).is_transient());
        assert!(SyncError::Http {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(SyncError::Http {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!SyncError::Json("eof".into()).is_transient());
        assert!(!SyncError::ReconnectExhausted { attempts: 5 }.is_transient());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: SyncError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, SyncError::Json(_)));
    }
}
