use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::manager::ManagerError;
use crate::metrics::RequestMetrics;
use crate::protocol::headers;
use crate::protocol::UnsupportedVerb;
use crate::queue::QueueError;

/// Errors surfaced at the protocol boundary.
///
/// Every variant becomes a client error response; none is allowed to escape
/// as a failed connection.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    UnsupportedVerb(#[from] UnsupportedVerb),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl From<QueueError> for BrokerError {
    fn from(e: QueueError) -> Self {
        BrokerError::Manager(ManagerError::Queue(e))
    }
}

impl BrokerError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::UnsupportedVerb(_) => "unsupported_verb",
            BrokerError::BadRequest(_) => "bad_request",
            BrokerError::Manager(e) => match e {
                ManagerError::QueueNotFound(_) => "queue_not_found",
                ManagerError::QueueExists(_) => "queue_exists",
                ManagerError::InvalidQueuePath { .. } => "invalid_path",
                ManagerError::Backend(_) | ManagerError::Database(_) => "backend",
                ManagerError::Queue(q) => match q {
                    QueueError::QueueFull { .. } => "queue_full",
                    QueueError::PeekUnsupported { .. } => "peek_unsupported",
                    QueueError::Backend(_) => "backend",
                },
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::Manager(ManagerError::Queue(QueueError::QueueFull { .. })) => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = self.to_string();

        tracing::warn!(
            kind = %kind,
            status = %status.as_u16(),
            message = %message,
            "Client error"
        );
        RequestMetrics::record_client_error(kind);

        let mut header_map = HeaderMap::new();
        // Not every message is a valid header value
        let value = HeaderValue::from_str(&message)
            .unwrap_or_else(|_| HeaderValue::from_static("Request failed"));
        header_map.insert(headers::ERROR, value);

        if let BrokerError::Manager(ManagerError::Queue(QueueError::QueueFull { stats, .. })) =
            &self
        {
            headers::insert_stats(&mut header_map, *stats);
        }

        (status, header_map).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStats;

    #[test]
    fn test_client_errors_are_400_with_error_header() {
        let response = BrokerError::UnsupportedVerb(UnsupportedVerb("PATCH".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["error"], "Method is not supported 'PATCH'");

        let response =
            BrokerError::Manager(ManagerError::QueueNotFound("/missing".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["error"], "Queue '/missing' does not exist");
    }

    #[test]
    fn test_queue_full_is_507_with_stats() {
        let err: BrokerError = QueueError::QueueFull {
            queue: "/q".into(),
            limit: "max_messages",
            max: 1,
            stats: QueueStats { size: 1, bytes: 4 },
        }
        .into();
        assert_eq!(err.kind(), "queue_full");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(response.headers()["queue_size"], "1");
        assert_eq!(response.headers()["queue_bytes"], "4");
        assert!(response.headers().contains_key("error"));
    }

    #[test]
    fn test_unrepresentable_message_falls_back() {
        let response = BrokerError::BadRequest("line\nbreak".into()).into_response();
        assert_eq!(response.headers()["error"], "Request failed");
    }
}
