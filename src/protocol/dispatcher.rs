//! Request dispatch: verb and path in, queue operation, response out.

use std::net::SocketAddr;

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::listener::Delivery;
use crate::manager::ManagedQueue;
use crate::message::{Message, DEFAULT_CONTENT_TYPE};
use crate::metrics::RequestMetrics;
use crate::queue::{GrabOutcome, QueueStats};
use crate::server::AppState;
use crate::storage::MessageId;

use super::headers;
use super::verb::Verb;

/// Fallback handler serving every queue path.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    let (label, mut response) = match Verb::resolve(request.method(), request.uri()) {
        Ok(verb) => {
            let response = handle(&state, verb, &path, request)
                .await
                .unwrap_or_else(|e| e.into_response());
            (verb.as_str(), response)
        }
        Err(e) => ("UNSUPPORTED", BrokerError::from(e).into_response()),
    };

    if let Ok(value) = HeaderValue::from_str(&state.settings.server.server_header) {
        response.headers_mut().insert(headers::SERVER, value);
    }

    let status = response.status().as_u16();
    RequestMetrics::record(label, status);
    tracing::debug!(verb = %label, path = %path, status = status, "Response");

    response
}

async fn handle(state: &AppState, verb: Verb, path: &str, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();

    match verb {
        Verb::Get => poll(state, path, &parts).await,
        Verb::Post => put(state, path, &parts, body).await,
        Verb::Head => {
            let stats = state.manager.stats(path).await?;
            Ok(stats_response(StatusCode::OK, Some(stats)))
        }
        Verb::Delete => {
            state.manager.delete_queue(path)?;
            Ok(StatusCode::OK.into_response())
        }
        Verb::Clear => {
            state.manager.clear_queue(path).await?;
            Ok(StatusCode::OK.into_response())
        }
        Verb::Peek => peek(state, path, &parts).await,
        Verb::PeekGrab => peek_grab(state, path, &parts).await,
    }
}

fn listener(parts: &Parts) -> Result<Option<SocketAddr>> {
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    headers::listener_addr(&parts.headers, peer).map_err(BrokerError::BadRequest)
}

/// Statistics for a response whose operation already took effect.
///
/// The message was delivered or stored by then, so a failure here only drops
/// the stats headers.
async fn stats_after(queue: &ManagedQueue) -> Option<QueueStats> {
    match queue.queue().stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(queue = %queue.queue().name(), error = %e, "Failed to read queue statistics");
            None
        }
    }
}

async fn poll(state: &AppState, path: &str, parts: &Parts) -> Result<Response> {
    let listener = listener(parts)?;
    let queue = state.manager.queue(path)?;
    let delivery = queue.poll(listener).await?;
    let stats = stats_after(&queue).await;

    Ok(match delivery {
        Delivery::Message(message) => message_response(message, stats),
        Delivery::Empty => stats_response(StatusCode::NO_CONTENT, stats),
        Delivery::Pending => StatusCode::ACCEPTED.into_response(),
    })
}

async fn put(state: &AppState, path: &str, parts: &Parts, body: Body) -> Result<Response> {
    let payload = to_bytes(body, state.settings.server.max_body_bytes)
        .await
        .map_err(|e| BrokerError::BadRequest(format!("Failed to read request body: {}", e)))?;

    let content_type = headers::header_str(&parts.headers, header::CONTENT_TYPE.as_str())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let message = Message::new(Vec::from(payload), content_type)
        .with_options(headers::harvest_options(&parts.headers));

    let queue = state.manager.queue_for_put(path).await?;
    let id = queue.put(message).await?;
    let stats = stats_after(&queue).await;

    let mut response = stats_response(StatusCode::OK, stats);
    response
        .headers_mut()
        .insert(headers::FMQ_MESSAGE, HeaderValue::from(id.value()));
    Ok(response)
}

async fn peek(state: &AppState, path: &str, parts: &Parts) -> Result<Response> {
    let session_id = match headers::header_str(&parts.headers, headers::FMQ_QUEUE_SESSION) {
        Some(session) => session.to_string(),
        None => Uuid::new_v4().simple().to_string(),
    };
    let session_value = HeaderValue::from_str(&session_id)
        .map_err(|_| BrokerError::BadRequest(format!("Invalid session id '{}'", session_id)))?;

    let listener = listener(parts)?;
    let queue = state.manager.queue(path)?;
    let delivery = queue.peek(&session_id, listener).await?;
    let stats = stats_after(&queue).await;

    let mut response = match delivery {
        Delivery::Message(peeked) => {
            let mut response = message_response(peeked.message, stats);
            response
                .headers_mut()
                .insert(headers::FMQ_MESSAGE, HeaderValue::from(peeked.id.value()));
            response
        }
        Delivery::Empty => stats_response(StatusCode::NO_CONTENT, stats),
        Delivery::Pending => StatusCode::ACCEPTED.into_response(),
    };
    response
        .headers_mut()
        .insert(headers::FMQ_QUEUE_SESSION, session_value);
    Ok(response)
}

async fn peek_grab(state: &AppState, path: &str, parts: &Parts) -> Result<Response> {
    let session_id = headers::header_str(&parts.headers, headers::FMQ_QUEUE_SESSION).unwrap_or("");
    let raw_id = headers::header_str(&parts.headers, headers::FMQ_GRAB_MESSAGE)
        .ok_or_else(|| BrokerError::BadRequest("FMQ_GRAB_MESSAGE header is required".to_string()))?;
    let id: MessageId = raw_id
        .parse()
        .map_err(|_| BrokerError::BadRequest(format!("Invalid message id '{}'", raw_id)))?;

    Ok(match state.manager.peek_grab(path, session_id, id).await? {
        GrabOutcome::Grabbed => StatusCode::OK.into_response(),
        GrabOutcome::Nothing => StatusCode::NO_CONTENT.into_response(),
    })
}

fn stats_response(status: StatusCode, stats: Option<QueueStats>) -> Response {
    let mut header_map = HeaderMap::new();
    if let Some(stats) = stats {
        headers::insert_stats(&mut header_map, stats);
    }
    (status, header_map).into_response()
}

fn message_response(message: Message, stats: Option<QueueStats>) -> Response {
    let mut header_map = HeaderMap::new();
    headers::insert_message_headers(&mut header_map, &message);
    if let Some(stats) = stats {
        headers::insert_stats(&mut header_map, stats);
    }
    (StatusCode::OK, header_map, message.payload).into_response()
}
