//! Header names used by the queue protocol and message option mapping.
//!
//! HTTP header names are case-insensitive and carried lowercase, so
//! `QUEUE_SIZE` on the wire is `queue_size` here.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::message::Message;
use crate::queue::QueueStats;

pub const SERVER: &str = "server";
pub const QUEUE_SIZE: &str = "queue_size";
pub const QUEUE_BYTES: &str = "queue_bytes";
pub const ERROR: &str = "error";
pub const FMQ_QUEUE_SESSION: &str = "fmq_queue_session";
pub const FMQ_MESSAGE: &str = "fmq_message";
pub const FMQ_GRAB_MESSAGE: &str = "fmq_grab_message";
pub const LISTENER_HOST: &str = "listener_host";
pub const LISTENER_PORT: &str = "listener_port";

/// Prefix of option headers, in both the underscore and dash spelling.
const OPTION_PREFIXES: [&str; 2] = ["message_", "message-"];

/// Collect `MESSAGE_<name>` request headers as message options.
///
/// `<name>` must start with a letter and continue with letters, digits,
/// `_` or `-`. Values that are not valid UTF-8 are skipped.
pub fn harvest_options(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    for (name, value) in headers {
        let Some(option) = OPTION_PREFIXES
            .iter()
            .find_map(|prefix| name.as_str().strip_prefix(prefix))
        else {
            continue;
        };
        if !is_option_name(option) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            options.insert(option.to_string(), value.to_string());
        }
    }
    options
}

fn is_option_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Response header name for an option: `MESSAGE_<NAME>` with `-` as `_`.
pub fn option_header_name(option: &str) -> Option<HeaderName> {
    let name = format!("message_{}", option.replace('-', "_")).to_ascii_lowercase();
    HeaderName::try_from(name).ok()
}

/// Write the content type and every option of `message`.
pub fn insert_message_headers(headers: &mut HeaderMap, message: &Message) {
    if let Ok(value) = HeaderValue::from_str(&message.content_type) {
        headers.insert(axum::http::header::CONTENT_TYPE, value);
    }

    for (option, value) in &message.options {
        let (Some(name), Ok(value)) = (option_header_name(option), HeaderValue::from_str(value))
        else {
            tracing::debug!(option = %option, "Skipping option not representable as header");
            continue;
        };
        headers.insert(name, value);
    }
}

pub fn insert_stats(headers: &mut HeaderMap, stats: QueueStats) {
    headers.insert(QUEUE_SIZE, HeaderValue::from(stats.size));
    headers.insert(QUEUE_BYTES, HeaderValue::from(stats.bytes));
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Callback address from `LISTENER_PORT` and optional `LISTENER_HOST`.
///
/// The host defaults to the peer's address. No port means no registration.
pub fn listener_addr(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> Result<Option<SocketAddr>, String> {
    let Some(port) = header_str(headers, LISTENER_PORT) else {
        return Ok(None);
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("Invalid LISTENER_PORT '{}'", port))?;

    let ip = match header_str(headers, LISTENER_HOST) {
        Some(host) => host
            .parse::<IpAddr>()
            .map_err(|_| format!("Invalid LISTENER_HOST '{}'", host))?,
        None => peer.ok_or_else(|| "LISTENER_HOST required, peer address unknown".to_string())?,
    };

    Ok(Some(SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_harvest_options() {
        let map = headers(&[
            ("message_priority", "high"),
            ("message-trace-id", "abc"),
            ("message_9bad", "skip"),
            ("content-type", "text/plain"),
        ]);

        let options = harvest_options(&map);
        assert_eq!(options.len(), 2);
        assert_eq!(options["priority"], "high");
        assert_eq!(options["trace-id"], "abc");
    }

    #[test]
    fn test_message_headers_echo_options() {
        let message = Message::new("x", "text/plain")
            .with_option("trace-id", "abc")
            .with_option("Priority", "high");

        let mut map = HeaderMap::new();
        insert_message_headers(&mut map, &message);

        assert_eq!(map["content-type"], "text/plain");
        assert_eq!(map["message_trace_id"], "abc");
        assert_eq!(map["message_priority"], "high");
    }

    #[test]
    fn test_listener_addr() {
        let peer: IpAddr = "10.0.0.7".parse().unwrap();

        assert_eq!(listener_addr(&HeaderMap::new(), Some(peer)).unwrap(), None);

        let map = headers(&[("listener_port", "8123")]);
        assert_eq!(
            listener_addr(&map, Some(peer)).unwrap(),
            Some(SocketAddr::new(peer, 8123))
        );

        let map = headers(&[("listener_port", "8123"), ("listener_host", "127.0.0.1")]);
        assert_eq!(
            listener_addr(&map, Some(peer)).unwrap(),
            Some("127.0.0.1:8123".parse().unwrap())
        );

        let map = headers(&[("listener_port", "not-a-port")]);
        assert!(listener_addr(&map, Some(peer)).is_err());
        let map = headers(&[("listener_port", "8123")]);
        assert!(listener_addr(&map, None).is_err());
    }
}
