use std::fmt;
use std::str::FromStr;

use axum::extract::Query;
use axum::http::{Method, Uri};
use serde::Deserialize;

/// Queue protocol verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Head,
    Delete,
    Clear,
    Peek,
    PeekGrab,
}

#[derive(Debug, thiserror::Error)]
#[error("Method is not supported '{0}'")]
pub struct UnsupportedVerb(pub String);

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Head => "HEAD",
            Verb::Delete => "DELETE",
            Verb::Clear => "CLEAR",
            Verb::Peek => "PEEK",
            Verb::PeekGrab => "PEEK_GRAB",
        }
    }

    /// Verb for a request. A POST may name another verb in its `_method`
    /// query parameter.
    pub fn resolve(method: &Method, uri: &Uri) -> Result<Self, UnsupportedVerb> {
        if method == Method::POST {
            if let Some(tunneled) = tunneled_method(uri) {
                return tunneled.parse();
            }
        }
        method.as_str().parse()
    }
}

#[derive(Deserialize)]
struct MethodOverride {
    #[serde(rename = "_method")]
    method: Option<String>,
}

fn tunneled_method(uri: &Uri) -> Option<String> {
    Query::<MethodOverride>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.method)
        .filter(|m| !m.is_empty())
}

impl FromStr for Verb {
    type Err = UnsupportedVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "HEAD" => Ok(Verb::Head),
            "DELETE" => Ok(Verb::Delete),
            "CLEAR" => Ok(Verb::Clear),
            "PEEK" => Ok(Verb::Peek),
            "PEEK_GRAB" => Ok(Verb::PeekGrab),
            _ => Err(UnsupportedVerb(s.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
