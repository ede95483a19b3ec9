//! HTTP mapping of the queue protocol.
//!
//! The verb comes from the request method (or a POST's `_method` query
//! parameter), the queue from the path. Metadata travels in headers; see
//! [`headers`] for the names.

pub mod dispatcher;
pub mod headers;
pub mod verb;

pub use dispatcher::dispatch;
pub use verb::{UnsupportedVerb, Verb};
