//! Error type shared by every Sluice crate, plus user-facing message shaping.

use serde::{Deserialize, Serialize};

use crate::TraceId;

/// Errors suitable for crossing the transport boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SluiceError {
    #[error("decode: {0}")]
    Decode(String),
    #[error("transport: {message}")]
    Transport { code: Option<u16>, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("unknown trace: {0}")]
    UnknownTrace(String),
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type SluiceResult<T> = Result<T, SluiceError>;

/// Shape an error for display: truncate to `max_chars` characters with an ellipsis and
/// append the trace id as a correlation token when known.
pub fn format_user_error(message: &str, trace_id: Option<&TraceId>, max_chars: usize) -> String {
    let mut out: String = if message.chars().count() > max_chars {
        let mut s: String = message.chars().take(max_chars).collect();
        s.push_str("...");
        s
    } else {
        message.to_string()
    };
    if let Some(id) = trace_id {
        out.push_str(" \nTrace ID: ");
        out.push_str(id.as_str());
    }
    out
}
