//! Normalised error shape for every remote call.
//!
//! The service answers failures in several shapes (a flat error object, a
//! field-validation array, or nothing at all when the network is down).
//! [`ClientError::from_response`] folds all of them into one [`ClientError`].

use std::fmt;

use serde::Deserialize;

/// Failure classes the transport distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The remote could not be reached (DNS, connect, reset).
    Network,
    /// The request timed out locally, or the remote answered 408.
    Timeout,
    /// 401: the stored credential was rejected and has been cleared.
    AuthRejected,
    /// Any other 4xx.
    ClientError,
    /// 5xx.
    ServerError,
    /// 429.
    RateLimited,
    /// A 2xx body that could not be decoded.
    Decode,
}

impl ErrorKind {
    /// Whether the transport should retry a request that failed this way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::ServerError | Self::RateLimited
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::AuthRejected,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::AuthRejected => "auth_rejected",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// One error shape for every failed call, whatever the remote returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct ClientError {
    pub kind: ErrorKind,
    /// HTTP status, absent for network failures.
    pub status: Option<u16>,
    pub message: String,
    /// Machine-readable code from the remote, when provided.
    pub code: Option<String>,
    /// Structured detail (e.g. field validation entries).
    pub details: Option<serde_json::Value>,
    /// Correlation id, from the response or the one this client sent.
    pub request_id: Option<String>,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            code: None,
            details: None,
            request_id: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, message)
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if self.request_id.is_none() {
            self.request_id = request_id;
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_auth_rejected(&self) -> bool {
        self.kind == ErrorKind::AuthRejected
    }

    /// Build the normalised error for a non-success response.
    pub fn from_response(status: u16, body: &[u8], request_id: Option<String>) -> Self {
        let kind = ErrorKind::from_status(status);
        let parsed = serde_json::from_slice::<ErrorBody>(body).ok();

        let (message, code, details, body_request_id) = match parsed {
            Some(ErrorBody::FieldErrors { detail }) => {
                let message = detail
                    .iter()
                    .map(FieldError::describe)
                    .collect::<Vec<_>>()
                    .join("; ");
                let details = serde_json::to_value(
                    detail
                        .iter()
                        .map(|d| {
                            serde_json::json!({
                                "field": d.field_path(),
                                "message": d.msg,
                                "type": d.kind,
                            })
                        })
                        .collect::<Vec<_>>(),
                )
                .ok();
                (message, Some("validation_error".to_string()), details, None)
            }
            Some(ErrorBody::Flat(flat)) => {
                let nested = flat.nested();
                let message = [&flat.message, &flat.error, &flat.detail]
                    .into_iter()
                    .find_map(|v| v.as_ref().and_then(text))
                    .or_else(|| {
                        nested
                            .and_then(|n| n.get("message").or(n.get("msg")))
                            .and_then(text)
                    });
                let code = flat
                    .code
                    .as_ref()
                    .and_then(scalar)
                    .or_else(|| nested.and_then(|n| n.get("code")).and_then(scalar));
                let details = flat
                    .details
                    .clone()
                    .or_else(|| nested.map(|n| serde_json::Value::Object(n.clone())));
                (
                    message.unwrap_or_else(|| default_message(status)),
                    code,
                    details,
                    flat.request_id.as_ref().and_then(scalar),
                )
            }
            None => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                let message = if text.is_empty() || text.len() > 512 {
                    default_message(status)
                } else {
                    text
                };
                (message, None, None, None)
            }
        };

        Self {
            kind,
            status: Some(status),
            message,
            code,
            details,
            request_id: body_request_id.or(request_id),
        }
    }
}

fn default_message(status: u16) -> String {
    match ErrorKind::from_status(status) {
        ErrorKind::AuthRejected => "Session expired, please log in again".to_string(),
        ErrorKind::RateLimited => "Too many requests".to_string(),
        ErrorKind::ServerError => format!("Service unavailable (HTTP {status})"),
        _ => format!("Request failed with HTTP {status}"),
    }
}

// ---- wire shapes ----

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    /// `{"detail": [{"loc": [...], "msg": "...", "type": "..."}]}`
    FieldErrors { detail: Vec<FieldError> },
    /// `{"message"|"error"|"detail": "...", "code": ..., ...}`
    Flat(FlatError),
}

/// Fields are loosely typed: `code` may be numeric and `detail` or `error`
/// may be an object carrying its own `message` and `code`.
#[derive(Debug, Deserialize)]
struct FlatError {
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    details: Option<serde_json::Value>,
    #[serde(default)]
    request_id: Option<serde_json::Value>,
}

impl FlatError {
    /// The first of `detail` or `error` that is an object.
    fn nested(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        [&self.detail, &self.error]
            .into_iter()
            .find_map(|v| v.as_ref().and_then(serde_json::Value::as_object))
    }
}

fn text(value: &serde_json::Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Strings as-is, numbers and booleans rendered; anything else is dropped.
fn scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct FieldError {
    #[serde(default)]
    loc: Vec<serde_json::Value>,
    msg: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl FieldError {
    /// Dotted field path without the leading `body` segment.
    fn field_path(&self) -> String {
        self.loc
            .iter()
            .filter_map(|segment| match segment {
                serde_json::Value::String(s) if s == "body" => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    fn describe(&self) -> String {
        let path = self.field_path();
        if path.is_empty() {
            self.msg.clone()
        } else {
            format!("{path}: {}", self.msg)
        }
    }
}
