//! JSON-RPC 2.0 envelope handling for inbound HTTP requests.
//!
//! The bridge never interprets methods or params. It only checks the
//! envelope shape, extracts the `id` used for correlation, and re-serializes
//! the request as one compact line for the child.

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Number, Value};

use crate::AppError;

/// Body is not valid JSON.
pub const PARSE_ERROR: i64 = -32_700;
/// Body is JSON but not a valid request object.
pub const INVALID_REQUEST: i64 = -32_600;
/// Bridge-side failure, including an unavailable child.
pub const INTERNAL_ERROR: i64 = -32_603;
/// No response from the child within the deadline.
pub const RESPONSE_TIMEOUT: i64 = -32_000;

/// Largest integer an IEEE double represents exactly (2^53).
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Correlation key for a JSON-RPC `id`.
///
/// Strings key by their JSON text and numbers by their numeric value, so
/// `1` and `"1"` are distinct while `1`, `1.0` and `1e0` are the same id,
/// so a child that echoes `1.0` back as `1` still matches. The id as
/// received is kept for echoing.
#[derive(Debug, Clone)]
pub struct RequestId {
    key: String,
    value: Value,
}

impl RequestId {
    /// Build a key from an `id` value.
    ///
    /// Returns `None` for anything but a string or number; `null` and
    /// structured values cannot correlate a response.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let key = match value {
            Value::String(_) => value.to_string(),
            Value::Number(number) => number_key(number),
            _ => return None,
        };
        Some(Self {
            key,
            value: value.clone(),
        })
    }

    /// The id as received, for echoing into error envelopes.
    #[must_use]
    pub fn to_value(&self) -> Value {
        self.value.clone()
    }

    /// Canonical correlation key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

/// Integral numbers key as plain integers; other numbers by shortest form.
#[allow(clippy::float_cmp)]
fn number_key(number: &Number) -> String {
    if let Some(int) = number.as_i64() {
        return int.to_string();
    }
    if let Some(uint) = number.as_u64() {
        return uint.to_string();
    }
    match number.as_f64() {
        Some(float) if float.trunc() == float && float.abs() < MAX_EXACT_INTEGER => {
            format!("{float:.0}")
        }
        Some(float) => float.to_string(),
        None => number.to_string(),
    }
}

impl PartialEq for RequestId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RequestId {}

impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self {
            key: id.to_string(),
            value: Value::from(id),
        }
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        let value = Value::from(id);
        Self {
            key: value.to_string(),
            value,
        }
    }
}

/// A validated request, ready to be written to the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Correlation id; `None` for notifications.
    pub id: Option<RequestId>,
    /// Method name, kept for logging.
    pub method: String,
    /// Compact single-line serialization of the request.
    pub line: String,
}

impl RpcRequest {
    /// Whether the child is expected to answer.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Validate a POST body as a JSON-RPC 2.0 request.
///
/// An absent or `null` id makes the request a notification.
///
/// # Errors
///
/// - [`AppError::Parse`] when the body is not JSON.
/// - [`AppError::InvalidRequest`] for batches, non-objects, a missing or
///   wrong `jsonrpc`, a non-string `method`, or an id that is neither a
///   string nor a number.
///
/// The returned [`RpcFailure`] echoes whatever usable id the body carried.
pub fn parse_request(body: &[u8]) -> Result<RpcRequest, RpcFailure> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| RpcFailure::new(AppError::Parse(err.to_string()), Value::Null))?;

    let obj = match &value {
        Value::Object(obj) => obj,
        Value::Array(_) => {
            return Err(RpcFailure::new(
                AppError::InvalidRequest("batch requests are not supported".into()),
                Value::Null,
            ))
        }
        _ => {
            return Err(RpcFailure::new(
                AppError::InvalidRequest("request must be a JSON object".into()),
                Value::Null,
            ))
        }
    };

    let raw_id = obj.get("id").unwrap_or(&Value::Null);
    let id = RequestId::from_value(raw_id);
    let echo = id.as_ref().map_or(Value::Null, RequestId::to_value);
    let invalid = |msg: &str| RpcFailure::new(AppError::InvalidRequest(msg.into()), echo.clone());

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(invalid("`jsonrpc` must be \"2.0\""));
    }

    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return Err(invalid("`method` must be a string"));
    };

    if id.is_none() && !raw_id.is_null() {
        return Err(invalid("`id` must be a string or a number"));
    }

    // serde_json escapes control characters, so the line has no raw newline.
    let line = serde_json::to_string(&value).map_err(|err| invalid(&err.to_string()))?;

    Ok(RpcRequest {
        id,
        method: method.to_owned(),
        line,
    })
}

/// Build a JSON-RPC error response envelope.
#[must_use]
pub fn error_envelope(id: &Value, code: i64, message: &str, data: Option<&str>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = Value::from(data);
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// A request that failed, with the id to echo back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    /// What went wrong.
    pub error: AppError,
    /// Id from the original request, or `null`.
    pub id: Value,
}

impl RpcFailure {
    /// Pair an error with the id it answers.
    #[must_use]
    pub fn new(error: AppError, id: Value) -> Self {
        Self { error, id }
    }

    /// HTTP status for this failure.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.error {
            AppError::Parse(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::DuplicateId(_) => StatusCode::CONFLICT,
            AppError::ChildUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::ResponseTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code for this failure.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self.error {
            AppError::Parse(_) => PARSE_ERROR,
            AppError::InvalidRequest(_) | AppError::DuplicateId(_) => INVALID_REQUEST,
            AppError::ResponseTimeout(_) => RESPONSE_TIMEOUT,
            _ => INTERNAL_ERROR,
        }
    }

    /// JSON-RPC error message for this failure.
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self.error {
            AppError::Parse(_) => "Parse error",
            AppError::InvalidRequest(_) => "Invalid Request",
            AppError::DuplicateId(_) => "Duplicate request id",
            AppError::ChildUnavailable(_) => "Child process unavailable",
            AppError::ResponseTimeout(_) => "Response timeout",
            _ => "Internal error",
        }
    }

    /// The full error envelope.
    #[must_use]
    pub fn envelope(&self) -> Value {
        let detail = self.error.to_string();
        error_envelope(&self.id, self.code(), self.message(), Some(&detail))
    }
}

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}
