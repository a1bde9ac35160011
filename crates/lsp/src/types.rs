//! Raw JSON-RPC envelope types shared by the transport and RPC layers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A JSON-RPC request id.
///
/// Outgoing ids are always numbers; servers may echo back strings for their
/// own requests, so both forms are accepted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Numeric id.
	Number(i64),
	/// String id.
	String(String),
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Number(n) => write!(f, "{n}"),
			Self::String(s) => write!(f, "{s}"),
		}
	}
}

impl From<i64> for RequestId {
	fn from(n: i64) -> Self {
		Self::Number(n)
	}
}

/// A request, either client-to-server or server-initiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyRequest {
	/// Request id, unique per direction within one session.
	pub id: RequestId,
	/// LSP method name.
	pub method: String,
	/// Method parameters.
	#[serde(default)]
	pub params: JsonValue,
}

/// A notification in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyNotification {
	/// LSP method name.
	pub method: String,
	/// Method parameters.
	#[serde(default)]
	pub params: JsonValue,
}

/// A response to a previously issued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnyResponse {
	/// Id of the request being answered.
	pub id: RequestId,
	/// Successful result, mutually exclusive with `error`.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<JsonValue>,
	/// Server-reported failure.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ResponseError>,
}

/// JSON-RPC error codes used by this crate.
///
/// Only the codes we produce or special-case are listed; anything else is
/// passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i64);

impl ErrorCode {
	/// Invalid JSON was received.
	pub const PARSE_ERROR: Self = Self(-32700);
	/// The JSON is not a valid request object.
	pub const INVALID_REQUEST: Self = Self(-32600);
	/// The method does not exist or is unavailable.
	pub const METHOD_NOT_FOUND: Self = Self(-32601);
	/// Invalid method parameters.
	pub const INVALID_PARAMS: Self = Self(-32602);
	/// Internal JSON-RPC error.
	pub const INTERNAL_ERROR: Self = Self(-32603);
	/// The request was cancelled via `$/cancelRequest`.
	pub const REQUEST_CANCELLED: Self = Self(-32800);
	/// The document was modified since the request was issued.
	pub const CONTENT_MODIFIED: Self = Self(-32801);
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
	/// Machine-readable error code.
	pub code: i64,
	/// Human-readable description.
	pub message: String,
	/// Optional structured data.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	/// Create a new response error without data.
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code: code.0,
			message: message.into(),
			data: None,
		}
	}

	/// Standard reply for unknown server-initiated methods.
	pub fn method_not_found(method: &str) -> Self {
		Self::new(ErrorCode::METHOD_NOT_FOUND, format!("method not found: {method}"))
	}
}
