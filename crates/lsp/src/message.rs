//! `Content-Length`-framed JSON-RPC messages.
//!
//! The LSP base protocol frames every message as a MIME-style header block
//! terminated by a blank line, followed by exactly `Content-Length` bytes of
//! UTF-8 JSON. Header names are case-insensitive; unknown headers are
//! ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{AnyNotification, AnyRequest, AnyResponse, RequestId, ResponseError};
use crate::{Error, Result};

/// A complete JSON-RPC message in either direction.
#[derive(Debug, Clone)]
pub enum Message {
	/// A request carrying an id.
	Request(AnyRequest),
	/// A response to a request.
	Response(AnyResponse),
	/// A notification without an id.
	Notification(AnyNotification),
}

/// Wire shape used to classify incoming messages.
///
/// JSON-RPC distinguishes the three message kinds only by which members are
/// present, so everything is optional here and [`Message::classify`] sorts
/// it out.
#[derive(Deserialize)]
struct RawMessage {
	#[allow(dead_code)]
	jsonrpc: Option<String>,
	id: Option<RequestId>,
	method: Option<String>,
	#[serde(default)]
	params: JsonValue,
	#[serde(default, deserialize_with = "member_present")]
	result: Option<JsonValue>,
	error: Option<ResponseError>,
}

/// `None` only when the member is absent. A present `null` becomes
/// `Some(Value::Null)`, which matters for responses: `"result": null` is a
/// successful reply (`shutdown`, empty hover), not a malformed one.
fn member_present<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	JsonValue::deserialize(deserializer).map(Some)
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
	jsonrpc: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	id: Option<&'a RequestId>,
	#[serde(skip_serializing_if = "Option::is_none")]
	method: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	params: Option<&'a JsonValue>,
	#[serde(skip_serializing_if = "Option::is_none")]
	result: Option<&'a JsonValue>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<&'a ResponseError>,
}

impl Message {
	/// Read one framed message.
	///
	/// Returns `Ok(None)` on a clean EOF before any header byte.
	///
	/// # Errors
	///
	/// - [`Error::Protocol`] for malformed headers or a missing
	///   `Content-Length`.
	/// - [`Error::Deserialize`] when the payload is not valid JSON-RPC.
	/// - [`Error::Io`] for underlying stream failures, including EOF in the
	///   middle of a frame.
	pub async fn read(input: &mut (impl AsyncBufRead + Unpin)) -> Result<Option<Self>> {
		let mut content_length: Option<usize> = None;
		let mut line = String::new();
		let mut first = true;
		loop {
			line.clear();
			let read = input.read_line(&mut line).await?;
			if read == 0 {
				if first && content_length.is_none() {
					return Ok(None);
				}
				return Err(Error::Protocol("unexpected EOF inside frame headers".into()));
			}
			first = false;
			let trimmed = line.trim_end_matches(['\r', '\n']);
			if trimmed.is_empty() {
				break;
			}
			let Some((name, value)) = trimmed.split_once(':') else {
				return Err(Error::Protocol(format!("malformed header: {trimmed:?}")));
			};
			if name.trim().eq_ignore_ascii_case("content-length") {
				let len = value
					.trim()
					.parse::<usize>()
					.map_err(|_| Error::Protocol(format!("invalid Content-Length: {value:?}")))?;
				content_length = Some(len);
			}
		}

		let len = content_length.ok_or_else(|| Error::Protocol("missing Content-Length header".into()))?;
		let mut payload = vec![0u8; len];
		input.read_exact(&mut payload).await?;

		let raw: RawMessage = serde_json::from_slice(&payload)?;
		Self::classify(raw)
	}

	/// Write one framed message and flush.
	///
	/// The frame is serialized in full before any byte is written, so a
	/// single writer task never emits a partial frame.
	pub async fn write(&self, output: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
		let payload = serde_json::to_vec(&self.to_wire())?;
		let header = format!("Content-Length: {}\r\n\r\n", payload.len());
		output.write_all(header.as_bytes()).await?;
		output.write_all(&payload).await?;
		output.flush().await?;
		Ok(())
	}

	fn classify(raw: RawMessage) -> Result<Option<Self>> {
		match (raw.id, raw.method) {
			(Some(id), Some(method)) => Ok(Some(Self::Request(AnyRequest {
				id,
				method,
				params: raw.params,
			}))),
			(None, Some(method)) => Ok(Some(Self::Notification(AnyNotification {
				method,
				params: raw.params,
			}))),
			(Some(id), None) => {
				if raw.result.is_none() && raw.error.is_none() {
					return Err(Error::Protocol("response carries neither result nor error".into()));
				}
				Ok(Some(Self::Response(AnyResponse {
					id,
					result: raw.result,
					error: raw.error,
				})))
			}
			(None, None) => Err(Error::Protocol("message has neither id nor method".into())),
		}
	}

	fn to_wire(&self) -> OutgoingMessage<'_> {
		let mut out = OutgoingMessage {
			jsonrpc: "2.0",
			id: None,
			method: None,
			params: None,
			result: None,
			error: None,
		};
		match self {
			Self::Request(req) => {
				out.id = Some(&req.id);
				out.method = Some(&req.method);
				out.params = Some(&req.params);
			}
			Self::Notification(notif) => {
				out.method = Some(&notif.method);
				out.params = Some(&notif.params);
			}
			Self::Response(resp) => {
				out.id = Some(&resp.id);
				out.result = resp.result.as_ref();
				out.error = resp.error.as_ref();
			}
		}
		out
	}
}
