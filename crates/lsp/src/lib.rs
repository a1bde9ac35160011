//! Editor-side language server client engine.
//!
//! The crate is layered bottom-up:
//!
//! - [`transport`] turns a [`config::ServerConfig`] into a byte stream
//!   (spawned subprocess over stdio, or a TCP socket in either direction).
//! - [`rpc`] runs the JSON-RPC 2.0 loop over one transport: request
//!   correlation, cancellation, write ordering.
//! - [`session`] drives one server's lifecycle (handshake, capability
//!   gating, document sync, shutdown).
//! - [`manager`] routes documents to sessions by selector match, fans
//!   requests out across them, and owns crash recovery.
//! - [`diagnostics`] merges published diagnostics across sessions per
//!   document.
//!
//! Everything above the transport is ordinary async Rust on tokio; no
//! session ever blocks another.

use std::io;
use std::path::Path;

use lsp_types::Uri;

pub mod capabilities;
pub mod config;
pub mod diagnostics;
pub mod manager;
mod message;
pub mod monitor;
pub mod rpc;
pub mod session;
pub mod transport;
mod types;

pub use capabilities::{SyncKind, has_capability};
pub use config::{Selector, ServerConfig, Timeouts, TransportMode};
pub use diagnostics::{DiagnosticsEvent, DiagnosticsStore};
pub use manager::{DocumentProvider, EditorEvent, SessionManager};
pub use monitor::{Backoff, RestartPolicy};
pub use rpc::{CancelToken, RpcClient, RpcEvent};
pub use session::{Session, SessionId, SessionState};
pub use session::buffer::{ChangePayload, DocumentEdit};
pub use types::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, RequestId, ResponseError};

/// Errors surfaced by every layer of the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The session's transport is gone; the request never got an answer.
	#[error("session terminated")]
	SessionTerminated,
	/// The request was cancelled locally before a response arrived.
	#[error("request cancelled")]
	Cancelled,
	/// The request exceeded its budget and was cancelled on the server.
	#[error("request timed out: {0}")]
	RequestTimeout(String),
	/// The server answered with a JSON-RPC error object.
	#[error("server error: {0}")]
	Response(#[from] ResponseError),
	/// The server does not advertise the capability this request needs.
	#[error("server does not support {0}")]
	CapabilityUnavailable(String),
	/// The session has not completed its handshake (or is shutting down).
	#[error("session is not ready")]
	NotReady,
	/// No configuration carries this server name.
	#[error("no configured server named {0}")]
	UnknownServer(String),
	/// The session crashed too often and will not be restarted.
	#[error("server crashed {attempts} times, giving up")]
	CrashLoop {
		/// Crashes observed within the restart window.
		attempts: u32,
	},
	/// A frame violated the base protocol (headers, envelope shape).
	#[error("protocol violation: {0}")]
	Protocol(String),
	/// A payload failed to (de)serialize.
	#[error("deserialization failed: {0}")]
	Deserialize(#[from] serde_json::Error),
	#[error(transparent)]
	Io(#[from] io::Error),
	/// The server process could not be started.
	#[error("failed to spawn {command}: {reason}")]
	Spawn { command: String, reason: String },
	/// A socket transport could not be established.
	#[error("failed to connect to {addr}: {reason}")]
	Connect { addr: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Convert an absolute filesystem path into a `file://` URI.
///
/// Relative paths are rejected; there is no base to resolve them against.
pub fn uri_from_path(path: &Path) -> Result<Uri> {
	let url = url::Url::from_file_path(path).map_err(|()| Error::Protocol(format!("not an absolute path: {}", path.display())))?;
	url.as_str().parse::<Uri>().map_err(|e| Error::Protocol(format!("invalid file uri {url}: {e}")))
}

/// The scheme of a URI, defaulting to `file` when absent.
pub fn uri_scheme(uri: &Uri) -> &str {
	uri.scheme().map(|s| s.as_str()).unwrap_or("file")
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	#[test]
	fn plain_paths_pass_through() {
		let uri = uri_from_path(&PathBuf::from("/home/user/project/main.rs")).expect("uri");
		assert_eq!(uri.as_str(), "file:///home/user/project/main.rs");
	}

	#[test]
	fn reserved_characters_are_escaped() {
		let uri = uri_from_path(&PathBuf::from("/tmp/a b/100%/x.rs")).expect("uri");
		assert_eq!(uri.as_str(), "file:///tmp/a%20b/100%25/x.rs");
	}

	#[test]
	fn relative_paths_are_rejected() {
		match uri_from_path(&PathBuf::from("relative dir/x.rs")) {
			Err(Error::Protocol(msg)) => assert!(msg.contains("not an absolute path")),
			other => panic!("expected protocol error, got {other:?}"),
		}
	}

	#[test]
	fn scheme_defaults_to_file() {
		let uri: Uri = "file:///x.rs".parse().expect("uri");
		assert_eq!(uri_scheme(&uri), "file");
		let untitled: Uri = "untitled:Untitled-1".parse().expect("uri");
		assert_eq!(uri_scheme(&untitled), "untitled");
	}
}
