//! One running language server: lifecycle, capability gating, document sync.

pub mod buffer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lsp_types::notification::Notification as _;
use lsp_types::{ClientInfo, InitializeParams, InitializeResult, ServerCapabilities, Uri, WorkspaceFolder};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::capabilities::{client_capabilities, has_capability, negotiated_sync_kind};
use crate::config::ServerConfig;
use crate::rpc::{RpcClient, RpcEvent};
use crate::transport::Transport;
use crate::types::{AnyRequest, ResponseError};
use crate::{Error, Result, uri_from_path};

use buffer::{BufferState, ChangePayload};

/// Identity of one server instance. The generation distinguishes restarts of
/// the same configuration, so events from a dead instance can be told apart
/// from its replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
	name: Arc<str>,
	generation: u32,
}

impl SessionId {
	pub fn new(name: impl Into<Arc<str>>, generation: u32) -> Self {
		Self {
			name: name.into(),
			generation,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn generation(&self) -> u32 {
		self.generation
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.name, self.generation)
	}
}

/// Lifecycle of a session, observable through [`Session::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// Transport established, handshake not yet started.
	Starting,
	/// `initialize` is in flight.
	Initializing,
	/// Handshake complete; requests are accepted.
	Ready,
	/// `shutdown` was issued; no new requests are accepted.
	ShuttingDown,
	/// Terminated on our initiative.
	Stopped,
	/// The transport died without us asking.
	Crashed,
}

struct SessionInner {
	id: SessionId,
	config: Arc<ServerConfig>,
	rpc: RpcClient,
	state: watch::Sender<SessionState>,
	capabilities: tokio::sync::OnceCell<ServerCapabilities>,
	buffers: Mutex<HashMap<Uri, BufferState>>,
}

/// Handle to one running server. Cheap to clone; all clones drive the same
/// instance.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl Session {
	/// Wrap an established transport. The returned receiver carries server
	/// notifications, server-initiated requests, and the final
	/// [`RpcEvent::Closed`]; the caller must drain it.
	pub fn start(id: SessionId, config: Arc<ServerConfig>, transport: Transport) -> (Self, mpsc::UnboundedReceiver<RpcEvent>) {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let (rpc, _io) = RpcClient::spawn(transport, event_tx);
		let (state, _) = watch::channel(SessionState::Starting);
		let session = Self {
			inner: Arc::new(SessionInner {
				id,
				config,
				rpc,
				state,
				capabilities: tokio::sync::OnceCell::new(),
				buffers: Mutex::new(HashMap::new()),
			}),
		};
		(session, event_rx)
	}

	pub fn id(&self) -> &SessionId {
		&self.inner.id
	}

	pub fn config(&self) -> &Arc<ServerConfig> {
		&self.inner.config
	}

	pub fn state(&self) -> SessionState {
		*self.inner.state.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<SessionState> {
		self.inner.state.subscribe()
	}

	/// Negotiated capabilities; `None` until the handshake completes.
	pub fn capabilities(&self) -> Option<&ServerCapabilities> {
		self.inner.capabilities.get()
	}

	pub(crate) fn mark_crashed(&self) {
		self.inner.state.send_replace(SessionState::Crashed);
	}

	/// Run the `initialize`/`initialized` handshake.
	///
	/// On failure the session is marked [`SessionState::Crashed`] and the
	/// transport torn down.
	pub async fn initialize(&self) -> Result<InitializeResult> {
		self.inner.state.send_replace(SessionState::Initializing);
		match self.handshake().await {
			Ok(result) => {
				// The transport may have died between the handshake reply and
				// here; a crashed session must not come back as ready.
				let became_ready = self.inner.state.send_if_modified(|state| {
					if *state == SessionState::Initializing {
						*state = SessionState::Ready;
						true
					} else {
						false
					}
				});
				if !became_ready {
					warn!(session = %self.inner.id, "transport closed during handshake");
					return Err(Error::SessionTerminated);
				}
				debug!(session = %self.inner.id, "language server ready");
				Ok(result)
			}
			Err(e) => {
				warn!(session = %self.inner.id, error = %e, "initialize failed");
				self.inner.state.send_if_modified(|state| {
					if *state == SessionState::Initializing {
						*state = SessionState::Crashed;
						true
					} else {
						false
					}
				});
				self.inner.rpc.close();
				Err(e)
			}
		}
	}

	async fn handshake(&self) -> Result<InitializeResult> {
		let config = &self.inner.config;
		let root_uri = uri_from_path(&config.root_path).ok();
		#[allow(deprecated, reason = "root_path and root_uri still required by some servers")]
		let params = InitializeParams {
			process_id: Some(std::process::id()),
			workspace_folders: root_uri.clone().map(|uri| vec![workspace_folder_from_uri(uri)]),
			root_path: config.root_path.to_str().map(String::from),
			root_uri,
			initialization_options: config.initialization_options.clone(),
			capabilities: client_capabilities(),
			trace: None,
			client_info: Some(ClientInfo {
				name: String::from("quill"),
				version: Some(String::from(env!("CARGO_PKG_VERSION"))),
			}),
			locale: None,
			work_done_progress_params: Default::default(),
		};

		let result = self
			.inner
			.rpc
			.request::<lsp_types::request::Initialize>(params, Some(config.timeouts.initialize()))
			.await?;
		let _ = self.inner.capabilities.set(result.capabilities.clone());

		// `initialized` must precede any other traffic we produce; the
		// barrier pins everything that follows behind its write.
		let barrier = self.inner.rpc.notify_with_barrier::<lsp_types::notification::Initialized>(lsp_types::InitializedParams {})?;
		barrier.await.map_err(|_| Error::SessionTerminated)??;

		if let Some(settings) = &config.settings {
			self.inner
				.rpc
				.notify::<lsp_types::notification::DidChangeConfiguration>(lsp_types::DidChangeConfigurationParams {
					settings: settings.clone(),
				})?;
		}

		Ok(result)
	}

	fn ensure_ready(&self) -> Result<()> {
		match self.state() {
			SessionState::Ready => Ok(()),
			_ => Err(Error::NotReady),
		}
	}

	fn ensure_capability(&self, method: &str) -> Result<&ServerCapabilities> {
		let caps = self.inner.capabilities.get().ok_or(Error::NotReady)?;
		if has_capability(caps, method) {
			Ok(caps)
		} else {
			Err(Error::CapabilityUnavailable(method.to_string()))
		}
	}

	async fn request_gated<R: lsp_types::request::Request>(&self, params: R::Params) -> Result<R::Result> {
		self.ensure_ready()?;
		self.ensure_capability(R::METHOD)?;
		self.inner.rpc.request::<R>(params, self.inner.config.timeouts.request()).await
	}

	// ---- document synchronization -------------------------------------

	/// Attach a document. The sync strategy is fixed here from the server's
	/// capabilities and never revisited for this buffer.
	pub fn open_buffer(&self, uri: Uri, language_id: impl Into<String>, text: String) -> Result<()> {
		self.ensure_ready()?;
		let caps = self.inner.capabilities.get().ok_or(Error::NotReady)?;
		let language_id = language_id.into();
		let sync_kind = negotiated_sync_kind(caps);

		let state = BufferState::new(language_id.clone(), sync_kind);
		let version = state.version();
		self.inner.buffers.lock().insert(uri.clone(), state);

		if has_capability(caps, lsp_types::notification::DidOpenTextDocument::METHOD) {
			self.inner
				.rpc
				.notify::<lsp_types::notification::DidOpenTextDocument>(lsp_types::DidOpenTextDocumentParams {
					text_document: lsp_types::TextDocumentItem {
						uri,
						language_id,
						version,
						text,
					},
				})?;
		}
		Ok(())
	}

	/// Queue a change and flush it. Batches go on the wire one at a time;
	/// each write barrier releases the next batch, so versions observed by
	/// the server are strictly increasing.
	pub async fn notify_change(&self, uri: &Uri, payload: ChangePayload) -> Result<()> {
		{
			let mut buffers = self.inner.buffers.lock();
			let Some(buf) = buffers.get_mut(uri) else {
				warn!(session = %self.inner.id, uri = %uri.as_str(), "change for unknown buffer dropped");
				return Ok(());
			};
			if !buf.enqueue(payload) {
				return Ok(());
			}
		}
		self.flush_changes(uri).await
	}

	async fn flush_changes(&self, uri: &Uri) -> Result<()> {
		loop {
			let batch = {
				let mut buffers = self.inner.buffers.lock();
				match buffers.get_mut(uri) {
					Some(buf) => buf.next_batch(),
					None => return Ok(()),
				}
			};
			let Some(batch) = batch else { return Ok(()) };

			let barrier = self
				.inner
				.rpc
				.notify_with_barrier::<lsp_types::notification::DidChangeTextDocument>(lsp_types::DidChangeTextDocumentParams {
					text_document: lsp_types::VersionedTextDocumentIdentifier {
						uri: uri.clone(),
						version: batch.version,
					},
					content_changes: batch.changes,
				})?;
			let written = barrier.await.map_err(|_| Error::SessionTerminated)?;

			{
				let mut buffers = self.inner.buffers.lock();
				if let Some(buf) = buffers.get_mut(uri) {
					buf.acked();
				}
			}
			written?;
		}
	}

	pub fn will_save(&self, uri: Uri, reason: lsp_types::TextDocumentSaveReason) -> Result<()> {
		self.ensure_ready()?;
		if self.ensure_capability(lsp_types::notification::WillSaveTextDocument::METHOD).is_err() {
			return Ok(());
		}
		self.inner
			.rpc
			.notify::<lsp_types::notification::WillSaveTextDocument>(lsp_types::WillSaveTextDocumentParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				reason,
			})
	}

	/// `textDocument/willSaveWaitUntil` with a hard budget. A slow or silent
	/// server yields no edits rather than blocking the save.
	pub async fn will_save_wait_until(&self, uri: Uri, reason: lsp_types::TextDocumentSaveReason) -> Result<Vec<lsp_types::TextEdit>> {
		self.ensure_ready()?;
		if self.ensure_capability("textDocument/willSaveWaitUntil").is_err() {
			return Ok(Vec::new());
		}
		let budget = self.inner.config.timeouts.will_save_wait_until();
		let params = lsp_types::WillSaveTextDocumentParams {
			text_document: lsp_types::TextDocumentIdentifier { uri },
			reason,
		};
		match self
			.inner
			.rpc
			.request::<lsp_types::request::WillSaveWaitUntil>(params, Some(budget))
			.await
		{
			Ok(edits) => Ok(edits.unwrap_or_default()),
			Err(Error::RequestTimeout(_)) => {
				warn!(session = %self.inner.id, "willSaveWaitUntil overran its budget; saving without edits");
				Ok(Vec::new())
			}
			Err(e) => Err(e),
		}
	}

	pub fn did_save(&self, uri: Uri, text: Option<String>) -> Result<()> {
		self.ensure_ready()?;
		if self.ensure_capability(lsp_types::notification::DidSaveTextDocument::METHOD).is_err() {
			return Ok(());
		}
		self.inner
			.rpc
			.notify::<lsp_types::notification::DidSaveTextDocument>(lsp_types::DidSaveTextDocumentParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				text,
			})
	}

	/// Detach a document and tell the server.
	pub fn close_buffer(&self, uri: &Uri) -> Result<()> {
		let removed = self.inner.buffers.lock().remove(uri).is_some();
		if !removed {
			return Ok(());
		}
		let Some(caps) = self.inner.capabilities.get() else { return Ok(()) };
		if !has_capability(caps, lsp_types::notification::DidCloseTextDocument::METHOD) {
			return Ok(());
		}
		self.inner
			.rpc
			.notify::<lsp_types::notification::DidCloseTextDocument>(lsp_types::DidCloseTextDocumentParams {
				text_document: lsp_types::TextDocumentIdentifier { uri: uri.clone() },
			})
	}

	/// Documents currently attached to this session.
	pub fn buffer_uris(&self) -> Vec<Uri> {
		self.inner.buffers.lock().keys().cloned().collect()
	}

	pub fn has_buffer(&self, uri: &Uri) -> bool {
		self.inner.buffers.lock().contains_key(uri)
	}

	// ---- typed requests -----------------------------------------------

	pub async fn hover(&self, uri: Uri, position: lsp_types::Position) -> Result<Option<lsp_types::Hover>> {
		self.request_gated::<lsp_types::request::HoverRequest>(lsp_types::HoverParams {
			text_document_position_params: lsp_types::TextDocumentPositionParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				position,
			},
			work_done_progress_params: Default::default(),
		})
		.await
	}

	pub async fn completion(
		&self,
		uri: Uri,
		position: lsp_types::Position,
		context: Option<lsp_types::CompletionContext>,
	) -> Result<Option<lsp_types::CompletionResponse>> {
		self.request_gated::<lsp_types::request::Completion>(lsp_types::CompletionParams {
			text_document_position: lsp_types::TextDocumentPositionParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				position,
			},
			work_done_progress_params: Default::default(),
			partial_result_params: Default::default(),
			context,
		})
		.await
	}

	pub async fn definition(&self, uri: Uri, position: lsp_types::Position) -> Result<Option<lsp_types::GotoDefinitionResponse>> {
		self.request_gated::<lsp_types::request::GotoDefinition>(lsp_types::GotoDefinitionParams {
			text_document_position_params: lsp_types::TextDocumentPositionParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				position,
			},
			work_done_progress_params: Default::default(),
			partial_result_params: Default::default(),
		})
		.await
	}

	pub async fn references(&self, uri: Uri, position: lsp_types::Position, include_declaration: bool) -> Result<Option<Vec<lsp_types::Location>>> {
		self.request_gated::<lsp_types::request::References>(lsp_types::ReferenceParams {
			text_document_position: lsp_types::TextDocumentPositionParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				position,
			},
			work_done_progress_params: Default::default(),
			partial_result_params: Default::default(),
			context: lsp_types::ReferenceContext { include_declaration },
		})
		.await
	}

	pub async fn document_symbol(&self, uri: Uri) -> Result<Option<lsp_types::DocumentSymbolResponse>> {
		self.request_gated::<lsp_types::request::DocumentSymbolRequest>(lsp_types::DocumentSymbolParams {
			text_document: lsp_types::TextDocumentIdentifier { uri },
			work_done_progress_params: Default::default(),
			partial_result_params: Default::default(),
		})
		.await
	}

	pub async fn formatting(&self, uri: Uri, options: lsp_types::FormattingOptions) -> Result<Option<Vec<lsp_types::TextEdit>>> {
		self.request_gated::<lsp_types::request::Formatting>(lsp_types::DocumentFormattingParams {
			text_document: lsp_types::TextDocumentIdentifier { uri },
			options,
			work_done_progress_params: Default::default(),
		})
		.await
	}

	pub async fn code_action(
		&self,
		uri: Uri,
		range: lsp_types::Range,
		context: lsp_types::CodeActionContext,
	) -> Result<Option<lsp_types::CodeActionResponse>> {
		self.request_gated::<lsp_types::request::CodeActionRequest>(lsp_types::CodeActionParams {
			text_document: lsp_types::TextDocumentIdentifier { uri },
			range,
			context,
			work_done_progress_params: Default::default(),
			partial_result_params: Default::default(),
		})
		.await
	}

	pub async fn rename(&self, uri: Uri, position: lsp_types::Position, new_name: String) -> Result<Option<lsp_types::WorkspaceEdit>> {
		self.request_gated::<lsp_types::request::Rename>(lsp_types::RenameParams {
			text_document_position: lsp_types::TextDocumentPositionParams {
				text_document: lsp_types::TextDocumentIdentifier { uri },
				position,
			},
			new_name,
			work_done_progress_params: Default::default(),
		})
		.await
	}

	pub async fn execute_command(&self, command: String, arguments: Vec<JsonValue>) -> Result<Option<JsonValue>> {
		self.request_gated::<lsp_types::request::ExecuteCommand>(lsp_types::ExecuteCommandParams {
			command,
			arguments,
			work_done_progress_params: Default::default(),
		})
		.await
	}

	/// Pull diagnostics for a document (`textDocument/diagnostic`).
	pub async fn pull_diagnostics(&self, uri: Uri, previous_result_id: Option<String>) -> Result<lsp_types::DocumentDiagnosticReportResult> {
		self.request_gated::<lsp_types::request::DocumentDiagnosticRequest>(lsp_types::DocumentDiagnosticParams {
			text_document: lsp_types::TextDocumentIdentifier { uri },
			identifier: None,
			previous_result_id,
			work_done_progress_params: Default::default(),
			partial_result_params: Default::default(),
		})
		.await
	}

	// ---- shutdown and server-initiated requests -----------------------

	/// Graceful stop: `shutdown` request (bounded), `exit` notification,
	/// then transport teardown. Errors past the state change are logged,
	/// not surfaced; the transport is torn down regardless.
	pub async fn shutdown(&self) {
		self.inner.state.send_replace(SessionState::ShuttingDown);
		let budget = self.inner.config.timeouts.shutdown();
		if let Err(e) = self.inner.rpc.request::<lsp_types::request::Shutdown>((), Some(budget)).await {
			debug!(session = %self.inner.id, error = %e, "shutdown request failed");
		}
		if let Err(e) = self.inner.rpc.notify::<lsp_types::notification::Exit>(()) {
			debug!(session = %self.inner.id, error = %e, "exit notification failed");
		}
		self.inner.rpc.close();
		self.inner.state.send_replace(SessionState::Stopped);
	}

	/// Answer a server-initiated request. Unknown methods get a
	/// `MethodNotFound` error response so the server is never left hanging.
	pub fn handle_server_request(&self, req: AnyRequest) -> Result<()> {
		let result = match req.method.as_str() {
			"workspace/configuration" => {
				let params: lsp_types::ConfigurationParams = serde_json::from_value(req.params)?;
				let settings = self.inner.config.settings.as_ref();
				let values: Vec<JsonValue> = params
					.items
					.iter()
					.map(|item| settings.map_or(JsonValue::Null, |s| settings_section(s, item.section.as_deref())))
					.collect();
				Ok(serde_json::to_value(values)?)
			}
			"workspace/workspaceFolders" => {
				let folders = uri_from_path(&self.inner.config.root_path)
					.ok()
					.map(|uri| vec![workspace_folder_from_uri(uri)]);
				Ok(serde_json::to_value(folders)?)
			}
			"window/workDoneProgress/create" => Ok(JsonValue::Null),
			"workspace/applyEdit" => {
				// Edit application is the editor's job; this engine never
				// advertised support for it.
				Ok(serde_json::json!({ "applied": false, "failureReason": "client does not apply workspace edits" }))
			}
			"client/registerCapability" | "client/unregisterCapability" => {
				// Dynamic registration is not advertised; accept and ignore.
				debug!(session = %self.inner.id, method = %req.method, "ignoring dynamic registration");
				Ok(JsonValue::Null)
			}
			"window/showMessageRequest" => Ok(JsonValue::Null),
			other => Err(ResponseError::method_not_found(other)),
		};
		self.inner.rpc.reply(req.id, result)
	}
}

/// Walk a dot-separated section path into the configured settings blob.
fn settings_section(settings: &JsonValue, section: Option<&str>) -> JsonValue {
	let Some(section) = section else { return settings.clone() };
	let mut current = settings;
	for key in section.split('.') {
		match current.get(key) {
			Some(value) => current = value,
			None => return JsonValue::Null,
		}
	}
	current.clone()
}

fn workspace_folder_from_uri(uri: Uri) -> WorkspaceFolder {
	let name = uri
		.as_str()
		.rsplit('/')
		.next()
		.filter(|s| !s.is_empty())
		.unwrap_or_default()
		.to_string();
	WorkspaceFolder { name, uri }
}
