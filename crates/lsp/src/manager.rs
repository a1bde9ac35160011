//! Multi-server routing: documents in, sessions out.
//!
//! The manager owns every configured server for one editor window. Documents
//! are matched against selectors when they open; every matching server gets
//! its own session and its own copy of the document sync stream. Requests
//! either go to the single best match (hover, rename) or fan out across all
//! attached sessions (completion, references), with per-session failures
//! isolated from the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use lsp_types::{MessageType, NumberOrString, Uri};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capabilities::has_capability;
use crate::config::ServerConfig;
use crate::diagnostics::{DiagnosticsEvent, DiagnosticsStore};
use crate::monitor::{CrashTracker, RestartDecision, RestartPolicy};
use crate::rpc::{CloseReason, RpcEvent};
use crate::session::buffer::ChangePayload;
use crate::session::{Session, SessionId, SessionState};
use crate::transport::{Connect, ProcessConnect};
use crate::types::AnyNotification;
use crate::{Error, Result, uri_scheme};

/// Source of document text the manager does not own, used to reattach open
/// documents after a server restart.
pub trait DocumentProvider: Send + Sync {
	/// Current full text of a document, or `None` when the editor no longer
	/// has it open.
	fn current_text(&self, uri: &Uri) -> Option<String>;
}

/// Everything the editor UI needs to hear about.
#[derive(Debug)]
pub enum EditorEvent {
	/// Diagnostics for a document changed; `DiagnosticsStore::merged` has
	/// the full view.
	Diagnostics(DiagnosticsEvent),
	/// A session moved through its lifecycle.
	SessionState { session: SessionId, state: SessionState },
	/// The crash budget is spent; the server stays down until an explicit
	/// [`SessionManager::restart`].
	SessionFailed { name: String, attempts: u32 },
	/// `window/logMessage` from a server.
	LogMessage {
		session: SessionId,
		level: MessageType,
		message: String,
	},
	/// `window/showMessage`; unlike log messages, meant for the user's eyes.
	ShowMessage {
		session: SessionId,
		level: MessageType,
		message: String,
	},
	/// `$/progress` update.
	Progress {
		session: SessionId,
		token: String,
		title: Option<String>,
		message: Option<String>,
		percentage: Option<u32>,
		done: bool,
	},
}

#[derive(Debug, Clone)]
struct DocumentRecord {
	scope: String,
	language_id: String,
}

struct ManagerInner {
	configs: Vec<Arc<ServerConfig>>,
	policy: RestartPolicy,
	connector: Arc<dyn Connect>,
	provider: Arc<dyn DocumentProvider>,
	diagnostics: Arc<DiagnosticsStore>,
	event_tx: mpsc::UnboundedSender<EditorEvent>,
	/// Live sessions by config name. Never held across an await.
	sessions: Mutex<HashMap<String, Session>>,
	/// Per-name startup gates; singleflights `connect` + handshake.
	start_gates: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
	/// Next generation per name.
	generations: Mutex<HashMap<String, u32>>,
	trackers: Mutex<HashMap<String, CrashTracker>>,
	documents: Mutex<HashMap<Uri, DocumentRecord>>,
}

/// One editor window's view of all configured language servers.
#[derive(Clone)]
pub struct SessionManager {
	inner: Arc<ManagerInner>,
}

impl SessionManager {
	/// Build a manager that spawns real server processes.
	pub fn new(
		configs: Vec<ServerConfig>,
		policy: RestartPolicy,
		provider: Arc<dyn DocumentProvider>,
	) -> (Self, mpsc::UnboundedReceiver<EditorEvent>) {
		Self::with_connector(configs, policy, provider, Arc::new(ProcessConnect))
	}

	/// Build a manager with a custom transport factory. This is the seam
	/// in-memory tests and embedders hook into.
	pub fn with_connector(
		configs: Vec<ServerConfig>,
		policy: RestartPolicy,
		provider: Arc<dyn DocumentProvider>,
		connector: Arc<dyn Connect>,
	) -> (Self, mpsc::UnboundedReceiver<EditorEvent>) {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let configs: Vec<Arc<ServerConfig>> = configs.into_iter().map(Arc::new).collect();
		let start_gates = configs
			.iter()
			.map(|c| (c.name.clone(), Arc::new(tokio::sync::Mutex::new(()))))
			.collect();
		let manager = Self {
			inner: Arc::new(ManagerInner {
				configs,
				policy,
				connector,
				provider,
				diagnostics: Arc::new(DiagnosticsStore::new()),
				event_tx,
				sessions: Mutex::new(HashMap::new()),
				start_gates,
				generations: Mutex::new(HashMap::new()),
				trackers: Mutex::new(HashMap::new()),
				documents: Mutex::new(HashMap::new()),
			}),
		};
		(manager, event_rx)
	}

	pub fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
		&self.inner.diagnostics
	}

	/// The live session for a config name, if one is running.
	pub fn session(&self, name: &str) -> Option<Session> {
		self.inner.sessions.lock().get(name).cloned()
	}

	// ---- document lifecycle -------------------------------------------

	/// Attach a document to every matching server, starting sessions on
	/// demand. Startup failures are reported as events, not errors; one
	/// broken server must not block the others.
	pub async fn open_document(&self, uri: Uri, scope: &str, language_id: &str, text: &str) -> Result<()> {
		self.inner.documents.lock().insert(
			uri.clone(),
			DocumentRecord {
				scope: scope.to_owned(),
				language_id: language_id.to_owned(),
			},
		);

		let scheme = uri_scheme(&uri).to_owned();
		let matching: Vec<Arc<ServerConfig>> = self
			.inner
			.configs
			.iter()
			.filter(|c| c.match_document(scope, &scheme).is_some())
			.cloned()
			.collect();

		for config in matching {
			match self.ensure_session(&config).await {
				Ok(session) => {
					if let Err(e) = session.open_buffer(uri.clone(), language_id, text.to_owned()) {
						warn!(server = %config.name, uri = %uri.as_str(), error = %e, "didOpen failed");
					}
				}
				Err(e) => {
					warn!(server = %config.name, error = %e, "could not start language server");
					let attempts = self.inner.trackers.lock().get(&config.name).map_or(0, CrashTracker::recent_crashes);
					let _ = self.inner.event_tx.send(EditorEvent::SessionFailed {
						name: config.name.clone(),
						attempts,
					});
				}
			}
		}
		Ok(())
	}

	/// Forward a change to every session holding the document.
	pub async fn document_changed(&self, uri: &Uri, payload: ChangePayload) {
		let sessions = self.attached_sessions(uri);
		let results = join_all(sessions.iter().map(|s| s.notify_change(uri, payload.clone()))).await;
		for (session, result) in sessions.iter().zip(results) {
			if let Err(e) = result {
				warn!(session = %session.id(), error = %e, "didChange failed");
			}
		}
	}

	/// `willSaveWaitUntil` across all attached sessions, edits concatenated
	/// in routing order. Each session is individually time-boxed, so one
	/// stuck server cannot hold the save hostage.
	pub async fn will_save_wait_until(&self, uri: &Uri, reason: lsp_types::TextDocumentSaveReason) -> Vec<lsp_types::TextEdit> {
		let sessions = self.ranked_sessions(uri);
		let results = join_all(sessions.iter().map(|s| s.will_save_wait_until(uri.clone(), reason))).await;
		let mut edits = Vec::new();
		for (session, result) in sessions.iter().zip(results) {
			match result {
				Ok(mut e) => edits.append(&mut e),
				Err(e) => warn!(session = %session.id(), error = %e, "willSaveWaitUntil failed"),
			}
		}
		edits
	}

	pub fn document_saved(&self, uri: &Uri, text: Option<String>) {
		for session in self.attached_sessions(uri) {
			if let Err(e) = session.did_save(uri.clone(), text.clone()) {
				warn!(session = %session.id(), error = %e, "didSave failed");
			}
		}
	}

	/// Detach a document everywhere. Sessions configured with
	/// `stop_on_idle` are shut down once their last document closes.
	pub async fn close_document(&self, uri: &Uri) {
		self.inner.documents.lock().remove(uri);
		for session in self.attached_sessions(uri) {
			if let Err(e) = session.close_buffer(uri) {
				warn!(session = %session.id(), error = %e, "didClose failed");
			}
			if session.config().stop_on_idle && session.buffer_uris().is_empty() {
				info!(session = %session.id(), "last document closed, stopping idle server");
				session.shutdown().await;
			}
		}
		self.inner.diagnostics.remove_document(uri);
	}

	// ---- queries ------------------------------------------------------

	pub async fn hover(&self, uri: &Uri, position: lsp_types::Position) -> Result<Option<lsp_types::Hover>> {
		let session = self.best_for(uri, "textDocument/hover")?;
		session.hover(uri.clone(), position).await
	}

	pub async fn definition(&self, uri: &Uri, position: lsp_types::Position) -> Result<Option<lsp_types::GotoDefinitionResponse>> {
		let session = self.best_for(uri, "textDocument/definition")?;
		session.definition(uri.clone(), position).await
	}

	pub async fn formatting(&self, uri: &Uri, options: lsp_types::FormattingOptions) -> Result<Option<Vec<lsp_types::TextEdit>>> {
		let session = self.best_for(uri, "textDocument/formatting")?;
		session.formatting(uri.clone(), options).await
	}

	pub async fn rename(&self, uri: &Uri, position: lsp_types::Position, new_name: String) -> Result<Option<lsp_types::WorkspaceEdit>> {
		let session = self.best_for(uri, "textDocument/rename")?;
		session.rename(uri.clone(), position, new_name).await
	}

	/// Completions from every capable session, tagged by origin so the UI
	/// can label them. Failed sessions contribute nothing.
	pub async fn completion(
		&self,
		uri: &Uri,
		position: lsp_types::Position,
		context: Option<lsp_types::CompletionContext>,
	) -> Vec<(SessionId, lsp_types::CompletionResponse)> {
		let sessions = self.sessions_supporting(uri, "textDocument/completion");
		let results = join_all(
			sessions
				.iter()
				.map(|s| s.completion(uri.clone(), position, context.clone())),
		)
		.await;
		collect_tagged(&sessions, results, "completion")
	}

	/// References merged across every capable session, in routing order.
	pub async fn references(&self, uri: &Uri, position: lsp_types::Position, include_declaration: bool) -> Vec<lsp_types::Location> {
		let sessions = self.sessions_supporting(uri, "textDocument/references");
		let results = join_all(sessions.iter().map(|s| s.references(uri.clone(), position, include_declaration))).await;
		let mut locations = Vec::new();
		for (session, result) in sessions.iter().zip(results) {
			match result {
				Ok(Some(mut locs)) => locations.append(&mut locs),
				Ok(None) => {}
				Err(e) => warn!(session = %session.id(), error = %e, "references failed"),
			}
		}
		locations
	}

	pub async fn code_actions(
		&self,
		uri: &Uri,
		range: lsp_types::Range,
		context: lsp_types::CodeActionContext,
	) -> Vec<(SessionId, lsp_types::CodeActionResponse)> {
		let sessions = self.sessions_supporting(uri, "textDocument/codeAction");
		let results = join_all(sessions.iter().map(|s| s.code_action(uri.clone(), range, context.clone()))).await;
		collect_tagged(&sessions, results, "codeAction")
	}

	/// Pull diagnostics from every session that supports the pull model and
	/// fold full reports into the store.
	pub async fn pull_diagnostics(&self, uri: &Uri) {
		let sessions = self.sessions_supporting(uri, "textDocument/diagnostic");
		let results = join_all(sessions.iter().map(|s| s.pull_diagnostics(uri.clone(), None))).await;
		for (session, result) in sessions.iter().zip(results) {
			match result {
				Ok(lsp_types::DocumentDiagnosticReportResult::Report(lsp_types::DocumentDiagnosticReport::Full(report))) => {
					let event = self.inner.diagnostics.publish(
						session.id().clone(),
						uri.clone(),
						report.full_document_diagnostic_report.items,
					);
					let _ = self.inner.event_tx.send(EditorEvent::Diagnostics(event));
				}
				Ok(_) => {}
				Err(e) => warn!(session = %session.id(), error = %e, "diagnostic pull failed"),
			}
		}
	}

	// ---- lifecycle ----------------------------------------------------

	/// User-requested restart. Clears the crash history, stops the old
	/// instance if one is running, and reattaches its documents to the
	/// replacement.
	pub async fn restart(&self, name: &str) -> Result<()> {
		let config = self
			.inner
			.configs
			.iter()
			.find(|c| c.name == name)
			.cloned()
			.ok_or_else(|| Error::UnknownServer(name.to_owned()))?;

		if let Some(tracker) = self.inner.trackers.lock().get_mut(name) {
			tracker.reset();
		}

		let old = self.session(name);
		let buffers = old.as_ref().map(|s| s.buffer_uris()).unwrap_or_default();
		if let Some(old) = old {
			old.shutdown().await;
		}

		let gate = self.inner.start_gates.get(name).cloned().ok_or_else(|| Error::UnknownServer(name.to_owned()))?;
		let _guard = gate.lock().await;
		let session = start_session(&self.inner, config).await?;
		reattach(&self.inner, &session, buffers);
		Ok(())
	}

	/// Stop every running session in parallel.
	pub async fn shutdown_all(&self) {
		let sessions: Vec<Session> = self.inner.sessions.lock().values().cloned().collect();
		join_all(sessions.iter().map(|s| s.shutdown())).await;
	}

	// ---- internals ----------------------------------------------------

	async fn ensure_session(&self, config: &Arc<ServerConfig>) -> Result<Session> {
		let gate = self
			.inner
			.start_gates
			.get(&config.name)
			.cloned()
			.ok_or_else(|| Error::UnknownServer(config.name.clone()))?;
		let _guard = gate.lock().await;

		if let Some(session) = self.session(&config.name)
			&& !matches!(session.state(), SessionState::Stopped | SessionState::Crashed)
		{
			return Ok(session);
		}

		{
			let trackers = self.inner.trackers.lock();
			if let Some(tracker) = trackers.get(&config.name)
				&& tracker.gave_up()
			{
				return Err(Error::CrashLoop {
					attempts: tracker.recent_crashes(),
				});
			}
		}

		match start_session(&self.inner, config.clone()).await {
			Ok(session) => Ok(session),
			Err(e) => {
				// Connect failures leave no session behind, so no closure will
				// ever count them; handshake failures are counted by the
				// dying session's own router.
				if matches!(e, Error::Spawn { .. } | Error::Connect { .. }) {
					record_failure(&self.inner, &config.name);
				}
				Err(e)
			}
		}
	}

	/// Sessions holding this document, in config order.
	fn attached_sessions(&self, uri: &Uri) -> Vec<Session> {
		let sessions = self.inner.sessions.lock();
		self.inner
			.configs
			.iter()
			.filter_map(|c| sessions.get(&c.name))
			.filter(|s| s.state() == SessionState::Ready && s.has_buffer(uri))
			.cloned()
			.collect()
	}

	/// Attached sessions ordered for routing: priority-selector specificity
	/// first, then base specificity, then config order.
	fn ranked_sessions(&self, uri: &Uri) -> Vec<Session> {
		let record = self.inner.documents.lock().get(uri).cloned();
		let Some(record) = record else { return Vec::new() };
		let scheme = uri_scheme(uri).to_owned();

		let sessions = self.inner.sessions.lock();
		let mut ranked: Vec<(u32, u32, usize, Session)> = Vec::new();
		for (index, config) in self.inner.configs.iter().enumerate() {
			let Some(base) = config.match_document(&record.scope, &scheme) else {
				continue;
			};
			let Some(session) = sessions.get(&config.name) else { continue };
			if session.state() != SessionState::Ready || !session.has_buffer(uri) {
				continue;
			}
			let priority = config.priority_specificity(&record.scope).unwrap_or(0);
			ranked.push((priority, base, index, session.clone()));
		}
		ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
		ranked.into_iter().map(|(_, _, _, s)| s).collect()
	}

	fn sessions_supporting(&self, uri: &Uri, method: &str) -> Vec<Session> {
		self.ranked_sessions(uri)
			.into_iter()
			.filter(|s| s.capabilities().is_some_and(|caps| has_capability(caps, method)))
			.collect()
	}

	fn best_for(&self, uri: &Uri, method: &str) -> Result<Session> {
		self.sessions_supporting(uri, method)
			.into_iter()
			.next()
			.ok_or_else(|| Error::CapabilityUnavailable(method.to_owned()))
	}
}

fn collect_tagged<T>(sessions: &[Session], results: Vec<Result<Option<T>>>, what: &str) -> Vec<(SessionId, T)> {
	let mut out = Vec::new();
	for (session, result) in sessions.iter().zip(results) {
		match result {
			Ok(Some(value)) => out.push((session.id().clone(), value)),
			Ok(None) => {}
			Err(e) => warn!(session = %session.id(), error = %e, "{what} failed"),
		}
	}
	out
}

/// Allocate a generation, connect, handshake, and wire up the router.
///
/// The session owns its name's slot from the moment the transport is up, so
/// a closure during the handshake is cleaned up like any other crash. On a
/// handshake failure the slot removal is the closing router's job, not ours.
async fn start_session(inner: &Arc<ManagerInner>, config: Arc<ServerConfig>) -> Result<Session> {
	let name = config.name.clone();
	let generation = {
		let mut generations = inner.generations.lock();
		let slot = generations.entry(name.clone()).or_insert(0);
		let current = *slot;
		*slot += 1;
		current
	};
	let id = SessionId::new(name.clone(), generation);
	info!(session = %id, command = ?config.command, "starting language server");

	let transport = inner.connector.connect(&config).await?;
	let (session, events) = Session::start(id.clone(), config, transport);
	inner.sessions.lock().insert(name, session.clone());
	spawn_router(inner.clone(), session.clone(), events);

	let _ = inner.event_tx.send(EditorEvent::SessionState {
		session: id.clone(),
		state: SessionState::Initializing,
	});
	session.initialize().await?;
	let _ = inner.event_tx.send(EditorEvent::SessionState {
		session: id,
		state: SessionState::Ready,
	});
	Ok(session)
}

/// Count one failed start or crash against the server's budget.
fn record_failure(inner: &Arc<ManagerInner>, name: &str) -> RestartDecision {
	inner
		.trackers
		.lock()
		.entry(name.to_owned())
		.or_insert_with(|| CrashTracker::new(inner.policy))
		.record_crash(Instant::now())
}

/// Re-open the documents a previous instance held, with text from the
/// editor. Versions restart from zero on the fresh session.
fn reattach(inner: &Arc<ManagerInner>, session: &Session, uris: Vec<Uri>) {
	for uri in uris {
		let record = inner.documents.lock().get(&uri).cloned();
		let Some(record) = record else { continue };
		let Some(text) = inner.provider.current_text(&uri) else {
			debug!(uri = %uri.as_str(), "document gone from editor, not reattaching");
			continue;
		};
		if let Err(e) = session.open_buffer(uri.clone(), record.language_id, text) {
			warn!(session = %session.id(), uri = %uri.as_str(), error = %e, "reattach failed");
		}
	}
}

/// Per-session event pump. Server-initiated requests are answered inline so
/// replies keep request order; the final `Closed` event drives crash
/// recovery.
fn spawn_router(inner: Arc<ManagerInner>, session: Session, mut events: mpsc::UnboundedReceiver<RpcEvent>) {
	tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			match event {
				RpcEvent::Notification(notif) => route_notification(&inner, &session, notif),
				RpcEvent::Request(req) => {
					debug!(session = %session.id(), method = %req.method, "handling server request");
					if let Err(e) = session.handle_server_request(req) {
						warn!(session = %session.id(), error = %e, "failed to reply to server request");
					}
				}
				RpcEvent::Closed { reason } => {
					handle_closed(&inner, &session, reason).await;
					break;
				}
			}
		}
	});
}

fn route_notification(inner: &Arc<ManagerInner>, session: &Session, notif: AnyNotification) {
	// A replaced instance may still flush frames while it dies; nothing it
	// says is current any more.
	let is_current = inner
		.sessions
		.lock()
		.get(session.id().name())
		.is_some_and(|live| live.id() == session.id());
	if !is_current {
		debug!(session = %session.id(), method = %notif.method, "dropping notification from stale instance");
		return;
	}

	match notif.method.as_str() {
		"textDocument/publishDiagnostics" => {
			let Ok(params) = serde_json::from_value::<lsp_types::PublishDiagnosticsParams>(notif.params) else {
				warn!(session = %session.id(), "malformed publishDiagnostics dropped");
				return;
			};
			if !session.has_buffer(&params.uri) {
				debug!(session = %session.id(), uri = %params.uri.as_str(), "diagnostics for unattached document dropped");
				return;
			}
			let event = inner.diagnostics.publish(session.id().clone(), params.uri, params.diagnostics);
			let _ = inner.event_tx.send(EditorEvent::Diagnostics(event));
		}
		"window/logMessage" => {
			if let Ok(params) = serde_json::from_value::<lsp_types::LogMessageParams>(notif.params) {
				let _ = inner.event_tx.send(EditorEvent::LogMessage {
					session: session.id().clone(),
					level: params.typ,
					message: params.message,
				});
			}
		}
		"window/showMessage" => {
			if let Ok(params) = serde_json::from_value::<lsp_types::ShowMessageParams>(notif.params) {
				let _ = inner.event_tx.send(EditorEvent::ShowMessage {
					session: session.id().clone(),
					level: params.typ,
					message: params.message,
				});
			}
		}
		"$/progress" => {
			if let Ok(params) = serde_json::from_value::<lsp_types::ProgressParams>(notif.params) {
				let _ = inner.event_tx.send(progress_event(session.id().clone(), params));
			}
		}
		other => {
			debug!(session = %session.id(), method = %other, "unhandled server notification");
		}
	}
}

fn progress_event(session: SessionId, params: lsp_types::ProgressParams) -> EditorEvent {
	let token = match params.token {
		NumberOrString::Number(n) => n.to_string(),
		NumberOrString::String(s) => s,
	};
	let lsp_types::ProgressParamsValue::WorkDone(progress) = params.value;
	let (title, message, percentage, done) = match progress {
		lsp_types::WorkDoneProgress::Begin(begin) => (Some(begin.title), begin.message, begin.percentage, false),
		lsp_types::WorkDoneProgress::Report(report) => (None, report.message, report.percentage, false),
		lsp_types::WorkDoneProgress::End(end) => (None, end.message, None, true),
	};
	EditorEvent::Progress {
		session,
		token,
		title,
		message,
		percentage,
		done,
	}
}

/// Final cleanup for one session, plus crash recovery when the closure was
/// not ours.
///
/// Intent is judged by session state, not by [`CloseReason`]: a failed
/// handshake also closes the transport from our side, and that closure is a
/// crash, not a shutdown.
async fn handle_closed(inner: &Arc<ManagerInner>, session: &Session, reason: CloseReason) {
	let name = session.id().name().to_owned();
	let intentional = matches!(session.state(), SessionState::ShuttingDown | SessionState::Stopped);

	let owns_slot = {
		let mut sessions = inner.sessions.lock();
		match sessions.get(&name) {
			Some(live) if live.id() == session.id() => {
				sessions.remove(&name);
				true
			}
			Some(_) => false,
			None => true,
		}
	};

	// The dead instance's diagnostics go away regardless of who owns the
	// slot by now.
	for event in inner.diagnostics.remove_session(session.id()) {
		let _ = inner.event_tx.send(EditorEvent::Diagnostics(event));
	}

	if !owns_slot {
		// Already replaced; the newcomer owns recovery.
		debug!(session = %session.id(), "stale instance closed");
		return;
	}

	if intentional {
		let _ = inner.event_tx.send(EditorEvent::SessionState {
			session: session.id().clone(),
			state: SessionState::Stopped,
		});
		return;
	}

	session.mark_crashed();
	warn!(session = %session.id(), reason = ?reason, "language server crashed");
	let _ = inner.event_tx.send(EditorEvent::SessionState {
		session: session.id().clone(),
		state: SessionState::Crashed,
	});

	let buffers = session.buffer_uris();
	let mut decision = record_failure(inner, &name);
	loop {
		let delay = match decision {
			RestartDecision::GiveUp => {
				let attempts = inner.trackers.lock().get(&name).map_or(0, CrashTracker::recent_crashes);
				warn!(server = %name, attempts, "crash budget spent, leaving server down");
				let _ = inner.event_tx.send(EditorEvent::SessionFailed { name, attempts });
				return;
			}
			RestartDecision::Restart { delay } => delay,
		};

		info!(server = %name, delay_ms = delay.as_millis() as u64, "restarting crashed server");
		tokio::time::sleep(delay).await;

		let Some(config) = inner.configs.iter().find(|c| c.name == name).cloned() else { return };
		let Some(gate) = inner.start_gates.get(&name).cloned() else { return };
		let _guard = gate.lock().await;

		// Someone else may have brought the server back while we slept.
		let replaced = inner
			.sessions
			.lock()
			.get(&name)
			.is_some_and(|s| !matches!(s.state(), SessionState::Stopped | SessionState::Crashed));
		if replaced {
			debug!(server = %name, "server already running again, skipping restart");
			return;
		}

		match start_session(inner, config).await {
			Ok(new_session) => {
				reattach(inner, &new_session, buffers);
				return;
			}
			Err(e @ (Error::Spawn { .. } | Error::Connect { .. })) => {
				// No session came up, so no closure will drive the next
				// attempt; keep charging the budget here.
				warn!(server = %name, error = %e, "respawn failed");
				decision = record_failure(inner, &name);
			}
			Err(e) => {
				// The replacement's handshake failed; its own closure
				// continues recovery.
				warn!(server = %name, error = %e, "restart handshake failed");
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests;
