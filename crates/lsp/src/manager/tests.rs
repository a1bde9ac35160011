use std::future::Future;
use std::time::Duration;

use lsp_types::{ServerCapabilities, TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, DuplexStream, ReadHalf, WriteHalf, split};
use tokio::time::timeout;

use super::*;
use crate::config::Selector;
use crate::message::Message;
use crate::monitor::Backoff;
use crate::transport::Transport;
use crate::types::{AnyNotification, AnyRequest, AnyResponse, RequestId};

type ServerEnd = (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

async fn read_request(reader: &mut (impl AsyncBufRead + Unpin)) -> AnyRequest {
	loop {
		match Message::read(reader).await.expect("read").expect("frame") {
			Message::Request(req) => return req,
			Message::Notification(_) => continue,
			other => panic!("expected request, got {other:?}"),
		}
	}
}

async fn read_notification(reader: &mut (impl AsyncBufRead + Unpin)) -> AnyNotification {
	match Message::read(reader).await.expect("read").expect("frame") {
		Message::Notification(notif) => notif,
		other => panic!("expected notification, got {other:?}"),
	}
}

async fn respond(writer: &mut (impl AsyncWrite + Unpin), id: RequestId, result: serde_json::Value) {
	Message::Response(AnyResponse {
		id,
		result: Some(result),
		error: None,
	})
	.write(writer)
	.await
	.expect("write response");
}

async fn serve_handshake(end: &mut ServerEnd, caps: &ServerCapabilities) {
	let init = read_request(&mut end.0).await;
	assert_eq!(init.method, "initialize");
	respond(&mut end.1, init.id, json!({ "capabilities": serde_json::to_value(caps).expect("caps") })).await;
	let notif = read_notification(&mut end.0).await;
	assert_eq!(notif.method, "initialized");
}

/// Keep reading until the client goes away, so the session stays healthy
/// for the rest of the test.
async fn park(mut end: ServerEnd) {
	while let Ok(Some(_)) = Message::read(&mut end.0).await {}
}

/// A transport whose server side runs `script` after a scripted handshake.
fn scripted<F, Fut>(caps: ServerCapabilities, script: F) -> Transport
where
	F: FnOnce(ServerEnd) -> Fut + Send + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let (client_io, server_io) = tokio::io::duplex(64 * 1024);
	tokio::spawn(async move {
		let (server_read, server_write) = split(server_io);
		let mut end = (BufReader::new(server_read), server_write);
		serve_handshake(&mut end, &caps).await;
		script(end).await;
	});
	let (client_read, client_write) = split(client_io);
	Transport::from_streams(client_read, client_write)
}

/// Hands out pre-scripted transports by config name; runs dry after the
/// scripts are used up.
#[derive(Default)]
struct FakeConnect {
	transports: Mutex<HashMap<String, Vec<Transport>>>,
}

impl FakeConnect {
	fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn add(&self, name: &str, transport: Transport) {
		self.transports.lock().entry(name.to_owned()).or_default().push(transport);
	}
}

#[async_trait::async_trait]
impl Connect for FakeConnect {
	async fn connect(&self, config: &ServerConfig) -> Result<Transport> {
		let mut transports = self.transports.lock();
		match transports.get_mut(&config.name) {
			Some(scripts) if !scripts.is_empty() => Ok(scripts.remove(0)),
			_ => Err(Error::Spawn {
				command: config.name.clone(),
				reason: "no scripted transport left".into(),
			}),
		}
	}
}

#[derive(Default)]
struct FakeDocs {
	texts: Mutex<HashMap<Uri, String>>,
}

impl FakeDocs {
	fn with(uri: Uri, text: &str) -> Arc<Self> {
		let docs = Self::default();
		docs.texts.lock().insert(uri, text.to_owned());
		Arc::new(docs)
	}
}

impl DocumentProvider for FakeDocs {
	fn current_text(&self, uri: &Uri) -> Option<String> {
		self.texts.lock().get(uri).cloned()
	}
}

fn sync_caps() -> ServerCapabilities {
	ServerCapabilities {
		text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
			open_close: Some(true),
			change: Some(TextDocumentSyncKind::INCREMENTAL),
			..Default::default()
		})),
		..Default::default()
	}
}

fn hover_caps() -> ServerCapabilities {
	ServerCapabilities {
		hover_provider: Some(lsp_types::HoverProviderCapability::Simple(true)),
		..sync_caps()
	}
}

fn formatting_caps() -> ServerCapabilities {
	ServerCapabilities {
		document_formatting_provider: Some(lsp_types::OneOf::Left(true)),
		..sync_caps()
	}
}

fn cfg(name: &str, scope: &str) -> ServerConfig {
	ServerConfig::new(name, ["true"], Selector::new([scope]), "/tmp/project")
}

fn fast_policy() -> RestartPolicy {
	RestartPolicy {
		max_restarts: 2,
		window: Duration::from_secs(60),
		backoff: Backoff::Flat(Duration::ZERO),
	}
}

fn uri(s: &str) -> Uri {
	s.parse().expect("uri")
}

fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

async fn wait_for(rx: &mut mpsc::UnboundedReceiver<EditorEvent>, pred: impl Fn(&EditorEvent) -> bool) -> EditorEvent {
	timeout(Duration::from_secs(5), async {
		loop {
			let event = rx.recv().await.expect("event stream open");
			if pred(&event) {
				return event;
			}
		}
	})
	.await
	.expect("expected event within budget")
}

#[tokio::test]
async fn documents_attach_to_every_matching_server() {
	init_tracing();
	let (tap, mut taps) = mpsc::unbounded_channel::<String>();
	let connect = FakeConnect::new();
	for name in ["pyright", "ruff"] {
		let tap = tap.clone();
		connect.add(
			name,
			scripted(sync_caps(), move |mut end| async move {
				let open = read_notification(&mut end.0).await;
				assert_eq!(open.method, "textDocument/didOpen");
				let change = read_notification(&mut end.0).await;
				assert_eq!(change.method, "textDocument/didChange");
				assert_eq!(change.params["textDocument"]["version"], 1);
				tap.send(format!("{name}:{}", change.params["contentChanges"][0]["text"].as_str().expect("text"))).expect("tap");
				park(end).await;
			}),
		);
	}

	let configs = vec![cfg("pyright", "source.python"), cfg("ruff", "source.python"), cfg("rust-analyzer", "source.rust")];
	let (manager, _events) = SessionManager::with_connector(configs, fast_policy(), Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "print()").await.expect("open");
	manager.document_changed(&doc, ChangePayload::Full("print(1)".into())).await;

	let mut seen = [taps.recv().await.expect("tap"), taps.recv().await.expect("tap")];
	seen.sort();
	assert_eq!(seen, ["pyright:print(1)", "ruff:print(1)"]);

	assert!(manager.session("pyright").is_some());
	assert!(manager.session("ruff").is_some());
	assert!(manager.session("rust-analyzer").is_none(), "non-matching server must never start");
}

#[tokio::test]
async fn single_target_requests_go_to_a_capable_server() {
	init_tracing();
	let connect = FakeConnect::new();
	// ruff comes first in config order but cannot hover.
	connect.add("ruff", scripted(sync_caps(), park));
	connect.add(
		"pyright",
		scripted(hover_caps(), |mut end| async move {
			let req = read_request(&mut end.0).await;
			assert_eq!(req.method, "textDocument/hover");
			respond(&mut end.1, req.id, json!({ "contents": "from pyright" })).await;
			park(end).await;
		}),
	);

	let configs = vec![cfg("ruff", "source.python"), cfg("pyright", "source.python")];
	let (manager, _events) = SessionManager::with_connector(configs, fast_policy(), Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "x = 1").await.expect("open");

	let hover = manager
		.hover(&doc, lsp_types::Position { line: 0, character: 0 })
		.await
		.expect("hover")
		.expect("some hover");
	match hover.contents {
		lsp_types::HoverContents::Scalar(lsp_types::MarkedString::String(s)) => assert_eq!(s, "from pyright"),
		other => panic!("unexpected hover contents: {other:?}"),
	}
}

#[tokio::test]
async fn priority_selector_outranks_config_order() {
	init_tracing();
	let connect = FakeConnect::new();
	connect.add("pyright", scripted(formatting_caps(), park));
	connect.add(
		"ruff",
		scripted(formatting_caps(), |mut end| async move {
			let req = read_request(&mut end.0).await;
			assert_eq!(req.method, "textDocument/formatting");
			respond(&mut end.1, req.id, json!([{ "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } }, "newText": "formatted-by-ruff" }]))
				.await;
			park(end).await;
		}),
	);

	// pyright is first and matches broadly; ruff's priority selector is
	// more specific than pyright's base match.
	let pyright = cfg("pyright", "source");
	let ruff = cfg("ruff", "source").priority_selector(Selector::new(["source.python"]));
	let (manager, _events) = SessionManager::with_connector(vec![pyright, ruff], fast_policy(), Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "x=1").await.expect("open");

	let options = lsp_types::FormattingOptions {
		tab_size: 4,
		insert_spaces: true,
		..Default::default()
	};
	let edits = manager
		.formatting(&doc, options)
		.await
		.expect("formatting")
		.expect("edits");
	assert_eq!(edits[0].new_text, "formatted-by-ruff");
}

#[tokio::test]
async fn crash_restarts_with_fresh_generation_and_reattaches() {
	init_tracing();
	let (tap, mut taps) = mpsc::unbounded_channel::<String>();
	let connect = FakeConnect::new();

	// First instance: accept the document, publish a diagnostic, then die.
	connect.add(
		"flaky",
		scripted(sync_caps(), |mut end| async move {
			let open = read_notification(&mut end.0).await;
			assert_eq!(open.method, "textDocument/didOpen");
			Message::Notification(AnyNotification {
				method: "textDocument/publishDiagnostics".into(),
				params: json!({
					"uri": "file:///w/app.py",
					"diagnostics": [{
						"range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
						"severity": 1,
						"message": "boom"
					}]
				}),
			})
			.write(&mut end.1)
			.await
			.expect("publish");
			// Dropping the end simulates a crash.
		}),
	);

	// Replacement instance records what it gets reattached with.
	{
		let tap = tap.clone();
		connect.add(
			"flaky",
			scripted(sync_caps(), move |mut end| async move {
				let open = read_notification(&mut end.0).await;
				assert_eq!(open.method, "textDocument/didOpen");
				tap.send(format!(
					"reopen:{}@v{}",
					open.params["textDocument"]["text"].as_str().expect("text"),
					open.params["textDocument"]["version"]
				))
				.expect("tap");
				park(end).await;
			}),
		);
	}

	let doc = uri("file:///w/app.py");
	let provider = FakeDocs::with(doc.clone(), "latest text");
	let (manager, mut events) = SessionManager::with_connector(vec![cfg("flaky", "source.python")], fast_policy(), provider, connect);

	manager.open_document(doc.clone(), "source.python", "python", "old text").await.expect("open");

	let with_error = wait_for(&mut events, |e| matches!(e, EditorEvent::Diagnostics(d) if d.errors == 1)).await;
	let EditorEvent::Diagnostics(with_error) = with_error else { unreachable!() };
	assert_eq!(with_error.uri, doc);

	// The dead instance's diagnostics are withdrawn before the crash is
	// reported.
	wait_for(&mut events, |e| matches!(e, EditorEvent::Diagnostics(d) if d.errors == 0)).await;
	wait_for(&mut events, |e| matches!(e, EditorEvent::SessionState { state: SessionState::Crashed, .. })).await;

	let ready = wait_for(&mut events, |e| matches!(e, EditorEvent::SessionState { state: SessionState::Ready, .. })).await;
	let EditorEvent::SessionState { session, .. } = ready else { unreachable!() };
	assert_eq!(session.generation(), 1, "restart must mint a fresh generation");

	// Reattached with the editor's current text, version counter reset.
	assert_eq!(taps.recv().await.expect("tap"), "reopen:latest text@v0");
	assert!(manager.diagnostics().merged(&doc).is_empty());
}

#[tokio::test]
async fn crash_budget_exhaustion_leaves_the_server_down() {
	init_tracing();
	let connect = FakeConnect::new();
	// Dies right after the handshake; no replacement is scripted.
	connect.add("dies", scripted(sync_caps(), |_end| async {}));

	let policy = RestartPolicy {
		max_restarts: 0,
		window: Duration::from_secs(60),
		backoff: Backoff::Flat(Duration::ZERO),
	};
	let (manager, mut events) = SessionManager::with_connector(vec![cfg("dies", "source.python")], policy, Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "x").await.expect("open");

	let failed = wait_for(&mut events, |e| matches!(e, EditorEvent::SessionFailed { attempts: 1, .. })).await;
	let EditorEvent::SessionFailed { name, .. } = failed else { unreachable!() };
	assert_eq!(name, "dies");

	// Re-opening does not revive it; the refusal is reported, not retried.
	manager.open_document(doc.clone(), "source.python", "python", "x").await.expect("open");
	wait_for(&mut events, |e| matches!(e, EditorEvent::SessionFailed { .. })).await;
	assert!(manager.session("dies").is_none());
}

#[tokio::test]
async fn failed_respawns_consume_the_crash_budget() {
	init_tracing();
	let connect = FakeConnect::new();
	// Dies right after the handshake; every respawn afterwards fails too.
	connect.add("dies", scripted(sync_caps(), |_end| async {}));

	let policy = RestartPolicy {
		max_restarts: 3,
		window: Duration::from_secs(60),
		backoff: Backoff::Flat(Duration::ZERO),
	};
	let (manager, mut events) = SessionManager::with_connector(vec![cfg("dies", "source.python")], policy, Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "x").await.expect("open");

	// One crash plus two failed respawns spend the budget of three.
	let failed = wait_for(&mut events, |e| matches!(e, EditorEvent::SessionFailed { attempts: 3, .. })).await;
	let EditorEvent::SessionFailed { name, .. } = failed else { unreachable!() };
	assert_eq!(name, "dies");
	assert!(manager.session("dies").is_none());
}

#[tokio::test]
async fn a_failed_handshake_is_retried_like_a_crash() {
	init_tracing();
	let connect = FakeConnect::new();
	// First instance's transport is dead on arrival, so `initialize` fails;
	// the replacement behaves.
	let (client_io, server_io) = tokio::io::duplex(1024);
	drop(server_io);
	let (client_read, client_write) = split(client_io);
	connect.add("eager", Transport::from_streams(client_read, client_write));
	connect.add("eager", scripted(sync_caps(), park));

	let (manager, mut events) = SessionManager::with_connector(vec![cfg("eager", "source.python")], fast_policy(), Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "x").await.expect("open");

	let ready = wait_for(&mut events, |e| matches!(e, EditorEvent::SessionState { state: SessionState::Ready, .. })).await;
	let EditorEvent::SessionState { session, .. } = ready else { unreachable!() };
	assert_eq!(session.generation(), 1, "the replacement must carry a fresh generation");
}

#[tokio::test]
async fn stop_on_idle_shuts_down_after_last_document_closes() {
	init_tracing();
	let connect = FakeConnect::new();
	connect.add(
		"tidy",
		scripted(sync_caps(), |mut end| async move {
			let open = read_notification(&mut end.0).await;
			assert_eq!(open.method, "textDocument/didOpen");
			let close = read_notification(&mut end.0).await;
			assert_eq!(close.method, "textDocument/didClose");
			let shutdown = read_request(&mut end.0).await;
			assert_eq!(shutdown.method, "shutdown");
			respond(&mut end.1, shutdown.id, serde_json::Value::Null).await;
			let exit = read_notification(&mut end.0).await;
			assert_eq!(exit.method, "exit");
		}),
	);

	let config = cfg("tidy", "source.python").stop_on_idle(true);
	let (manager, mut events) = SessionManager::with_connector(vec![config], fast_policy(), Arc::new(FakeDocs::default()), connect);

	let doc = uri("file:///w/app.py");
	manager.open_document(doc.clone(), "source.python", "python", "x").await.expect("open");
	manager.close_document(&doc).await;

	wait_for(&mut events, |e| matches!(e, EditorEvent::SessionState { state: SessionState::Stopped, .. })).await;
	// The router removes the slot when the transport closes.
	timeout(Duration::from_secs(5), async {
		while manager.session("tidy").is_some() {
			tokio::task::yield_now().await;
		}
	})
	.await
	.expect("slot cleared");
}
