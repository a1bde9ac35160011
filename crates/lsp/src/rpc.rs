//! JSON-RPC 2.0 client on top of a [`Transport`].
//!
//! One I/O task per transport owns both stream halves: outbound messages are
//! drained from a queue and written whole (total write ordering), inbound
//! frames are decoded and dispatched. Responses resolve pending requests by
//! id; requests and notifications from the server are forwarded to the
//! session router through an [`RpcEvent`] channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::message::Message;
use crate::transport::{KILL_GRACE, Transport, reap_child};
use crate::types::{AnyNotification, AnyRequest, AnyResponse, RequestId, ResponseError};
use crate::{Error, Result};

/// Why the I/O loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
	/// The peer closed the stream cleanly.
	Eof,
	/// A read, write or framing error.
	Error(String),
	/// We asked the loop to stop.
	Shutdown,
}

/// Events surfaced by the I/O loop to its owner.
#[derive(Debug)]
pub enum RpcEvent {
	/// Server-sent notification (e.g. `textDocument/publishDiagnostics`).
	Notification(AnyNotification),
	/// Server-initiated request; answer via [`RpcClient::reply`].
	Request(AnyRequest),
	/// The transport is gone. Always the final event.
	Closed {
		/// Why the loop stopped.
		reason: CloseReason,
	},
}

/// Outbound envelope; variants are drained strictly in queue order.
enum Outbound {
	Request {
		request: AnyRequest,
		response_tx: oneshot::Sender<Result<AnyResponse>>,
	},
	Notify {
		notif: AnyNotification,
		barrier: Option<oneshot::Sender<Result<()>>>,
	},
	Reply {
		id: RequestId,
		result: std::result::Result<JsonValue, ResponseError>,
	},
	Cancel {
		id: RequestId,
	},
	Shutdown,
}

/// Handle for issuing requests and notifications over one transport.
///
/// Cheap to clone; all clones share the id counter and outbound queue.
#[derive(Clone)]
pub struct RpcClient {
	outbound_tx: mpsc::UnboundedSender<Outbound>,
	next_id: Arc<AtomicI64>,
}

/// An in-flight request. Await [`CallHandle::response`]; obtain a
/// [`CancelToken`] first if the call may be superseded.
pub struct CallHandle {
	id: RequestId,
	rx: oneshot::Receiver<Result<AnyResponse>>,
	client: RpcClient,
}

/// Detached cancellation handle for one request.
#[derive(Clone)]
pub struct CancelToken {
	id: RequestId,
	client: RpcClient,
}

impl CancelToken {
	/// Send `$/cancelRequest` and resolve the local pending request with
	/// [`Error::Cancelled`]. Any later response for this id is discarded.
	pub fn cancel(&self) {
		let _ = self.client.outbound_tx.send(Outbound::Cancel { id: self.id.clone() });
	}
}

impl CallHandle {
	/// The id assigned to this request.
	pub fn id(&self) -> &RequestId {
		&self.id
	}

	/// A token that can cancel this call from another task.
	pub fn cancel_token(&self) -> CancelToken {
		CancelToken {
			id: self.id.clone(),
			client: self.client.clone(),
		}
	}

	/// Await the raw response.
	pub async fn response(self) -> Result<AnyResponse> {
		self.rx.await.map_err(|_| Error::SessionTerminated)?
	}

	/// Await the response with an optional budget. On timeout the request is
	/// cancelled on the server side and [`Error::RequestTimeout`] returned.
	pub async fn response_with_timeout(self, method: &str, budget: Option<Duration>) -> Result<AnyResponse> {
		let Some(budget) = budget else {
			return self.response().await;
		};
		let token = self.cancel_token();
		match tokio::time::timeout(budget, self.response()).await {
			Ok(resp) => resp,
			Err(_) => {
				token.cancel();
				Err(Error::RequestTimeout(method.to_string()))
			}
		}
	}
}

impl RpcClient {
	/// Spawn the I/O loop for `transport`.
	///
	/// Events (server notifications/requests, closure) are delivered in
	/// order on `event_tx`; [`RpcEvent::Closed`] is always the last event.
	pub fn spawn(transport: Transport, event_tx: mpsc::UnboundedSender<RpcEvent>) -> (Self, JoinHandle<()>) {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(run_io(transport, outbound_rx, event_tx));
		(
			Self {
				outbound_tx,
				next_id: Arc::new(AtomicI64::new(0)),
			},
			task,
		)
	}

	/// Issue a raw request. Ids are monotonic and never reused for the
	/// lifetime of this client.
	pub fn call(&self, method: impl Into<String>, params: JsonValue) -> Result<CallHandle> {
		let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.outbound_tx
			.send(Outbound::Request {
				request: AnyRequest {
					id: id.clone(),
					method: method.into(),
					params,
				},
				response_tx: tx,
			})
			.map_err(|_| Error::SessionTerminated)?;
		Ok(CallHandle {
			id,
			rx,
			client: self.clone(),
		})
	}

	/// Issue a typed request and decode its result.
	pub async fn request<R: lsp_types::request::Request>(&self, params: R::Params, budget: Option<Duration>) -> Result<R::Result> {
		let params = serde_json::to_value(params)?;
		let resp = self.call(R::METHOD, params)?.response_with_timeout(R::METHOD, budget).await?;
		match resp.error {
			Some(err) => Err(Error::Response(err)),
			None => Ok(serde_json::from_value(resp.result.unwrap_or_default())?),
		}
	}

	/// Send a typed notification, fire and forget.
	pub fn notify<N: lsp_types::notification::Notification>(&self, params: N::Params) -> Result<()> {
		self.notify_raw(AnyNotification {
			method: N::METHOD.into(),
			params: serde_json::to_value(params)?,
		})
	}

	/// Send a raw notification.
	pub fn notify_raw(&self, notif: AnyNotification) -> Result<()> {
		self.outbound_tx
			.send(Outbound::Notify { notif, barrier: None })
			.map_err(|_| Error::SessionTerminated)
	}

	/// Send a typed notification and receive a barrier that resolves once
	/// the frame has been written to the transport.
	pub fn notify_with_barrier<N: lsp_types::notification::Notification>(&self, params: N::Params) -> Result<oneshot::Receiver<Result<()>>> {
		let (tx, rx) = oneshot::channel();
		self.outbound_tx
			.send(Outbound::Notify {
				notif: AnyNotification {
					method: N::METHOD.into(),
					params: serde_json::to_value(params)?,
				},
				barrier: Some(tx),
			})
			.map_err(|_| Error::SessionTerminated)?;
		Ok(rx)
	}

	/// Answer a server-initiated request.
	pub fn reply(&self, id: RequestId, result: std::result::Result<JsonValue, ResponseError>) -> Result<()> {
		self.outbound_tx
			.send(Outbound::Reply { id, result })
			.map_err(|_| Error::SessionTerminated)
	}

	/// Ask the I/O loop to stop. Pending requests fail with
	/// [`Error::SessionTerminated`]; the subprocess, if any, is given a
	/// short grace period before being killed.
	pub fn close(&self) {
		let _ = self.outbound_tx.send(Outbound::Shutdown);
	}

	/// Whether the I/O loop is still accepting messages.
	pub fn is_open(&self) -> bool {
		!self.outbound_tx.is_closed()
	}
}

async fn run_io(transport: Transport, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>, event_tx: mpsc::UnboundedSender<RpcEvent>) {
	let Transport { reader, mut writer, child } = transport;
	let mut pending: HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>> = HashMap::new();
	let mut cancelled: VecDeque<RequestId> = VecDeque::new();

	// Reads run in their own task so a frame is never dropped half-consumed
	// when the select below takes the outbound arm.
	let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
	let reader_task = tokio::spawn(read_loop(reader, inbound_tx));

	let reason = loop {
		tokio::select! {
			out = outbound_rx.recv() => {
				let Some(out) = out else { break CloseReason::Shutdown };
				match write_outbound(&mut writer, out, &mut pending, &mut cancelled).await {
					Ok(true) => {}
					Ok(false) => break CloseReason::Shutdown,
					Err(e) => {
						error!(error = %e, "outbound write failed, closing transport");
						break CloseReason::Error(e.to_string());
					}
				}
			}

			inbound = inbound_rx.recv() => {
				match inbound {
					Some(Ok(msg)) => dispatch_inbound(msg, &mut pending, &mut cancelled, &event_tx),
					Some(Err(e)) => {
						error!(error = %e, "failed to read from language server");
						break CloseReason::Error(e.to_string());
					}
					None => break CloseReason::Eof,
				}
			}
		}
	};

	// Reject everything still in flight or queued.
	for (_, tx) in pending.drain() {
		let _ = tx.send(Err(Error::SessionTerminated));
	}
	outbound_rx.close();
	while let Ok(out) = outbound_rx.try_recv() {
		match out {
			Outbound::Request { response_tx, .. } => {
				let _ = response_tx.send(Err(Error::SessionTerminated));
			}
			Outbound::Notify { barrier: Some(tx), .. } => {
				let _ = tx.send(Err(Error::SessionTerminated));
			}
			_ => {}
		}
	}

	// Graceful stream shutdown first, then reap the process.
	reader_task.abort();
	let _ = writer.shutdown().await;
	drop(writer);
	if let Some(child) = child {
		reap_child(child, KILL_GRACE).await;
	}

	let _ = event_tx.send(RpcEvent::Closed { reason });
}

async fn read_loop(
	mut reader: Box<dyn tokio::io::AsyncBufRead + Send + Unpin>,
	tx: mpsc::UnboundedSender<Result<Message>>,
) {
	loop {
		match Message::read(&mut reader).await {
			Ok(Some(msg)) => {
				if tx.send(Ok(msg)).is_err() {
					break;
				}
			}
			Ok(None) => break,
			Err(e) => {
				let _ = tx.send(Err(e));
				break;
			}
		}
	}
}

/// Most requests a well-behaved server answers even after `$/cancelRequest`,
/// so entries normally leave through [`dispatch_inbound`]. The cap only
/// matters for servers that honour cancels silently.
const CANCELLED_IDS_CAP: usize = 32;

/// Writes one outbound envelope. Returns `Ok(false)` on shutdown.
async fn write_outbound(
	writer: &mut (impl tokio::io::AsyncWrite + Unpin),
	out: Outbound,
	pending: &mut HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>>,
	cancelled: &mut VecDeque<RequestId>,
) -> Result<bool> {
	match out {
		Outbound::Request { request, response_tx } => {
			let id = request.id.clone();
			match Message::Request(request).write(writer).await {
				Ok(()) => {
					pending.insert(id, response_tx);
				}
				Err(e) => {
					let _ = response_tx.send(Err(Error::SessionTerminated));
					return Err(e);
				}
			}
		}
		Outbound::Notify { notif, barrier } => {
			let res = Message::Notification(notif).write(writer).await;
			if let Some(tx) = barrier {
				let _ = tx.send(res.as_ref().map(|_| ()).map_err(|_| Error::SessionTerminated));
			}
			res?;
		}
		Outbound::Reply { id, result } => {
			let resp = match result {
				Ok(result) => AnyResponse {
					id,
					result: Some(result),
					error: None,
				},
				Err(error) => AnyResponse {
					id,
					result: None,
					error: Some(error),
				},
			};
			Message::Response(resp).write(writer).await?;
		}
		Outbound::Cancel { id } => {
			// Resolve the caller immediately; the wire cancel is best-effort.
			if let Some(tx) = pending.remove(&id) {
				if cancelled.len() == CANCELLED_IDS_CAP {
					cancelled.pop_front();
				}
				cancelled.push_back(id.clone());
				let _ = tx.send(Err(Error::Cancelled));
			}
			let notif = AnyNotification {
				method: "$/cancelRequest".into(),
				params: serde_json::json!({ "id": id }),
			};
			Message::Notification(notif).write(writer).await?;
		}
		Outbound::Shutdown => return Ok(false),
	}
	Ok(true)
}

fn dispatch_inbound(
	msg: Message,
	pending: &mut HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>>,
	cancelled: &mut VecDeque<RequestId>,
	event_tx: &mpsc::UnboundedSender<RpcEvent>,
) {
	match msg {
		Message::Response(resp) => {
			if let Some(tx) = pending.remove(&resp.id) {
				let _ = tx.send(Ok(resp));
			} else if let Some(pos) = cancelled.iter().position(|id| *id == resp.id) {
				cancelled.remove(pos);
				debug!(id = %resp.id, "discarding late response for cancelled request");
			} else {
				debug!(id = %resp.id, "response for unknown request id");
			}
		}
		Message::Request(req) => {
			let _ = event_tx.send(RpcEvent::Request(req));
		}
		Message::Notification(notif) => {
			let _ = event_tx.send(RpcEvent::Notification(notif));
		}
	}
}
