//! Per-document synchronization state.
//!
//! Each open document tracks its own version counter and a queue of pending
//! change batches. At most one `didChange` batch is in flight per document;
//! further edits accumulate in the queue until the in-flight write completes.
//! Versions are assigned at dequeue time, under the buffer lock, so they are
//! strictly increasing in wire order.

use lsp_types::{Range, TextDocumentContentChangeEvent};

use crate::capabilities::SyncKind;

/// One edit produced by the editor, in the position encoding negotiated with
/// the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEdit {
	pub range: Range,
	pub text: String,
}

/// Change content handed to [`Session::notify_change`](crate::session::Session::notify_change).
///
/// Callers on a full-sync server must supply [`ChangePayload::Full`]; the
/// negotiated [`SyncKind`] decides which form actually reaches the wire.
#[derive(Debug, Clone)]
pub enum ChangePayload {
	/// Complete replacement text for the document.
	Full(String),
	/// Minimal range edits, in application order.
	Incremental(Vec<DocumentEdit>),
}

/// Sync bookkeeping for one open document on one session.
#[derive(Debug)]
pub struct BufferState {
	pub language_id: String,
	/// Chosen once at open from the server's capabilities and never revisited.
	pub sync_kind: SyncKind,
	version: i32,
	queue: Vec<TextDocumentContentChangeEvent>,
	inflight: bool,
}

/// A drained batch ready to go on the wire as a single `didChange`.
#[derive(Debug)]
pub struct ChangeBatch {
	pub version: i32,
	pub changes: Vec<TextDocumentContentChangeEvent>,
}

impl BufferState {
	pub fn new(language_id: String, sync_kind: SyncKind) -> Self {
		Self {
			language_id,
			sync_kind,
			version: 0,
			queue: Vec::new(),
			inflight: false,
		}
	}

	pub fn version(&self) -> i32 {
		self.version
	}

	/// Queue a change. Returns `false` when the server opted out of change
	/// notifications and nothing was queued.
	pub fn enqueue(&mut self, payload: ChangePayload) -> bool {
		match self.sync_kind {
			SyncKind::None => false,
			SyncKind::Full => {
				let ChangePayload::Full(text) = payload else {
					return false;
				};
				// A newer snapshot makes any queued one redundant.
				self.queue.clear();
				self.queue.push(TextDocumentContentChangeEvent {
					range: None,
					range_length: None,
					text,
				});
				true
			}
			SyncKind::Incremental => {
				match payload {
					ChangePayload::Full(text) => {
						// A full replacement invalidates queued range edits.
						self.queue.clear();
						self.queue.push(TextDocumentContentChangeEvent {
							range: None,
							range_length: None,
							text,
						});
					}
					ChangePayload::Incremental(edits) => {
						self.queue.extend(edits.into_iter().map(|edit| TextDocumentContentChangeEvent {
							range: Some(edit.range),
							range_length: None,
							text: edit.text,
						}));
					}
				}
				true
			}
		}
	}

	/// Take the next batch if nothing is in flight. The version is bumped
	/// here so it reflects wire order, not submission order.
	pub fn next_batch(&mut self) -> Option<ChangeBatch> {
		if self.inflight || self.queue.is_empty() {
			return None;
		}
		self.inflight = true;
		self.version += 1;
		Some(ChangeBatch {
			version: self.version,
			changes: std::mem::take(&mut self.queue),
		})
	}

	/// Mark the in-flight batch as written. Queued edits that arrived in the
	/// meantime become eligible on the next [`Self::next_batch`] call.
	pub fn acked(&mut self) {
		self.inflight = false;
	}
}
