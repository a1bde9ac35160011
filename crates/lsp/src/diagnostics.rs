//! Per-document diagnostics, merged across sessions.
//!
//! Each session owns its slice of a document's diagnostics: a publish from
//! pyright never disturbs what ruff reported for the same file. Consumers
//! read the merged view; a global change counter lets them skip re-rendering
//! when nothing moved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use lsp_types::{Diagnostic, DiagnosticSeverity, Uri};
use parking_lot::RwLock;

use crate::session::SessionId;

/// A diagnostic tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedDiagnostic {
	pub session: SessionId,
	pub diagnostic: Diagnostic,
}

/// Counts for one document after a change, for status-line consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsEvent {
	pub uri: Uri,
	pub errors: usize,
	pub warnings: usize,
}

/// Merged diagnostics for all open documents.
#[derive(Default)]
pub struct DiagnosticsStore {
	docs: RwLock<HashMap<Uri, HashMap<SessionId, Vec<Diagnostic>>>>,
	version: AtomicU64,
}

impl DiagnosticsStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bumped on every mutation; equal versions mean an identical merged view.
	pub fn version(&self) -> u64 {
		self.version.load(Ordering::Acquire)
	}

	/// Replace one session's diagnostics for a document. An empty list
	/// clears that session's slice; other sessions' entries are untouched.
	pub fn publish(&self, session: SessionId, uri: Uri, diagnostics: Vec<Diagnostic>) -> DiagnosticsEvent {
		let mut docs = self.docs.write();
		let per_session = docs.entry(uri.clone()).or_default();
		if diagnostics.is_empty() {
			per_session.remove(&session);
		} else {
			per_session.insert(session, diagnostics);
		}
		let (errors, warnings) = count(per_session);
		if per_session.is_empty() {
			docs.remove(&uri);
		}
		self.version.fetch_add(1, Ordering::Release);
		DiagnosticsEvent { uri, errors, warnings }
	}

	/// The merged view for one document, ordered by severity, then position,
	/// then session name so equal inputs render identically.
	pub fn merged(&self, uri: &Uri) -> Vec<TaggedDiagnostic> {
		let docs = self.docs.read();
		let Some(per_session) = docs.get(uri) else { return Vec::new() };
		let mut merged: Vec<TaggedDiagnostic> = per_session
			.iter()
			.flat_map(|(session, diags)| {
				diags.iter().map(|diagnostic| TaggedDiagnostic {
					session: session.clone(),
					diagnostic: diagnostic.clone(),
				})
			})
			.collect();
		merged.sort_by(|a, b| {
			severity_rank(&a.diagnostic)
				.cmp(&severity_rank(&b.diagnostic))
				.then_with(|| a.diagnostic.range.start.cmp(&b.diagnostic.range.start))
				.then_with(|| a.session.name().cmp(b.session.name()))
		});
		merged
	}

	/// `(errors, warnings)` across all sessions for one document.
	pub fn counts(&self, uri: &Uri) -> (usize, usize) {
		let docs = self.docs.read();
		docs.get(uri).map(count).unwrap_or((0, 0))
	}

	/// Drop everything a session ever published. Returns the updated counts
	/// for each affected document, for consumers to repaint.
	pub fn remove_session(&self, session: &SessionId) -> Vec<DiagnosticsEvent> {
		let mut docs = self.docs.write();
		let mut events = Vec::new();
		docs.retain(|uri, per_session| {
			if per_session.remove(session).is_none() {
				return true;
			}
			let (errors, warnings) = count(per_session);
			events.push(DiagnosticsEvent {
				uri: uri.clone(),
				errors,
				warnings,
			});
			!per_session.is_empty()
		});
		if !events.is_empty() {
			self.version.fetch_add(1, Ordering::Release);
		}
		events
	}

	/// Forget a document entirely (editor closed it everywhere).
	pub fn remove_document(&self, uri: &Uri) {
		if self.docs.write().remove(uri).is_some() {
			self.version.fetch_add(1, Ordering::Release);
		}
	}
}

fn count(per_session: &HashMap<SessionId, Vec<Diagnostic>>) -> (usize, usize) {
	let mut errors = 0;
	let mut warnings = 0;
	for diag in per_session.values().flatten() {
		match diag.severity {
			Some(DiagnosticSeverity::ERROR) => errors += 1,
			Some(DiagnosticSeverity::WARNING) => warnings += 1,
			_ => {}
		}
	}
	(errors, warnings)
}

fn severity_rank(diag: &Diagnostic) -> u8 {
	match diag.severity {
		Some(DiagnosticSeverity::ERROR) => 0,
		Some(DiagnosticSeverity::WARNING) => 1,
		Some(DiagnosticSeverity::INFORMATION) => 2,
		Some(DiagnosticSeverity::HINT) => 3,
		_ => 4,
	}
}

#[cfg(test)]
mod tests {
	use lsp_types::{Position, Range};

	use super::*;

	fn uri(s: &str) -> Uri {
		s.parse().expect("uri")
	}

	fn diag(line: u32, severity: DiagnosticSeverity, message: &str) -> Diagnostic {
		Diagnostic {
			range: Range {
				start: Position { line, character: 0 },
				end: Position { line, character: 1 },
			},
			severity: Some(severity),
			message: message.to_owned(),
			..Default::default()
		}
	}

	#[test]
	fn sessions_own_their_slice() {
		let store = DiagnosticsStore::new();
		let doc = uri("file:///app.py");
		let pyright = SessionId::new("pyright", 0);
		let ruff = SessionId::new("ruff", 0);

		store.publish(pyright.clone(), doc.clone(), vec![diag(3, DiagnosticSeverity::ERROR, "type error")]);
		store.publish(ruff.clone(), doc.clone(), vec![diag(1, DiagnosticSeverity::WARNING, "unused import")]);
		assert_eq!(store.counts(&doc), (1, 1));

		// A fresh pyright publish must not disturb ruff's entry.
		let event = store.publish(pyright.clone(), doc.clone(), vec![]);
		assert_eq!(event, DiagnosticsEvent { uri: doc.clone(), errors: 0, warnings: 1 });
		let merged = store.merged(&doc);
		assert_eq!(merged.len(), 1);
		assert_eq!(merged[0].session, ruff);
	}

	#[test]
	fn merged_view_is_deterministically_ordered() {
		let store = DiagnosticsStore::new();
		let doc = uri("file:///app.py");
		let a = SessionId::new("a", 0);
		let b = SessionId::new("b", 0);

		store.publish(b.clone(), doc.clone(), vec![diag(5, DiagnosticSeverity::WARNING, "w"), diag(2, DiagnosticSeverity::ERROR, "e2")]);
		store.publish(a.clone(), doc.clone(), vec![diag(9, DiagnosticSeverity::ERROR, "e9"), diag(5, DiagnosticSeverity::HINT, "h")]);

		let merged = store.merged(&doc);
		let order: Vec<(u32, &str)> = merged.iter().map(|t| (t.diagnostic.range.start.line, t.session.name())).collect();
		// Errors first by line, then the warning, then the hint.
		assert_eq!(order, [(2, "b"), (9, "a"), (5, "b"), (5, "a")]);
	}

	#[test]
	fn removing_a_session_reports_affected_documents() {
		let store = DiagnosticsStore::new();
		let one = uri("file:///one.py");
		let two = uri("file:///two.py");
		let pyright = SessionId::new("pyright", 0);
		let ruff = SessionId::new("ruff", 0);

		store.publish(pyright.clone(), one.clone(), vec![diag(0, DiagnosticSeverity::ERROR, "x")]);
		store.publish(pyright.clone(), two.clone(), vec![diag(0, DiagnosticSeverity::WARNING, "y")]);
		store.publish(ruff.clone(), one.clone(), vec![diag(1, DiagnosticSeverity::WARNING, "z")]);

		let before = store.version();
		let mut events = store.remove_session(&pyright);
		events.sort_by(|a, b| a.uri.as_str().cmp(b.uri.as_str()));
		assert_eq!(
			events,
			[
				DiagnosticsEvent { uri: one.clone(), errors: 0, warnings: 1 },
				DiagnosticsEvent { uri: two.clone(), errors: 0, warnings: 0 },
			]
		);
		assert!(store.version() > before);
		assert_eq!(store.merged(&two), []);
		assert_eq!(store.merged(&one).len(), 1);
	}

	#[test]
	fn generations_are_distinct_publishers() {
		let store = DiagnosticsStore::new();
		let doc = uri("file:///app.py");
		let old = SessionId::new("pyright", 0);
		let new = SessionId::new("pyright", 1);

		store.publish(old.clone(), doc.clone(), vec![diag(0, DiagnosticSeverity::ERROR, "stale")]);
		store.remove_session(&old);
		store.publish(new.clone(), doc.clone(), vec![diag(1, DiagnosticSeverity::ERROR, "fresh")]);

		let merged = store.merged(&doc);
		assert_eq!(merged.len(), 1);
		assert_eq!(merged[0].session, new);
		assert_eq!(merged[0].diagnostic.message, "fresh");
	}
}
