//! Static server configurations and document selectors.
//!
//! A [`ServerConfig`] describes how to reach one language server and which
//! documents it should see. Configurations are resolved by the embedding
//! editor and are read-only inputs here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the byte channel to the server is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TransportMode {
	/// Spawn the command and speak over its stdin/stdout.
	Stdio,
	/// Connect as a TCP client to a port the server owns. The command, when
	/// non-empty, is spawned first.
	TcpConnect {
		/// Port the server listens on.
		port: u16,
	},
	/// Listen on an editor-owned port and accept exactly one connection.
	/// `${port}` in the command line is replaced with the bound port.
	TcpListen {
		/// Port to bind, or `None` for an ephemeral port.
		port: Option<u16>,
	},
}

impl Default for TransportMode {
	fn default() -> Self {
		Self::Stdio
	}
}

/// Bounded waits applied to protocol operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timeouts {
	/// `initialize` handshake budget in milliseconds.
	pub initialize_ms: u64,
	/// Per-request budget in milliseconds (0 disables).
	pub request_ms: u64,
	/// `shutdown` handshake budget in milliseconds.
	pub shutdown_ms: u64,
	/// `willSaveWaitUntil` budget in milliseconds.
	pub will_save_wait_until_ms: u64,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			initialize_ms: 30_000,
			request_ms: 30_000,
			shutdown_ms: 3_000,
			will_save_wait_until_ms: 2_000,
		}
	}
}

impl Timeouts {
	/// Initialize handshake budget.
	pub fn initialize(&self) -> Duration {
		Duration::from_millis(self.initialize_ms)
	}

	/// Per-request budget, `None` when disabled.
	pub fn request(&self) -> Option<Duration> {
		(self.request_ms > 0).then(|| Duration::from_millis(self.request_ms))
	}

	/// Shutdown handshake budget.
	pub fn shutdown(&self) -> Duration {
		Duration::from_millis(self.shutdown_ms)
	}

	/// `willSaveWaitUntil` budget.
	pub fn will_save_wait_until(&self) -> Duration {
		Duration::from_millis(self.will_save_wait_until_ms)
	}
}

/// A scope selector: a list of dot-separated scope prefixes.
///
/// A selector matches a document scope when one of its prefixes matches at a
/// component boundary; the specificity of the match is the component count
/// of the longest matching prefix. `source.python` matches scopes
/// `source.python` and `source.python.django` but not `source.pythonx`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(pub Vec<String>);

impl Selector {
	/// Build a selector from scope prefixes.
	pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self(prefixes.into_iter().map(Into::into).collect())
	}

	/// Specificity of the best match against `scope`, or `None` when no
	/// prefix matches.
	pub fn specificity(&self, scope: &str) -> Option<u32> {
		self.0
			.iter()
			.filter_map(|prefix| prefix_specificity(prefix, scope))
			.max()
	}

	/// Whether any prefix matches `scope`.
	pub fn matches(&self, scope: &str) -> bool {
		self.specificity(scope).is_some()
	}
}

fn prefix_specificity(prefix: &str, scope: &str) -> Option<u32> {
	if prefix.is_empty() {
		return None;
	}
	let rest = scope.strip_prefix(prefix)?;
	let boundary = rest.is_empty() || rest.starts_with('.') || rest.starts_with(' ');
	boundary.then(|| prefix.split('.').count() as u32)
}

/// Configuration for one language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
	/// Unique configuration name (e.g. `"pyright"`).
	pub name: String,
	/// Whether this configuration participates in routing at all.
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	/// Command line: program followed by arguments.
	pub command: Vec<String>,
	/// Environment overrides for the spawned process.
	#[serde(default)]
	pub env: HashMap<String, String>,
	/// Transport selection.
	#[serde(default)]
	pub transport: TransportMode,
	/// Documents this server should see.
	pub selector: Selector,
	/// Selector used to break ties for single-result queries. Falls back to
	/// `selector` when absent.
	#[serde(default)]
	pub priority_selector: Option<Selector>,
	/// Accepted URI schemes. Empty means `file` only.
	#[serde(default)]
	pub schemes: Vec<String>,
	/// Workspace root for the server process and `initialize`.
	pub root_path: PathBuf,
	/// Settings pushed via `workspace/didChangeConfiguration` and served in
	/// `workspace/configuration` replies.
	#[serde(default)]
	pub settings: Option<Value>,
	/// Opaque `initializationOptions` for the handshake.
	#[serde(default)]
	pub initialization_options: Option<Value>,
	/// Shut the session down when its last buffer detaches.
	#[serde(default)]
	pub stop_on_idle: bool,
	/// Operation budgets.
	#[serde(default)]
	pub timeouts: Timeouts,
}

fn default_enabled() -> bool {
	true
}

impl ServerConfig {
	/// Create a configuration with defaults for everything but the routing
	/// essentials.
	pub fn new(name: impl Into<String>, command: impl IntoIterator<Item = impl Into<String>>, selector: Selector, root_path: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			enabled: true,
			command: command.into_iter().map(Into::into).collect(),
			env: HashMap::new(),
			transport: TransportMode::Stdio,
			selector,
			priority_selector: None,
			schemes: Vec::new(),
			root_path: root_path.into(),
			settings: None,
			initialization_options: None,
			stop_on_idle: false,
			timeouts: Timeouts::default(),
		}
	}

	/// Set the priority selector.
	pub fn priority_selector(mut self, selector: Selector) -> Self {
		self.priority_selector = Some(selector);
		self
	}

	/// Set environment overrides.
	pub fn env(mut self, env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
		self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
		self
	}

	/// Set the transport mode.
	pub fn transport(mut self, transport: TransportMode) -> Self {
		self.transport = transport;
		self
	}

	/// Set server settings.
	pub fn settings(mut self, settings: Value) -> Self {
		self.settings = Some(settings);
		self
	}

	/// Set initialization options.
	pub fn initialization_options(mut self, options: Value) -> Self {
		self.initialization_options = Some(options);
		self
	}

	/// Enable stop-on-idle.
	pub fn stop_on_idle(mut self, stop: bool) -> Self {
		self.stop_on_idle = stop;
		self
	}

	/// Whether this configuration accepts documents with `scheme`.
	pub fn accepts_scheme(&self, scheme: &str) -> bool {
		if self.schemes.is_empty() {
			scheme == "file"
		} else {
			self.schemes.iter().any(|s| s == scheme)
		}
	}

	/// Specificity of the base selector against a document, gated on
	/// `enabled` and the URI scheme.
	pub fn match_document(&self, scope: &str, scheme: &str) -> Option<u32> {
		if !self.enabled || !self.accepts_scheme(scheme) {
			return None;
		}
		self.selector.specificity(scope)
	}

	/// Specificity of the priority selector (falling back to the base
	/// selector) against a scope.
	pub fn priority_specificity(&self, scope: &str) -> Option<u32> {
		match &self.priority_selector {
			Some(selector) => selector.specificity(scope),
			None => self.selector.specificity(scope),
		}
	}
}
