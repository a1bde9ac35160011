//! Byte-level channels to language server processes.
//!
//! A [`Transport`] owns one peer: either a spawned subprocess speaking over
//! stdin/stdout, or exactly one TCP connection. Framing lives in
//! [`crate::message`]; this module only establishes and tears down the
//! streams.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use crate::config::{ServerConfig, TransportMode};
use crate::{Error, Result};

/// How long a TCP-connect transport keeps retrying before giving up.
const CONNECT_BUDGET: Duration = Duration::from_secs(5);
/// Delay between TCP connect attempts.
const CONNECT_RETRY: Duration = Duration::from_millis(100);
/// How long an editor-owned listener waits for the server to dial in.
const ACCEPT_BUDGET: Duration = Duration::from_secs(10);
/// Grace period between closing the write side and killing the process.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(1);

/// An established channel to one language server.
pub struct Transport {
	/// Buffered read half.
	pub(crate) reader: Box<dyn AsyncBufRead + Send + Unpin>,
	/// Write half. All writes go through a single task, which keeps frames
	/// from interleaving.
	pub(crate) writer: Box<dyn AsyncWrite + Send + Unpin>,
	/// Owned subprocess, if the transport spawned one.
	pub(crate) child: Option<Child>,
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transport")
			.field("has_child", &self.child.is_some())
			.finish_non_exhaustive()
	}
}

impl Transport {
	/// Establish a transport according to the configuration's
	/// [`TransportMode`].
	///
	/// # Errors
	///
	/// [`Error::Spawn`] when the process cannot be started or its pipes
	/// captured; [`Error::Connect`] when the socket cannot be established
	/// within the budget.
	pub async fn connect(config: &ServerConfig) -> Result<Self> {
		match &config.transport {
			TransportMode::Stdio => Self::spawn_stdio(config),
			TransportMode::TcpConnect { port } => Self::connect_tcp(config, *port).await,
			TransportMode::TcpListen { port } => Self::listen_tcp(config, *port).await,
		}
	}

	/// Build a transport from arbitrary streams. Used by tests and by
	/// embedders with their own channel (e.g. in-process servers).
	pub fn from_streams(reader: impl AsyncRead + Send + Unpin + 'static, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
		Self {
			reader: Box::new(BufReader::new(reader)),
			writer: Box::new(writer),
			child: None,
		}
	}

	fn spawn_stdio(config: &ServerConfig) -> Result<Self> {
		let mut child = build_command(config, &config.command)?
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.map_err(|e| spawn_error(config, e.to_string()))?;

		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| spawn_error(config, "failed to capture stdin".into()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| spawn_error(config, "failed to capture stdout".into()))?;

		Ok(Self {
			reader: Box::new(BufReader::new(stdout)),
			writer: Box::new(stdin),
			child: Some(child),
		})
	}

	async fn connect_tcp(config: &ServerConfig, port: u16) -> Result<Self> {
		let child = if config.command.is_empty() {
			None
		} else {
			Some(
				build_command(config, &config.command)?
					.stdin(Stdio::null())
					.stdout(Stdio::null())
					.stderr(Stdio::null())
					.spawn()
					.map_err(|e| spawn_error(config, e.to_string()))?,
			)
		};

		let addr = format!("127.0.0.1:{port}");
		let deadline = tokio::time::Instant::now() + CONNECT_BUDGET;
		let stream = loop {
			match TcpStream::connect(&addr).await {
				Ok(stream) => break stream,
				Err(e) if tokio::time::Instant::now() >= deadline => {
					return Err(Error::Connect {
						addr,
						reason: e.to_string(),
					});
				}
				Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
			}
		};

		Ok(Self::from_tcp(stream, child))
	}

	async fn listen_tcp(config: &ServerConfig, port: Option<u16>) -> Result<Self> {
		let listener = TcpListener::bind(("127.0.0.1", port.unwrap_or(0)))
			.await
			.map_err(|e| Error::Connect {
				addr: format!("127.0.0.1:{}", port.unwrap_or(0)),
				reason: e.to_string(),
			})?;
		let bound_port = listener
			.local_addr()
			.map_err(|e| Error::Connect {
				addr: "127.0.0.1".into(),
				reason: e.to_string(),
			})?
			.port();

		let command: Vec<String> = config
			.command
			.iter()
			.map(|arg| arg.replace("${port}", &bound_port.to_string()))
			.collect();
		let child = build_command(config, &command)?
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn()
			.map_err(|e| spawn_error(config, e.to_string()))?;

		// One peer per transport; further connections are never accepted.
		let accepted = tokio::time::timeout(ACCEPT_BUDGET, listener.accept()).await;
		let (stream, _) = match accepted {
			Ok(Ok(conn)) => conn,
			Ok(Err(e)) => {
				return Err(Error::Connect {
					addr: format!("127.0.0.1:{bound_port}"),
					reason: e.to_string(),
				});
			}
			Err(_) => {
				return Err(Error::Connect {
					addr: format!("127.0.0.1:{bound_port}"),
					reason: "server did not connect within the accept budget".into(),
				});
			}
		};

		Ok(Self::from_tcp(stream, Some(child)))
	}

	fn from_tcp(stream: TcpStream, child: Option<Child>) -> Self {
		let (read, write) = stream.into_split();
		Self {
			reader: Box::new(BufReader::new(read)),
			writer: Box::new(write),
			child,
		}
	}
}

/// How the manager establishes transports. Pluggable so tests can hand out
/// in-memory pipes instead of spawning processes.
#[async_trait::async_trait]
pub trait Connect: Send + Sync {
	async fn connect(&self, config: &ServerConfig) -> Result<Transport>;
}

/// Production connector: spawn or dial according to the configuration.
#[derive(Debug, Default)]
pub struct ProcessConnect;

#[async_trait::async_trait]
impl Connect for ProcessConnect {
	async fn connect(&self, config: &ServerConfig) -> Result<Transport> {
		Transport::connect(config).await
	}
}

fn build_command(config: &ServerConfig, argv: &[String]) -> Result<Command> {
	let program = argv.first().ok_or_else(|| spawn_error(config, "empty command line".into()))?;
	let mut cmd = Command::new(program);
	cmd.args(&argv[1..]).current_dir(&config.root_path).kill_on_drop(true);
	for (key, value) in &config.env {
		cmd.env(key, value);
	}
	Ok(cmd)
}

fn spawn_error(config: &ServerConfig, reason: String) -> Error {
	Error::Spawn {
		command: config.command.join(" "),
		reason,
	}
}

/// Wait for the child to exit after its stdin closed; kill it if it lingers
/// past the grace period.
pub(crate) async fn reap_child(mut child: Child, grace: Duration) {
	if tokio::time::timeout(grace, child.wait()).await.is_err() {
		tracing::warn!("language server did not exit within grace period, killing");
		let _ = child.start_kill();
		let _ = child.wait().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Selector;

	#[test]
	fn port_substitution_covers_every_arg() {
		let args = ["serve".to_string(), "--port=${port}".to_string(), "${port}".to_string()];
		let substituted: Vec<String> = args.iter().map(|a| a.replace("${port}", "4711")).collect();
		assert_eq!(substituted, ["serve", "--port=4711", "4711"]);
	}

	#[test]
	fn empty_command_is_spawn_error() {
		let config = ServerConfig::new("x", Vec::<String>::new(), Selector::new(["source"]), "/tmp");
		match build_command(&config, &config.command) {
			Err(Error::Spawn { .. }) => {}
			other => panic!("expected spawn error, got {:?}", other.map(|_| ())),
		}
	}
}
