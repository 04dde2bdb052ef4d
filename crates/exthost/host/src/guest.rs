//! Guest process lifecycle: discovery, version gate, spawn, monitor, stop.
//!
//! The guest is a JavaScript runtime executing the extension-host entry
//! script. The host finds a runtime executable, refuses versions below the
//! supported minimum, injects the transport rendezvous into the
//! environment, and watches the merged output stream until exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::config::ProxyConfig;

/// Lowest runtime version the host will spawn.
pub const MIN_RUNTIME_VERSION: RuntimeVersion = RuntimeVersion {
	major: 20,
	minor: 6,
	patch: 0,
};

/// Window for a graceful exit after stop is requested.
const GRACEFUL_STOP: Duration = Duration::from_secs(5);

/// Window for the process to die after forced termination.
const FINALIZE: Duration = Duration::from_secs(2);

/// Executable name of the guest runtime.
const RUNTIME_BINARY: &str = "node";

/// A `major.minor.patch` runtime version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
	/// Major version.
	pub major: u32,
	/// Minor version.
	pub minor: u32,
	/// Patch version.
	pub patch: u32,
}

impl std::fmt::Display for RuntimeVersion {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
	}
}

impl std::str::FromStr for RuntimeVersion {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let trimmed = s.trim().trim_start_matches('v');
		let mut parts = trimmed.split('.');
		let mut next = |name: &str| {
			parts
				.next()
				.ok_or_else(|| format!("missing {name} in version {trimmed:?}"))?
				.parse::<u32>()
				.map_err(|_| format!("non-numeric {name} in version {trimmed:?}"))
		};
		Ok(Self {
			major: next("major")?,
			minor: next("minor")?,
			patch: next("patch")?,
		})
	}
}

/// Guest lifecycle failures.
#[derive(Debug, Error)]
pub enum GuestError {
	/// No runtime executable was found anywhere in the search order.
	#[error("no javascript runtime found")]
	RuntimeNotFound,
	/// `--version` did not produce a parseable version string.
	#[error("cannot read runtime version: {0}")]
	VersionUnreadable(String),
	/// The runtime is older than [`MIN_RUNTIME_VERSION`].
	#[error("runtime version {found} is below the supported minimum {MIN_RUNTIME_VERSION}")]
	VersionUnsupported {
		/// The version the runtime reported.
		found: RuntimeVersion,
	},
	/// The process failed to start.
	#[error("failed to spawn guest: {0}")]
	SpawnFailed(#[from] std::io::Error),
}

/// How the guest should dial back to the host.
#[derive(Debug, Clone)]
pub enum GuestTransport {
	/// Connect to a Unix domain socket at this path.
	Uds(PathBuf),
	/// Connect to a loopback TCP endpoint.
	Tcp {
		/// Host address, always loopback.
		host: String,
		/// Port chosen by the OS.
		port: u16,
	},
}

/// Everything needed to launch one guest.
#[derive(Debug, Clone)]
pub struct GuestConfig {
	/// Extension-host entry script.
	pub entry_script: PathBuf,
	/// Explicit runtime executable, overriding discovery.
	pub runtime: Option<PathBuf>,
	/// Bundled runtime distribution directory, searched first.
	pub bundled_dir: Option<PathBuf>,
	/// Transport rendezvous injected into the environment.
	pub transport: GuestTransport,
	/// Proxy settings injected into the environment.
	pub proxy: ProxyConfig,
}

/// Locate a runtime executable.
///
/// Consults, in order: the explicit override, the bundled distribution,
/// the host process's own directory, and finally `PATH`.
///
/// # Errors
///
/// Returns [`GuestError::RuntimeNotFound`] when no candidate exists.
pub fn locate_runtime(config: &GuestConfig) -> Result<PathBuf, GuestError> {
	if let Some(explicit) = &config.runtime {
		return Ok(explicit.clone());
	}
	if let Some(bundled) = &config.bundled_dir {
		let candidate = bundled.join(RUNTIME_BINARY);
		if candidate.is_file() {
			return Ok(candidate);
		}
	}
	if let Some(beside_host) = std::env::current_exe()
		.ok()
		.and_then(|exe| exe.parent().map(|dir| dir.join(RUNTIME_BINARY)))
		&& beside_host.is_file()
	{
		return Ok(beside_host);
	}
	which::which(RUNTIME_BINARY).map_err(|_| GuestError::RuntimeNotFound)
}

/// Read and parse the runtime's `--version` output.
///
/// # Errors
///
/// Returns [`GuestError::VersionUnreadable`] when the runtime cannot be
/// executed or prints something unparseable.
pub async fn read_runtime_version(runtime: &Path) -> Result<RuntimeVersion, GuestError> {
	let output = tokio::process::Command::new(runtime)
		.arg("--version")
		.output()
		.await
		.map_err(|error| GuestError::VersionUnreadable(error.to_string()))?;
	let text = String::from_utf8_lossy(&output.stdout);
	text.trim()
		.parse()
		.map_err(GuestError::VersionUnreadable)
}

/// Exit outcome of a guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestExit {
	/// Process exit code; `None` when killed by a signal.
	pub code: Option<i32>,
}

struct GuestControl {
	term_tx: oneshot::Sender<()>,
	done_rx: oneshot::Receiver<()>,
}

/// A spawned guest runtime process.
pub struct GuestProcess {
	control: Mutex<Option<GuestControl>>,
	exit: watch::Receiver<Option<GuestExit>>,
	pid: Option<u32>,
}

impl GuestProcess {
	/// Spawn the guest after discovery and version check.
	///
	/// Stderr is merged into stdout; a monitor thread copies the merged
	/// stream into the log and the exit code is surfaced through
	/// [`GuestProcess::exit_state`].
	///
	/// # Errors
	///
	/// Fails for missing or too-old runtimes and for spawn failures.
	pub async fn spawn(config: &GuestConfig) -> Result<Self, GuestError> {
		let runtime = locate_runtime(config)?;
		let version = read_runtime_version(&runtime).await?;
		if version < MIN_RUNTIME_VERSION {
			return Err(GuestError::VersionUnsupported { found: version });
		}
		tracing::info!(runtime = %runtime.display(), %version, "guest runtime selected");

		let (socket_host, socket_port, will_send_socket) = match &config.transport {
			GuestTransport::Uds(_) => (String::new(), 0u16, false),
			GuestTransport::Tcp { host, port } => (host.clone(), *port, true),
		};

		let mut command = tokio::process::Command::new(&runtime);
		command
			.arg(&config.entry_script)
			.arg(format!("--socket-port={socket_port}"))
			.arg(format!("--socket-host={socket_host}"))
			.arg(format!(
				"--will-send-socket={}",
				u8::from(will_send_socket)
			))
			.stdin(Stdio::null());

		match &config.transport {
			GuestTransport::Uds(path) => {
				command.env("SOCKET_HOOK", path);
			}
			GuestTransport::Tcp { host, port } => {
				command.env("WILL_SEND_SOCKET", "1");
				command.env("SOCKET_HOST", host);
				command.env("SOCKET_PORT", port.to_string());
			}
		}
		for (key, value) in config.proxy.env_vars() {
			command.env(key, value);
		}
		command.env("PATH", augmented_path());

		// Merge stderr into stdout through one pipe; a monitor thread
		// drains it into the log.
		let (pipe_reader, pipe_writer) = os_pipe::pipe()?;
		let writer_clone = pipe_writer.try_clone()?;
		command.stdout(Stdio::from(pipe_writer));
		command.stderr(Stdio::from(writer_clone));

		let mut child = command.spawn()?;
		let pid = child.id();
		tracing::info!(?pid, "guest spawned");

		std::thread::Builder::new()
			.name("guest-output".to_string())
			.spawn(move || {
				use std::io::BufRead;
				let reader = std::io::BufReader::new(pipe_reader);
				for line in reader.lines() {
					match line {
						Ok(line) => tracing::info!(target: "vesper_exthost::guest", "{line}"),
						Err(_) => break,
					}
				}
			})
			.ok();

		let (term_tx, mut term_rx) = oneshot::channel();
		let (done_tx, done_rx) = oneshot::channel();
		let (exit_tx, exit_rx) = watch::channel(None);

		tokio::spawn(async move {
			let code = tokio::select! {
				status = child.wait() => status.ok().and_then(|status| status.code()),
				_ = &mut term_rx => {
					match tokio::time::timeout(GRACEFUL_STOP, child.wait()).await {
						Ok(status) => status.ok().and_then(|status| status.code()),
						Err(_) => {
							tracing::warn!("guest ignored graceful stop, killing");
							let _ = child.start_kill();
							match tokio::time::timeout(FINALIZE, child.wait()).await {
								Ok(status) => status.ok().and_then(|status| status.code()),
								Err(_) => None,
							}
						}
					}
				}
			};
			tracing::info!(?code, "guest exited");
			let _ = exit_tx.send(Some(GuestExit { code }));
			let _ = done_tx.send(());
		});

		Ok(Self {
			control: Mutex::new(Some(GuestControl { term_tx, done_rx })),
			exit: exit_rx,
			pid,
		})
	}

	/// OS process id, when the process started.
	#[must_use]
	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// Watch the exit outcome; `None` until the process exits.
	#[must_use]
	pub fn exit_state(&self) -> watch::Receiver<Option<GuestExit>> {
		self.exit.clone()
	}

	/// Stop the guest: graceful window first, then forced termination.
	/// Idempotent; later calls return immediately.
	pub async fn stop(&self) {
		let Some(control) = self.control.lock().unwrap().take() else {
			return;
		};
		let _ = control.term_tx.send(());
		let _ = control.done_rx.await;
	}
}

fn augmented_path() -> std::ffi::OsString {
	let mut entries: Vec<PathBuf> = std::env::var_os("PATH")
		.map(|path| std::env::split_paths(&path).collect())
		.unwrap_or_default();
	if let Some(home) = dirs::home_dir() {
		for extra in [
			home.join(".npm-global/bin"),
			home.join(".yarn/bin"),
			home.join(".local/share/pnpm"),
		] {
			if !entries.contains(&extra) {
				entries.push(extra);
			}
		}
	}
	for extra in [PathBuf::from("/usr/local/bin"), PathBuf::from("/opt/homebrew/bin")] {
		if !entries.contains(&extra) {
			entries.push(extra);
		}
	}
	std::env::join_paths(entries).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_parse_accepts_v_prefix() {
		let version: RuntimeVersion = "v20.6.0".parse().unwrap();
		assert_eq!(
			version,
			RuntimeVersion {
				major: 20,
				minor: 6,
				patch: 0,
			}
		);
		assert_eq!("22.11.3".parse::<RuntimeVersion>().unwrap().major, 22);
	}

	#[test]
	fn version_parse_rejects_garbage() {
		assert!("banana".parse::<RuntimeVersion>().is_err());
		assert!("20.6".parse::<RuntimeVersion>().is_err());
		assert!("20.x.0".parse::<RuntimeVersion>().is_err());
	}

	#[test]
	fn version_ordering_gates_the_minimum() {
		let old: RuntimeVersion = "18.19.1".parse().unwrap();
		let exact: RuntimeVersion = "20.6.0".parse().unwrap();
		let newer: RuntimeVersion = "21.0.0".parse().unwrap();
		assert!(old < MIN_RUNTIME_VERSION);
		assert!(exact >= MIN_RUNTIME_VERSION);
		assert!(newer >= MIN_RUNTIME_VERSION);
	}

	#[test]
	fn explicit_runtime_override_wins() {
		let config = GuestConfig {
			entry_script: PathBuf::from("main.js"),
			runtime: Some(PathBuf::from("/custom/node")),
			bundled_dir: Some(PathBuf::from("/nonexistent")),
			transport: GuestTransport::Tcp {
				host: "127.0.0.1".to_string(),
				port: 1,
			},
			proxy: ProxyConfig::default(),
		};
		assert_eq!(
			locate_runtime(&config).unwrap(),
			PathBuf::from("/custom/node")
		);
	}

	#[test]
	fn augmented_path_keeps_existing_entries() {
		let joined = augmented_path();
		let entries: Vec<PathBuf> = std::env::split_paths(&joined).collect();
		if let Some(original) = std::env::var_os("PATH") {
			for entry in std::env::split_paths(&original) {
				assert!(entries.contains(&entry));
			}
		}
		assert!(entries.contains(&PathBuf::from("/usr/local/bin")));
	}
}
