//! Transport servers: accept guest connections over TCP loopback or UDS.
//!
//! Both variants share the same shape: `start(project_path)` yields the
//! bound port or socket path, `stop()` ends the accept loop. Accepted
//! sockets are handed to the connection sink, which owns wiring them into a
//! host manager.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::paths;

use crate::socket::HostSocket;

/// Wait between accept failures while the server is running.
const ACCEPT_RETRY: Duration = Duration::from_secs(1);

static SOCKET_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where a transport server ended up listening.
#[derive(Debug, Clone)]
pub enum TransportBinding {
	/// Bound loopback TCP endpoint.
	Tcp {
		/// Loopback address.
		host: String,
		/// OS-assigned port.
		port: u16,
	},
	/// Bound Unix domain socket path.
	Uds(PathBuf),
}

/// Receives every accepted connection.
pub type ConnectionSink = Arc<dyn Fn(HostSocket) + Send + Sync>;

struct ServerShared {
	running: AtomicBool,
	shutdown: CancellationToken,
	sink: ConnectionSink,
}

impl ServerShared {
	fn new(sink: ConnectionSink) -> Arc<Self> {
		Arc::new(Self {
			running: AtomicBool::new(false),
			shutdown: CancellationToken::new(),
			sink,
		})
	}

	async fn retry_delay(&self) {
		tokio::select! {
			() = self.shutdown.cancelled() => {}
			() = tokio::time::sleep(ACCEPT_RETRY) => {}
		}
	}
}

/// Accepts guest connections on `127.0.0.1` with an OS-assigned port.
pub struct TcpTransportServer {
	shared: Arc<ServerShared>,
}

impl TcpTransportServer {
	/// Create a server handing accepted sockets to `sink`.
	#[must_use]
	pub fn new(sink: ConnectionSink) -> Self {
		Self {
			shared: ServerShared::new(sink),
		}
	}

	/// Bind and start accepting in a dedicated task.
	///
	/// # Errors
	///
	/// Returns the bind error when the loopback listener cannot be created.
	pub async fn start(&self, project_path: &Path) -> std::io::Result<TransportBinding> {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
		let addr = listener.local_addr()?;
		self.shared.running.store(true, Ordering::SeqCst);
		tracing::info!(project = %project_path.display(), port = addr.port(), "guest transport listening on tcp");

		let shared = self.shared.clone();
		tokio::spawn(async move {
			loop {
				let accepted = tokio::select! {
					() = shared.shutdown.cancelled() => break,
					accepted = listener.accept() => accepted,
				};
				match accepted {
					Ok((stream, peer)) => {
						if let Err(error) = stream.set_nodelay(true) {
							tracing::debug!(error = %error, "could not set nodelay");
						}
						tracing::info!(%peer, "guest connected");
						(shared.sink)(HostSocket::from_tcp(stream, format!("guest-{peer}")));
					}
					Err(error) => {
						if !shared.running.load(Ordering::SeqCst) {
							break;
						}
						tracing::warn!(error = %error, "accept failed, retrying");
						shared.retry_delay().await;
					}
				}
			}
			tracing::debug!("tcp accept loop ended");
		});

		Ok(TransportBinding::Tcp {
			host: "127.0.0.1".to_string(),
			port: addr.port(),
		})
	}

	/// Stop accepting connections.
	pub fn stop(&self) {
		self.shared.running.store(false, Ordering::SeqCst);
		self.shared.shutdown.cancel();
	}
}

/// Accepts guest connections on a uniquely named Unix domain socket.
pub struct UdsTransportServer {
	shared: Arc<ServerShared>,
	socket_path: Mutex<Option<PathBuf>>,
}

impl UdsTransportServer {
	/// Create a server handing accepted sockets to `sink`.
	#[must_use]
	pub fn new(sink: ConnectionSink) -> Self {
		Self {
			shared: ServerShared::new(sink),
			socket_path: Mutex::new(None),
		}
	}

	/// Bind a fresh socket file and start accepting in a dedicated task.
	///
	/// # Errors
	///
	/// Returns the bind error when the socket file cannot be created.
	pub async fn start(&self, project_path: &Path) -> std::io::Result<TransportBinding> {
		let name = format!(
			"vesper-exthost-{}-{}.sock",
			std::process::id(),
			SOCKET_NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
		);
		let path = paths::socket_dir().join(name);
		if path.exists() {
			tokio::fs::remove_file(&path).await?;
		}
		let listener = UnixListener::bind(&path)?;
		*self.socket_path.lock().unwrap() = Some(path.clone());
		self.shared.running.store(true, Ordering::SeqCst);
		tracing::info!(project = %project_path.display(), path = %path.display(), "guest transport listening on uds");

		let shared = self.shared.clone();
		tokio::spawn(async move {
			loop {
				let accepted = tokio::select! {
					() = shared.shutdown.cancelled() => break,
					accepted = listener.accept() => accepted,
				};
				match accepted {
					Ok((stream, _addr)) => {
						tracing::info!("guest connected");
						(shared.sink)(HostSocket::from_unix(stream, "guest-uds"));
					}
					Err(error) => {
						if !shared.running.load(Ordering::SeqCst) {
							break;
						}
						tracing::warn!(error = %error, "accept failed, retrying");
						shared.retry_delay().await;
					}
				}
			}
			tracing::debug!("uds accept loop ended");
		});

		Ok(TransportBinding::Uds(path))
	}

	/// Stop accepting and delete the socket file.
	pub fn stop(&self) {
		self.shared.running.store(false, Ordering::SeqCst);
		self.shared.shutdown.cancel();
		if let Some(path) = self.socket_path.lock().unwrap().take()
			&& let Err(error) = std::fs::remove_file(&path)
			&& error.kind() != std::io::ErrorKind::NotFound
		{
			tracing::warn!(path = %path.display(), error = %error, "could not remove socket file");
		}
	}
}

/// Dial outward to a separately launched guest instead of accepting.
///
/// Diagnostic builds only; production servers always accept.
///
/// # Errors
///
/// Returns the connect error when the guest endpoint is unreachable.
pub async fn connect_debug_host(port: u16) -> std::io::Result<HostSocket> {
	let stream = TcpStream::connect(("127.0.0.1", port)).await?;
	stream.set_nodelay(true)?;
	Ok(HostSocket::from_tcp(stream, format!("debug-host-{port}")))
}

#[cfg(test)]
mod tests {
	use tokio::sync::mpsc;

	use super::*;

	fn collector() -> (ConnectionSink, mpsc::UnboundedReceiver<HostSocket>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(
			Arc::new(move |socket| {
				let _ = tx.send(socket);
			}),
			rx,
		)
	}

	#[tokio::test(flavor = "current_thread")]
	async fn tcp_server_hands_connections_to_the_sink() {
		let (sink, mut accepted) = collector();
		let server = TcpTransportServer::new(sink);
		let binding = server.start(Path::new("/tmp/project")).await.unwrap();
		let TransportBinding::Tcp { host, port } = binding else {
			panic!("expected tcp binding");
		};

		let _client = TcpStream::connect((host.as_str(), port)).await.unwrap();
		let socket = accepted.recv().await.unwrap();
		assert!(socket.is_open());
		server.stop();
	}

	#[tokio::test(flavor = "current_thread")]
	async fn uds_server_binds_and_cleans_up_its_socket_file() {
		let (sink, mut accepted) = collector();
		let server = UdsTransportServer::new(sink);
		let binding = server.start(Path::new("/tmp/project")).await.unwrap();
		let TransportBinding::Uds(path) = binding else {
			panic!("expected uds binding");
		};
		assert!(path.exists());

		let _client = tokio::net::UnixStream::connect(&path).await.unwrap();
		let socket = accepted.recv().await.unwrap();
		assert!(socket.is_open());

		server.stop();
		assert!(!path.exists());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn debug_host_connects_outward() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let accept = tokio::spawn(async move { listener.accept().await });

		let socket = connect_debug_host(port).await.unwrap();
		assert!(socket.is_open());
		accept.await.unwrap().unwrap();
	}
}
