//! Socket abstraction: one shape over TCP loopback and Unix domain sockets.
//!
//! A [`HostSocket`] owns the underlying stream plus an inbound reader task
//! and an outbound writer task. Inbound bytes fan out synchronously to all
//! `on_data` listeners from the reader task, which preserves delivery order;
//! listeners must not block. Writes are enqueued and never block the caller.
//!
//! State machine:
//!
//! ```text
//!   Created ── start ──► Running
//!   Running ── EOF ──► HalfClosedRemote ── 30 s ──► Closed
//!   Running ── end() ──► HalfClosedLocal
//!   HalfClosedLocal ∧ EOF ──► Closed
//!   Running ── error ──► Closed
//! ```

use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Grace period between remote EOF and hard-closing the descriptor.
const EOF_GRACE: Duration = Duration::from_secs(30);

/// Size of the reader's scratch buffer.
const READ_CHUNK: usize = 8 * 1024;

/// Transport kind behind a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
	/// Connection-oriented byte stream (TCP).
	Stream,
	/// Sequenced-packet socket.
	SeqPacket,
	/// Local-domain (Unix) socket.
	Local,
}

/// Handle returned by listener registration; pass back to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Listener set with copy-on-iteration so a dispatcher can mutate its own
/// set, and panic isolation so one listener cannot take down the reader.
struct Listeners<F: ?Sized> {
	entries: Mutex<Vec<(ListenerId, Arc<F>)>>,
}

impl<F: ?Sized> Default for Listeners<F> {
	fn default() -> Self {
		Self {
			entries: Mutex::new(Vec::new()),
		}
	}
}

impl<F: ?Sized> Listeners<F> {
	fn add(&self, next_id: &AtomicU64, listener: Arc<F>) -> ListenerId {
		let id = ListenerId(next_id.fetch_add(1, Ordering::Relaxed));
		self.entries.lock().unwrap().push((id, listener));
		id
	}

	fn remove(&self, id: ListenerId) {
		self.entries.lock().unwrap().retain(|(lid, _)| *lid != id);
	}

	fn snapshot(&self) -> Vec<Arc<F>> {
		self.entries
			.lock()
			.unwrap()
			.iter()
			.map(|(_, listener)| listener.clone())
			.collect()
	}
}

enum WriteCmd {
	Data(Vec<u8>),
	Flush(oneshot::Sender<()>),
	End,
}

#[derive(Debug, Default)]
struct Flags {
	can_write: bool,
	input_closed: bool,
	output_closed: bool,
	disposed: bool,
}

struct SocketShared {
	label: String,
	kind: SocketKind,
	write_tx: mpsc::UnboundedSender<WriteCmd>,
	flags: Mutex<Flags>,
	next_listener_id: AtomicU64,
	data_listeners: Listeners<dyn Fn(&[u8]) + Send + Sync>,
	end_listeners: Listeners<dyn Fn() + Send + Sync>,
	close_listeners: Listeners<dyn Fn(bool) + Send + Sync>,
	end_fired: AtomicBool,
	close_fired: AtomicBool,
	shutdown: CancellationToken,
}

/// Byte-oriented duplex stream with uniform semantics over TCP and UDS.
#[derive(Clone)]
pub struct HostSocket {
	shared: Arc<SocketShared>,
}

impl std::fmt::Debug for HostSocket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HostSocket")
			.field("label", &self.shared.label)
			.field("kind", &self.shared.kind)
			.finish_non_exhaustive()
	}
}

impl HostSocket {
	/// Wrap an accepted TCP stream.
	#[must_use]
	pub fn from_tcp(stream: TcpStream, label: impl Into<String>) -> Self {
		let (read, write) = stream.into_split();
		Self::from_stream(read, write, SocketKind::Stream, label)
	}

	/// Wrap an accepted Unix domain stream.
	#[must_use]
	pub fn from_unix(stream: UnixStream, label: impl Into<String>) -> Self {
		let (read, write) = stream.into_split();
		Self::from_stream(read, write, SocketKind::Local, label)
	}

	/// Wrap arbitrary read/write halves. Used by the transports above and by
	/// tests running over in-memory duplex pipes.
	#[must_use]
	pub fn from_stream(
		read: impl AsyncRead + Send + Unpin + 'static,
		write: impl AsyncWrite + Send + Unpin + 'static,
		kind: SocketKind,
		label: impl Into<String>,
	) -> Self {
		let label = label.into();
		let (write_tx, write_rx) = mpsc::unbounded_channel();
		let shared = Arc::new(SocketShared {
			label,
			kind,
			write_tx,
			flags: Mutex::new(Flags {
				can_write: true,
				..Flags::default()
			}),
			next_listener_id: AtomicU64::new(1),
			data_listeners: Listeners::default(),
			end_listeners: Listeners::default(),
			close_listeners: Listeners::default(),
			end_fired: AtomicBool::new(false),
			close_fired: AtomicBool::new(false),
			shutdown: CancellationToken::new(),
		});
		tracing::debug!(label = %shared.label, kind = ?shared.kind, "socket created");

		let socket = Self { shared };
		socket.start_receiving(read);
		socket.start_writing(write, write_rx);
		socket
	}

	/// Debug label given at construction.
	#[must_use]
	pub fn label(&self) -> &str {
		&self.shared.label
	}

	/// Transport kind behind this socket.
	#[must_use]
	pub fn kind(&self) -> SocketKind {
		self.shared.kind
	}

	/// Whether the socket has not been closed.
	#[must_use]
	pub fn is_open(&self) -> bool {
		!self.shared.flags.lock().unwrap().disposed
	}

	/// Whether the remote side has stopped sending.
	#[must_use]
	pub fn is_input_closed(&self) -> bool {
		self.shared.flags.lock().unwrap().input_closed
	}

	/// Whether the local side has stopped sending.
	#[must_use]
	pub fn is_output_closed(&self) -> bool {
		self.shared.flags.lock().unwrap().output_closed
	}

	/// Register a synchronous inbound-data listener.
	pub fn on_data(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> ListenerId {
		self.shared
			.data_listeners
			.add(&self.shared.next_listener_id, Arc::new(listener))
	}

	/// Register a listener for remote EOF. Fires at most once.
	pub fn on_end(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
		self.shared
			.end_listeners
			.add(&self.shared.next_listener_id, Arc::new(listener))
	}

	/// Register a close listener; receives whether the close followed an error.
	pub fn on_close(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
		self.shared
			.close_listeners
			.add(&self.shared.next_listener_id, Arc::new(listener))
	}

	/// Remove a previously registered data listener.
	pub fn remove_on_data(&self, id: ListenerId) {
		self.shared.data_listeners.remove(id);
	}

	/// Remove a previously registered end listener.
	pub fn remove_on_end(&self, id: ListenerId) {
		self.shared.end_listeners.remove(id);
	}

	/// Remove a previously registered close listener.
	pub fn remove_on_close(&self, id: ListenerId) {
		self.shared.close_listeners.remove(id);
	}

	/// Queue bytes for transmission.
	///
	/// A no-op after `end()`, after disposal, or after loss of the write
	/// side; a closed socket never raises to the caller.
	pub fn write(&self, bytes: Vec<u8>) {
		{
			let flags = self.shared.flags.lock().unwrap();
			if !flags.can_write || flags.disposed {
				tracing::trace!(label = %self.shared.label, "write dropped on closed socket");
				return;
			}
		}
		let _ = self.shared.write_tx.send(WriteCmd::Data(bytes));
	}

	/// Half-close the outbound side. No further payload may be written.
	pub fn end(&self) {
		let became_closed = {
			let mut flags = self.shared.flags.lock().unwrap();
			if flags.output_closed {
				return;
			}
			flags.output_closed = true;
			flags.can_write = false;
			flags.input_closed
		};
		let _ = self.shared.write_tx.send(WriteCmd::End);
		if became_closed {
			self.shared.hard_close(false);
		}
	}

	/// Force a flush of all queued writes.
	pub async fn drain(&self) {
		let (tx, rx) = oneshot::channel();
		if self.shared.write_tx.send(WriteCmd::Flush(tx)).is_err() {
			return;
		}
		let _ = rx.await;
	}

	/// Release the socket's resources. Idempotent.
	pub fn dispose(&self) {
		self.shared.hard_close(false);
	}

	fn start_receiving(&self, mut read: impl AsyncRead + Send + Unpin + 'static) {
		let shared = self.shared.clone();
		tokio::spawn(async move {
			let mut scratch = vec![0u8; READ_CHUNK];
			loop {
				tokio::select! {
					() = shared.shutdown.cancelled() => break,
					result = read.read(&mut scratch) => match result {
						Ok(0) => {
							shared.handle_eof();
							break;
						}
						Ok(n) => shared.emit_data(&scratch[..n]),
						Err(error) => {
							shared.handle_error(&error);
							break;
						}
					},
				}
			}
		});
	}

	fn start_writing(
		&self,
		mut write: impl AsyncWrite + Send + Unpin + 'static,
		mut rx: mpsc::UnboundedReceiver<WriteCmd>,
	) {
		let shared = self.shared.clone();
		tokio::spawn(async move {
			loop {
				let cmd = tokio::select! {
					() = shared.shutdown.cancelled() => break,
					cmd = rx.recv() => match cmd {
						Some(cmd) => cmd,
						None => break,
					},
				};
				match cmd {
					WriteCmd::Data(bytes) => {
						if let Err(error) = write.write_all(&bytes).await {
							shared.handle_error(&error);
							break;
						}
					}
					WriteCmd::Flush(ack) => {
						let _ = write.flush().await;
						let _ = ack.send(());
					}
					WriteCmd::End => {
						let _ = write.shutdown().await;
					}
				}
			}
		});
	}
}

impl SocketShared {
	fn emit_data(&self, bytes: &[u8]) {
		for listener in self.data_listeners.snapshot() {
			let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(bytes)));
			if result.is_err() {
				tracing::warn!(label = %self.label, "data listener panicked");
			}
		}
	}

	fn handle_eof(self: &Arc<Self>) {
		if self.end_fired.swap(true, Ordering::SeqCst) {
			return;
		}
		let locally_half_closed = {
			let mut flags = self.flags.lock().unwrap();
			flags.input_closed = true;
			flags.can_write = false;
			flags.output_closed
		};
		tracing::debug!(label = %self.label, "remote end of stream");
		for listener in self.end_listeners.snapshot() {
			let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener()));
			if result.is_err() {
				tracing::warn!(label = %self.label, "end listener panicked");
			}
		}

		if locally_half_closed {
			self.hard_close(false);
			return;
		}

		let shared = self.clone();
		tokio::spawn(async move {
			tokio::select! {
				() = shared.shutdown.cancelled() => {}
				() = tokio::time::sleep(EOF_GRACE) => shared.hard_close(false),
			}
		});
	}

	fn handle_error(self: &Arc<Self>, error: &std::io::Error) {
		let demoted = matches!(
			error.kind(),
			ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
		);
		if demoted {
			tracing::info!(label = %self.label, error = %error, "socket closed by peer");
		} else {
			tracing::warn!(label = %self.label, error = %error, "socket error");
		}
		self.hard_close(true);
	}

	fn hard_close(&self, had_error: bool) {
		{
			let mut flags = self.flags.lock().unwrap();
			if flags.disposed {
				return;
			}
			flags.disposed = true;
			flags.can_write = false;
		}
		self.shutdown.cancel();
		if self.close_fired.swap(true, Ordering::SeqCst) {
			return;
		}
		tracing::debug!(label = %self.label, had_error, "socket closed");
		for listener in self.close_listeners.snapshot() {
			let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(had_error)));
			if result.is_err() {
				tracing::warn!(label = %self.label, "close listener panicked");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	fn pipe_pair() -> (HostSocket, tokio::io::DuplexStream) {
		let (ours, theirs) = tokio::io::duplex(64 * 1024);
		let (read, write) = tokio::io::split(ours);
		(
			HostSocket::from_stream(read, write, SocketKind::Stream, "test"),
			theirs,
		)
	}

	#[tokio::test(flavor = "current_thread")]
	async fn data_fans_out_to_listeners() {
		let (socket, mut peer) = pipe_pair();
		let (tx, mut rx) = mpsc::unbounded_channel();
		socket.on_data(move |bytes| {
			let _ = tx.send(bytes.to_vec());
		});

		tokio::io::AsyncWriteExt::write_all(&mut peer, b"hello")
			.await
			.unwrap();
		assert_eq!(rx.recv().await.unwrap(), b"hello");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn end_fires_exactly_once() {
		let (socket, peer) = pipe_pair();
		let fired = Arc::new(AtomicUsize::new(0));
		let fired2 = fired.clone();
		let (tx, mut rx) = mpsc::unbounded_channel();
		socket.on_end(move || {
			fired2.fetch_add(1, Ordering::SeqCst);
			let _ = tx.send(());
		});

		drop(peer);
		rx.recv().await.unwrap();
		// Give any duplicate a chance to fire.
		tokio::task::yield_now().await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
		assert!(socket.is_input_closed());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn writes_after_end_are_dropped() {
		let (socket, mut peer) = pipe_pair();
		socket.write(b"first".to_vec());
		socket.drain().await;
		socket.end();
		socket.write(b"second".to_vec());
		socket.drain().await;

		let mut received = vec![0u8; 5];
		tokio::io::AsyncReadExt::read_exact(&mut peer, &mut received)
			.await
			.unwrap();
		assert_eq!(&received, b"first");
		// The write half is shut; the peer sees EOF rather than "second".
		let n = tokio::io::AsyncReadExt::read(&mut peer, &mut received)
			.await
			.unwrap();
		assert_eq!(n, 0);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn listener_panic_is_swallowed() {
		let (socket, mut peer) = pipe_pair();
		let (tx, mut rx) = mpsc::unbounded_channel();
		socket.on_data(|_| panic!("bad listener"));
		socket.on_data(move |bytes| {
			let _ = tx.send(bytes.to_vec());
		});

		tokio::io::AsyncWriteExt::write_all(&mut peer, b"x")
			.await
			.unwrap();
		assert_eq!(rx.recv().await.unwrap(), b"x");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn dispose_is_idempotent_and_fires_close_once() {
		let (socket, _peer) = pipe_pair();
		let closes = Arc::new(AtomicUsize::new(0));
		let closes2 = closes.clone();
		socket.on_close(move |_| {
			closes2.fetch_add(1, Ordering::SeqCst);
		});

		socket.dispose();
		socket.dispose();
		assert!(!socket.is_open());
		assert_eq!(closes.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn local_end_plus_remote_eof_closes() {
		let (socket, peer) = pipe_pair();
		let (tx, mut rx) = mpsc::unbounded_channel();
		socket.on_close(move |had_error| {
			let _ = tx.send(had_error);
		});

		socket.end();
		drop(peer);
		assert_eq!(rx.recv().await.unwrap(), false);
		assert!(!socket.is_open());
	}
}
