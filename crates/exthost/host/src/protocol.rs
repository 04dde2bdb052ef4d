//! Persistent framed protocol over a [`HostSocket`].
//!
//! Frames carry a 13-byte header plus payload. Payload frames get strictly
//! monotonic per-direction ids and stay in an outgoing log until the peer
//! acknowledges them; a reconnecting peer asks for everything it missed with
//! a `ReplayRequest` and receives the unacked log in original order. The
//! peer can pause upward delivery for backpressure, and a responsiveness
//! state tracks whether acknowledgements arrive within a deadline.
//!
//! Loss of the underlying socket is not fatal: the protocol switches to a
//! waiting-for-reconnect mode where sends accumulate in the log, until a
//! fresh socket is attached via [`PersistentProtocol::begin_accept_reconnection`].
//! Only a `Disconnect` frame, a framing fault, or an impossible replay tears
//! the protocol down.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::frame::{FrameHeader, FrameKind, HEADER_LEN};

use crate::chunks::ChunkBuffer;
use crate::socket::{HostSocket, ListenerId};

/// No traffic for this long while sends remain unacked marks the peer
/// unresponsive.
pub const UNRESPONSIVE_AFTER: Duration = Duration::from_secs(3);

/// A received payload frame is acknowledged at the latest this long after
/// arrival, even with no outbound traffic to piggyback on.
const ACK_DELAY: Duration = Duration::from_secs(2);

/// Idle interval between keep-alive frames.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval of the responsiveness checker.
const RESPONSIVENESS_POLL: Duration = Duration::from_millis(500);

/// Observable peer state derived from acknowledgement latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responsiveness {
	/// The peer is acknowledging traffic within the deadline.
	Responsive,
	/// Sends remain unacked past [`UNRESPONSIVE_AFTER`].
	Unresponsive,
}

/// Callback receiving every upward-dispatched payload, in receive order.
pub type MessageCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct LoggedFrame {
	id: u32,
	kind: FrameKind,
	payload: Vec<u8>,
}

struct AttachedSocket {
	socket: HostSocket,
	data_listener: ListenerId,
	end_listener: ListenerId,
	close_listener: ListenerId,
}

impl AttachedSocket {
	fn detach(self) -> HostSocket {
		self.socket.remove_on_data(self.data_listener);
		self.socket.remove_on_end(self.end_listener);
		self.socket.remove_on_close(self.close_listener);
		self.socket
	}
}

struct ProtoState {
	socket: Option<AttachedSocket>,
	incoming: ChunkBuffer,
	pending_header: Option<FrameHeader>,
	/// Last id assigned to an outgoing payload frame.
	next_out_id: u32,
	/// Highest payload-frame id received from the peer.
	last_in_id: u32,
	/// Highest incoming id we have acknowledged on the wire.
	last_acked_in: u32,
	/// Sent payload frames the peer has not acknowledged yet.
	outgoing: VecDeque<LoggedFrame>,
	paused: bool,
	held: VecDeque<Vec<u8>>,
	reconnecting: bool,
	disposed: bool,
	last_traffic: tokio::time::Instant,
	ack_scheduled: bool,
}

struct ProtocolInner {
	state: Mutex<ProtoState>,
	on_message: MessageCallback,
	responsive_tx: watch::Sender<Responsiveness>,
	closed: CancellationToken,
}

/// Framed, acknowledged, replayable messaging over one logical connection.
#[derive(Clone)]
pub struct PersistentProtocol {
	inner: Arc<ProtocolInner>,
}

enum Outcome {
	Deliver(Vec<u8>),
	Fatal(&'static str),
}

impl PersistentProtocol {
	/// Create a protocol over `socket`, dispatching payloads to `on_message`.
	#[must_use]
	pub fn new(socket: HostSocket, on_message: MessageCallback) -> Self {
		let (responsive_tx, _) = watch::channel(Responsiveness::Responsive);
		let inner = Arc::new(ProtocolInner {
			state: Mutex::new(ProtoState {
				socket: None,
				incoming: ChunkBuffer::new(),
				pending_header: None,
				next_out_id: 0,
				last_in_id: 0,
				last_acked_in: 0,
				outgoing: VecDeque::new(),
				paused: false,
				held: VecDeque::new(),
				reconnecting: false,
				disposed: false,
				last_traffic: tokio::time::Instant::now(),
				ack_scheduled: false,
			}),
			on_message,
			responsive_tx,
			closed: CancellationToken::new(),
		});

		let protocol = Self { inner };
		protocol.attach_socket(socket);
		protocol.spawn_keepalive();
		protocol.spawn_responsiveness_checker();
		protocol
	}

	/// Send a payload as a `Regular` frame.
	pub fn send(&self, payload: Vec<u8>) {
		self.send_payload(FrameKind::Regular, payload);
	}

	/// Send a payload as a `Control` frame (handshake bytes).
	pub fn send_control(&self, payload: Vec<u8>) {
		self.send_payload(FrameKind::Control, payload);
	}

	/// Ask the peer to stop delivering payloads upward.
	pub fn send_pause(&self) {
		self.send_housekeeping(FrameKind::Pause, Vec::new());
	}

	/// Ask the peer to resume delivery.
	pub fn send_resume(&self) {
		self.send_housekeeping(FrameKind::Resume, Vec::new());
	}

	/// Announce an orderly disconnect. The peer releases its resources.
	pub fn send_disconnect(&self) {
		self.send_housekeeping(FrameKind::Disconnect, Vec::new());
	}

	/// Attach a fresh socket after the previous one was lost.
	///
	/// Sends a `ReplayRequest` for everything not yet received and
	/// retransmits the local unacked log in original order. `initial_bytes`
	/// are bytes already read from the new socket before handover.
	pub fn begin_accept_reconnection(&self, socket: HostSocket, initial_bytes: &[u8]) {
		{
			let mut state = self.inner.state.lock().unwrap();
			if state.disposed {
				return;
			}
			if let Some(attached) = state.socket.take() {
				attached.detach().dispose();
			}
			state.pending_header = None;
			state.incoming = ChunkBuffer::new();
		}

		self.attach_socket(socket);

		let replay_from = {
			let mut state = self.inner.state.lock().unwrap();
			state.reconnecting = false;
			state.last_traffic = tokio::time::Instant::now();
			state.last_in_id + 1
		};
		self.send_housekeeping(FrameKind::ReplayRequest, replay_from.to_be_bytes().to_vec());

		{
			let mut state = self.inner.state.lock().unwrap();
			let state = &mut *state;
			let ack = state.last_in_id;
			if let Some(attached) = &state.socket {
				for frame in &state.outgoing {
					write_frame(&attached.socket, frame.kind, frame.id, ack, &frame.payload);
				}
				state.last_acked_in = ack;
			}
		}

		if !initial_bytes.is_empty() {
			Self::process_data(&self.inner, initial_bytes);
		}
	}

	/// Number of sent payload frames not yet acknowledged by the peer.
	#[must_use]
	pub fn unacknowledged_count(&self) -> usize {
		self.inner.state.lock().unwrap().outgoing.len()
	}

	/// Whether the protocol is waiting for a reconnection.
	#[must_use]
	pub fn is_waiting_for_reconnect(&self) -> bool {
		self.inner.state.lock().unwrap().reconnecting
	}

	/// Observable responsiveness state.
	#[must_use]
	pub fn responsiveness(&self) -> watch::Receiver<Responsiveness> {
		self.inner.responsive_tx.subscribe()
	}

	/// Token cancelled when the protocol closes for good.
	#[must_use]
	pub fn closed(&self) -> CancellationToken {
		self.inner.closed.clone()
	}

	/// Release all resources. Idempotent; further sends are dropped.
	pub fn dispose(&self) {
		let socket = {
			let mut state = self.inner.state.lock().unwrap();
			if state.disposed {
				return;
			}
			state.disposed = true;
			state.outgoing.clear();
			state.held.clear();
			state.socket.take().map(AttachedSocket::detach)
		};
		if let Some(socket) = socket {
			socket.dispose();
		}
		self.inner.closed.cancel();
	}

	fn attach_socket(&self, socket: HostSocket) {
		let weak = Arc::downgrade(&self.inner);
		let data_listener = socket.on_data({
			let weak = weak.clone();
			move |bytes| {
				if let Some(inner) = weak.upgrade() {
					Self::process_data(&inner, bytes);
				}
			}
		});
		let end_listener = socket.on_end({
			let weak = weak.clone();
			move || {
				if let Some(inner) = weak.upgrade() {
					Self::handle_socket_loss(&inner);
				}
			}
		});
		let close_listener = socket.on_close({
			let weak = weak.clone();
			move |_had_error| {
				if let Some(inner) = weak.upgrade() {
					Self::handle_socket_loss(&inner);
				}
			}
		});

		let mut state = self.inner.state.lock().unwrap();
		state.socket = Some(AttachedSocket {
			socket,
			data_listener,
			end_listener,
			close_listener,
		});
	}

	fn send_payload(&self, kind: FrameKind, payload: Vec<u8>) {
		let mut state = self.inner.state.lock().unwrap();
		let state = &mut *state;
		if state.disposed {
			return;
		}
		state.next_out_id += 1;
		let id = state.next_out_id;
		let ack = state.last_in_id;
		state.outgoing.push_back(LoggedFrame {
			id,
			kind,
			payload: payload.clone(),
		});
		if !state.reconnecting
			&& let Some(attached) = &state.socket
		{
			write_frame(&attached.socket, kind, id, ack, &payload);
			state.last_acked_in = ack;
		}
	}

	fn send_housekeeping(&self, kind: FrameKind, payload: Vec<u8>) {
		let mut state = self.inner.state.lock().unwrap();
		let state = &mut *state;
		if state.disposed || state.reconnecting {
			return;
		}
		let ack = state.last_in_id;
		if let Some(attached) = &state.socket {
			write_frame(&attached.socket, kind, 0, ack, &payload);
			state.last_acked_in = ack;
		}
	}

	fn process_data(inner: &Arc<ProtocolInner>, bytes: &[u8]) {
		let mut outcomes = Vec::new();
		let became_responsive;
		{
			let mut state = inner.state.lock().unwrap();
			if state.disposed {
				return;
			}
			state.incoming.append(bytes.to_vec());
			state.last_traffic = tokio::time::Instant::now();
			became_responsive =
				*inner.responsive_tx.borrow() == Responsiveness::Unresponsive;

			loop {
				if state.pending_header.is_none() {
					if state.incoming.len() < HEADER_LEN {
						break;
					}
					let raw = state.incoming.read(HEADER_LEN).unwrap_or_default();
					let mut header_bytes = [0u8; HEADER_LEN];
					header_bytes.copy_from_slice(&raw);
					match FrameHeader::decode(&header_bytes) {
						Ok(header) => state.pending_header = Some(header),
						Err(error) => {
							tracing::error!(error = %error, "framing fault, closing connection");
							outcomes.push(Outcome::Fatal("framing error"));
							break;
						}
					}
				}

				let Some(header) = state.pending_header else {
					break;
				};
				if state.incoming.len() < header.len as usize {
					break;
				}
				let payload = state.incoming.read(header.len as usize).unwrap_or_default();
				state.pending_header = None;

				Self::apply_frame(inner, &mut state, header, payload, &mut outcomes);
				if outcomes
					.iter()
					.any(|outcome| matches!(outcome, Outcome::Fatal(_)))
				{
					break;
				}
			}
		}

		if became_responsive {
			let _ = inner
				.responsive_tx
				.send(Responsiveness::Responsive);
		}
		for outcome in outcomes {
			match outcome {
				Outcome::Deliver(payload) => (inner.on_message)(payload),
				Outcome::Fatal(reason) => {
					Self::fatal_close(inner, reason);
					return;
				}
			}
		}
	}

	fn apply_frame(
		inner: &Arc<ProtocolInner>,
		state: &mut ProtoState,
		header: FrameHeader,
		payload: Vec<u8>,
		outcomes: &mut Vec<Outcome>,
	) {
		// The ack field of any frame trims the outgoing log.
		while state
			.outgoing
			.front()
			.is_some_and(|frame| frame.id <= header.ack)
		{
			state.outgoing.pop_front();
		}

		match header.kind {
			FrameKind::Regular | FrameKind::Control => {
				if header.id <= state.last_in_id {
					// Replay overlap; already processed.
					return;
				}
				state.last_in_id = header.id;
				Self::schedule_ack(inner, state);
				if state.paused {
					state.held.push_back(payload);
				} else {
					outcomes.push(Outcome::Deliver(payload));
				}
			}
			FrameKind::Ack | FrameKind::KeepAlive | FrameKind::None => {}
			FrameKind::Pause => state.paused = true,
			FrameKind::Resume => {
				state.paused = false;
				while let Some(held) = state.held.pop_front() {
					outcomes.push(Outcome::Deliver(held));
				}
			}
			FrameKind::Disconnect => {
				tracing::debug!("peer announced disconnect");
				outcomes.push(Outcome::Fatal("peer disconnected"));
			}
			FrameKind::ReplayRequest => {
				if payload.len() != 4 {
					outcomes.push(Outcome::Fatal("malformed replay request"));
					return;
				}
				let from = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
				// Everything below the requested id is implicitly acked.
				while state
					.outgoing
					.front()
					.is_some_and(|frame| frame.id < from)
				{
					state.outgoing.pop_front();
				}
				if state
					.outgoing
					.front()
					.is_some_and(|frame| frame.id > from)
				{
					tracing::error!(from, "replay exhausted, requested id already trimmed");
					outcomes.push(Outcome::Fatal("replay exhausted"));
					return;
				}
				let ack = state.last_in_id;
				if let Some(attached) = &state.socket {
					let socket = attached.socket.clone();
					for frame in &state.outgoing {
						write_frame(&socket, frame.kind, frame.id, ack, &frame.payload);
					}
					state.last_acked_in = ack;
				}
			}
		}
	}

	fn schedule_ack(inner: &Arc<ProtocolInner>, state: &mut ProtoState) {
		if state.ack_scheduled {
			return;
		}
		state.ack_scheduled = true;
		let weak = Arc::downgrade(inner);
		tokio::spawn(async move {
			tokio::time::sleep(ACK_DELAY).await;
			let Some(inner) = weak.upgrade() else {
				return;
			};
			let mut state = inner.state.lock().unwrap();
			let state = &mut *state;
			state.ack_scheduled = false;
			if state.disposed || state.reconnecting || state.last_acked_in >= state.last_in_id {
				return;
			}
			let ack = state.last_in_id;
			if let Some(attached) = &state.socket {
				write_frame(&attached.socket, FrameKind::Ack, 0, ack, &[]);
				state.last_acked_in = ack;
			}
		});
	}

	fn handle_socket_loss(inner: &Arc<ProtocolInner>) {
		let mut state = inner.state.lock().unwrap();
		if state.disposed || state.reconnecting {
			return;
		}
		tracing::info!("socket lost, waiting for reconnection");
		state.reconnecting = true;
		state.pending_header = None;
		state.incoming = ChunkBuffer::new();
		if let Some(attached) = state.socket.take() {
			attached.detach();
		}
	}

	fn fatal_close(inner: &Arc<ProtocolInner>, reason: &str) {
		let socket = {
			let mut state = inner.state.lock().unwrap();
			if state.disposed {
				return;
			}
			tracing::debug!(reason, "protocol closed");
			state.disposed = true;
			state.outgoing.clear();
			state.held.clear();
			state.socket.take().map(AttachedSocket::detach)
		};
		if let Some(socket) = socket {
			socket.dispose();
		}
		inner.closed.cancel();
	}

	fn spawn_keepalive(&self) {
		let weak = Arc::downgrade(&self.inner);
		let closed = self.inner.closed.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = closed.cancelled() => break,
					() = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
				}
				let Some(inner) = weak.upgrade() else {
					break;
				};
				let mut state = inner.state.lock().unwrap();
				let state = &mut *state;
				if state.disposed {
					break;
				}
				if state.reconnecting {
					continue;
				}
				let ack = state.last_in_id;
				if let Some(attached) = &state.socket {
					write_frame(&attached.socket, FrameKind::KeepAlive, 0, ack, &[]);
					state.last_acked_in = ack;
				}
			}
		});
	}

	fn spawn_responsiveness_checker(&self) {
		let weak = Arc::downgrade(&self.inner);
		let closed = self.inner.closed.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = closed.cancelled() => break,
					() = tokio::time::sleep(RESPONSIVENESS_POLL) => {}
				}
				let Some(inner) = weak.upgrade() else {
					break;
				};
				let verdict = {
					let state = inner.state.lock().unwrap();
					if state.disposed {
						break;
					}
					let silent = state.last_traffic.elapsed() >= UNRESPONSIVE_AFTER;
					if !state.outgoing.is_empty() && silent {
						Responsiveness::Unresponsive
					} else {
						Responsiveness::Responsive
					}
				};
				inner.responsive_tx.send_if_modified(|current| {
					if *current == verdict {
						false
					} else {
						*current = verdict;
						true
					}
				});
			}
		});
	}
}

fn write_frame(socket: &HostSocket, kind: FrameKind, id: u32, ack: u32, payload: &[u8]) {
	let header = FrameHeader {
		kind,
		id,
		ack,
		len: payload.len() as u32,
	};
	let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
	bytes.extend_from_slice(&header.encode());
	bytes.extend_from_slice(payload);
	socket.write(bytes);
}

/// Weak handle used by layers above to send without keeping the protocol
/// alive.
#[derive(Clone)]
pub struct ProtocolSender {
	inner: Weak<ProtocolInner>,
}

impl ProtocolSender {
	/// Send a payload as a `Regular` frame, if the protocol is still alive.
	pub fn send(&self, payload: Vec<u8>) {
		if let Some(inner) = self.inner.upgrade() {
			PersistentProtocol { inner }.send(payload);
		}
	}
}

impl PersistentProtocol {
	/// A weak sending handle for upper layers.
	#[must_use]
	pub fn sender(&self) -> ProtocolSender {
		ProtocolSender {
			inner: Arc::downgrade(&self.inner),
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
	use tokio::sync::mpsc;
	use vesper_exthost_proto::frame::FramingError;

	use super::*;
	use crate::socket::SocketKind;

	struct Peer {
		stream: DuplexStream,
		next_id: u32,
		last_seen: u32,
	}

	impl Peer {
		async fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) {
			let id = if kind.is_replayable() {
				self.next_id += 1;
				self.next_id
			} else {
				0
			};
			let header = FrameHeader {
				kind,
				id,
				ack: self.last_seen,
				len: payload.len() as u32,
			};
			self.stream.write_all(&header.encode()).await.unwrap();
			self.stream.write_all(payload).await.unwrap();
		}

		async fn send_ack(&mut self, ack: u32) {
			let header = FrameHeader {
				kind: FrameKind::Ack,
				id: 0,
				ack,
				len: 0,
			};
			self.stream.write_all(&header.encode()).await.unwrap();
		}

		/// Read frames until one carries a payload-bearing kind.
		async fn read_payload_frame(&mut self) -> (FrameHeader, Vec<u8>) {
			loop {
				let (header, payload) = self.read_frame().await;
				if header.kind.is_replayable() {
					self.last_seen = header.id;
					return (header, payload);
				}
			}
		}

		async fn read_frame(&mut self) -> (FrameHeader, Vec<u8>) {
			let mut header_bytes = [0u8; HEADER_LEN];
			self.stream.read_exact(&mut header_bytes).await.unwrap();
			let header = FrameHeader::decode(&header_bytes).unwrap();
			let mut payload = vec![0u8; header.len as usize];
			self.stream.read_exact(&mut payload).await.unwrap();
			(header, payload)
		}
	}

	fn connect() -> (PersistentProtocol, Peer, mpsc::UnboundedReceiver<Vec<u8>>) {
		let (ours, theirs) = tokio::io::duplex(64 * 1024);
		let (read, write) = tokio::io::split(ours);
		let socket = HostSocket::from_stream(read, write, SocketKind::Stream, "proto-test");
		let (tx, rx) = mpsc::unbounded_channel();
		let protocol = PersistentProtocol::new(
			socket,
			Arc::new(move |payload| {
				let _ = tx.send(payload);
			}),
		);
		(
			protocol,
			Peer {
				stream: theirs,
				next_id: 0,
				last_seen: 0,
			},
			rx,
		)
	}

	#[tokio::test(flavor = "current_thread")]
	async fn delivers_regular_frames_in_order() {
		let (_protocol, mut peer, mut rx) = connect();
		peer.send_frame(FrameKind::Regular, b"one").await;
		peer.send_frame(FrameKind::Regular, b"two").await;
		assert_eq!(rx.recv().await.unwrap(), b"one");
		assert_eq!(rx.recv().await.unwrap(), b"two");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn duplicate_ids_are_dropped() {
		let (_protocol, mut peer, mut rx) = connect();
		let header = FrameHeader {
			kind: FrameKind::Regular,
			id: 1,
			ack: 0,
			len: 3,
		};
		for _ in 0..2 {
			peer.stream.write_all(&header.encode()).await.unwrap();
			peer.stream.write_all(b"dup").await.unwrap();
		}
		peer.send_frame(FrameKind::KeepAlive, &[]).await;
		assert_eq!(rx.recv().await.unwrap(), b"dup");
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn acks_trim_the_outgoing_log() {
		let (protocol, mut peer, _rx) = connect();
		protocol.send(b"a".to_vec());
		protocol.send(b"b".to_vec());
		protocol.send(b"c".to_vec());
		assert_eq!(protocol.unacknowledged_count(), 3);

		// Consume the frames so the pipe does not fill up.
		for _ in 0..3 {
			peer.read_payload_frame().await;
		}
		peer.send_ack(2).await;

		// Wait until the ack has been processed.
		tokio::time::timeout(Duration::from_secs(1), async {
			while protocol.unacknowledged_count() != 1 {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
	}

	#[tokio::test(flavor = "current_thread")]
	async fn pause_holds_delivery_until_resume() {
		let (_protocol, mut peer, mut rx) = connect();
		peer.send_frame(FrameKind::Pause, &[]).await;
		peer.send_frame(FrameKind::Regular, b"held").await;
		peer.stream.flush().await.unwrap();
		tokio::task::yield_now().await;
		assert!(rx.try_recv().is_err());

		peer.send_frame(FrameKind::Resume, &[]).await;
		assert_eq!(rx.recv().await.unwrap(), b"held");
	}

	#[tokio::test(flavor = "current_thread")]
	async fn reconnect_replays_unacked_frames_in_order() {
		let (protocol, mut peer, _rx) = connect();
		for payload in [b"m1", b"m2", b"m3", b"m4"] {
			protocol.send(payload.to_vec());
		}
		for _ in 0..4 {
			peer.read_payload_frame().await;
		}
		// Peer acknowledges the first two frames, then the socket dies.
		peer.send_ack(2).await;
		tokio::time::timeout(Duration::from_secs(1), async {
			while protocol.unacknowledged_count() != 2 {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
		drop(peer);

		tokio::time::timeout(Duration::from_secs(1), async {
			while !protocol.is_waiting_for_reconnect() {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();

		let (ours, theirs) = tokio::io::duplex(64 * 1024);
		let (read, write) = tokio::io::split(ours);
		let socket = HostSocket::from_stream(read, write, SocketKind::Stream, "proto-test-2");
		protocol.begin_accept_reconnection(socket, &[]);

		let mut peer = Peer {
			stream: theirs,
			next_id: 0,
			last_seen: 0,
		};
		// First a replay request for everything we have not sent.
		let (header, payload) = peer.read_frame().await;
		assert_eq!(header.kind, FrameKind::ReplayRequest);
		assert_eq!(payload, 1u32.to_be_bytes());
		// Then frames 3 and 4 in original order; 1 and 2 stay retired.
		let (header, payload) = peer.read_payload_frame().await;
		assert_eq!((header.id, payload.as_slice()), (3, b"m3".as_slice()));
		let (header, payload) = peer.read_payload_frame().await;
		assert_eq!((header.id, payload.as_slice()), (4, b"m4".as_slice()));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn replay_request_resends_from_requested_id() {
		let (protocol, mut peer, _rx) = connect();
		for payload in [b"r1", b"r2", b"r3"] {
			protocol.send(payload.to_vec());
		}
		for _ in 0..3 {
			peer.read_payload_frame().await;
		}
		peer.send_frame(FrameKind::ReplayRequest, &2u32.to_be_bytes())
			.await;
		let (header, payload) = peer.read_payload_frame().await;
		assert_eq!((header.id, payload.as_slice()), (2, b"r2".as_slice()));
		let (header, payload) = peer.read_payload_frame().await;
		assert_eq!((header.id, payload.as_slice()), (3, b"r3".as_slice()));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn framing_fault_is_fatal() {
		let (protocol, mut peer, _rx) = connect();
		let mut bogus = [0u8; HEADER_LEN];
		bogus[0] = 0x7f;
		assert!(matches!(
			FrameHeader::decode(&bogus),
			Err(FramingError::UnknownKind(0x7f))
		));
		peer.stream.write_all(&bogus).await.unwrap();
		protocol.closed().cancelled().await;
	}

	#[tokio::test(flavor = "current_thread")]
	async fn disconnect_frame_is_fatal() {
		let (protocol, mut peer, _rx) = connect();
		peer.send_frame(FrameKind::Disconnect, &[]).await;
		protocol.closed().cancelled().await;
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn unacked_silence_marks_unresponsive() {
		let (protocol, mut peer, _rx) = connect();
		let mut responsiveness = protocol.responsiveness();
		protocol.send(b"ping".to_vec());
		peer.read_payload_frame().await;

		tokio::time::timeout(Duration::from_secs(10), async {
			loop {
				responsiveness.changed().await.unwrap();
				if *responsiveness.borrow() == Responsiveness::Unresponsive {
					break;
				}
			}
		})
		.await
		.unwrap();

		// Any frame restores responsiveness.
		peer.send_ack(1).await;
		tokio::time::timeout(Duration::from_secs(10), async {
			loop {
				responsiveness.changed().await.unwrap();
				if *responsiveness.borrow() == Responsiveness::Responsive {
					break;
				}
			}
		})
		.await
		.unwrap();
	}

	#[tokio::test(flavor = "current_thread")]
	async fn received_regulars_are_acked_without_outbound_traffic() {
		let (_protocol, mut peer, mut rx) = connect();
		peer.send_frame(FrameKind::Regular, b"needs-ack").await;
		assert_eq!(rx.recv().await.unwrap(), b"needs-ack");

		// The delayed ack (or a keep-alive) must carry ack = 1.
		let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
		loop {
			assert!(tokio::time::Instant::now() < deadline);
			let (header, _) = peer.read_frame().await;
			if header.ack >= 1 {
				break;
			}
		}
	}
}
