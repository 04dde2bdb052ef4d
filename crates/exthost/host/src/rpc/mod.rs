//! Bidirectional RPC over the persistent protocol.
//!
//! Outbound calls are assigned per-direction correlation ids and await their
//! reply slot; concurrent calls may complete out of order, matched solely by
//! correlation id. Inbound requests fan out to handlers registered per proxy
//! id; each inbound call gets its own cancellation source, cancelled when a
//! `Cancel` frame with the same correlation id arrives.

pub mod uri;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{self, RpcArg, RpcErrorPayload, RpcMessage, WithBuffers};
use vesper_exthost_proto::types::{CorrelationId, ProxyId};

use crate::protocol::ProtocolSender;
use crate::registry::ServiceRegistry;
use uri::UriTransformer;

/// Where encoded RPC frames go. The production sink is the persistent
/// protocol; tests substitute a channel.
pub trait PayloadSink: Send + Sync + 'static {
	/// Hand one encoded RPC envelope to the transport.
	fn send_payload(&self, payload: Vec<u8>);
}

impl PayloadSink for ProtocolSender {
	fn send_payload(&self, payload: Vec<u8>) {
		self.send(payload);
	}
}

/// Fault classification for a failed inbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
	/// The proxy or method index does not resolve to a handler.
	MethodNotFound,
	/// The arguments did not decode or did not match the signature.
	BadArguments,
	/// The handler ran and failed.
	HandlerException,
}

impl FaultKind {
	fn wire_name(self) -> &'static str {
		match self {
			Self::MethodNotFound => "MethodNotFound",
			Self::BadArguments => "BadArguments",
			Self::HandlerException => "HandlerException",
		}
	}
}

/// A failed inbound call, replied as `ReplyErr`; the connection stays up.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceFault {
	/// Fault classification.
	pub kind: FaultKind,
	/// Human-readable description.
	pub message: String,
	/// Stack trace, when one is available.
	pub stack: Option<String>,
}

impl ServiceFault {
	/// An unknown method fault.
	#[must_use]
	pub fn method_not_found(message: impl Into<String>) -> Self {
		Self {
			kind: FaultKind::MethodNotFound,
			message: message.into(),
			stack: None,
		}
	}

	/// A bad-arguments fault.
	#[must_use]
	pub fn bad_arguments(message: impl Into<String>) -> Self {
		Self {
			kind: FaultKind::BadArguments,
			message: message.into(),
			stack: None,
		}
	}

	/// A handler failure.
	#[must_use]
	pub fn handler(message: impl Into<String>) -> Self {
		Self {
			kind: FaultKind::HandlerException,
			message: message.into(),
			stack: None,
		}
	}

	fn into_payload(self) -> RpcErrorPayload {
		RpcErrorPayload {
			kind: self.kind.wire_name().to_string(),
			message: self.message,
			stack: self.stack,
		}
	}
}

/// Future returned by a service handler.
pub type HandlerFuture =
	Pin<Box<dyn Future<Output = Result<WithBuffers<Value>, ServiceFault>> + Send + 'static>>;

/// One registered service shape: a method-table-driven dispatch target.
///
/// Every method is a suspendable task; the cancellation token is a
/// first-class input.
pub trait ServiceHandler: Send + Sync + 'static {
	/// Shape name this handler serves, e.g. `MainThreadCommands`.
	fn shape(&self) -> &'static str;

	/// Invoke the method at `method` index with decoded positional
	/// arguments.
	fn call(&self, method: u8, args: Vec<RpcArg>, token: CancellationToken) -> HandlerFuture;
}

/// Errors surfaced to the local caller of an outbound RPC.
#[derive(Debug, Error)]
pub enum RpcError {
	/// The call's cancellation token fired before a reply arrived.
	#[error("call cancelled")]
	Cancelled,
	/// The RPC manager was disposed before a reply arrived.
	#[error("connection lost")]
	ConnectionLost,
	/// The shape name is not part of either namespace.
	#[error("unknown shape: {0}")]
	UnknownShape(String),
	/// The method is not in the shape's method table.
	#[error("unknown method {method} on {shape}")]
	UnknownMethod {
		/// Target shape name.
		shape: String,
		/// Requested method name.
		method: String,
	},
	/// The peer replied with an error descriptor.
	#[error("remote error: {}: {}", .0.kind, .0.message)]
	Remote(RpcErrorPayload),
}

struct PendingCall {
	tx: oneshot::Sender<Result<WithBuffers<Value>, RpcError>>,
	settled: CancellationToken,
}

struct RpcInner {
	sink: Arc<dyn PayloadSink>,
	registry: Arc<ServiceRegistry>,
	transformer: Option<Arc<dyn UriTransformer>>,
	handlers: Mutex<HashMap<ProxyId, Arc<dyn ServiceHandler>>>,
	next_correlation: AtomicU32,
	pending: Mutex<HashMap<CorrelationId, PendingCall>>,
	inflight: Mutex<HashMap<CorrelationId, CancellationToken>>,
	disposed: AtomicBool,
}

/// Bidirectional RPC dispatcher bound to one connection.
#[derive(Clone)]
pub struct RpcManager {
	inner: Arc<RpcInner>,
}

impl RpcManager {
	/// Create a manager sending frames into `sink`.
	#[must_use]
	pub fn new(
		sink: Arc<dyn PayloadSink>,
		registry: Arc<ServiceRegistry>,
		transformer: Option<Arc<dyn UriTransformer>>,
	) -> Self {
		Self {
			inner: Arc::new(RpcInner {
				sink,
				registry,
				transformer,
				handlers: Mutex::new(HashMap::new()),
				next_correlation: AtomicU32::new(0),
				pending: Mutex::new(HashMap::new()),
				inflight: Mutex::new(HashMap::new()),
				disposed: AtomicBool::new(false),
			}),
		}
	}

	/// Register the handler for its shape's proxy id.
	pub fn register_handler(&self, handler: Arc<dyn ServiceHandler>) {
		let Some(proxy) = self.inner.registry.lookup(handler.shape()) else {
			tracing::warn!(shape = handler.shape(), "handler for unknown shape ignored");
			return;
		};
		self.inner.handlers.lock().unwrap().insert(proxy, handler);
	}

	/// Call `method` on the peer's `shape` with `args`.
	///
	/// The returned future completes once, with the reply value or an
	/// error. Cancelling `token` sends a best-effort `Cancel` frame and
	/// completes the slot with [`RpcError::Cancelled`].
	///
	/// # Errors
	///
	/// Fails locally for unknown shapes/methods, and remotely per the
	/// peer's reply.
	pub async fn call(
		&self,
		shape: &str,
		method: &str,
		args: Vec<RpcArg>,
		token: Option<CancellationToken>,
	) -> Result<WithBuffers<Value>, RpcError> {
		let inner = &self.inner;
		if inner.disposed.load(Ordering::SeqCst) {
			return Err(RpcError::ConnectionLost);
		}
		let proxy = inner
			.registry
			.lookup(shape)
			.ok_or_else(|| RpcError::UnknownShape(shape.to_string()))?;
		let method_index =
			inner
				.registry
				.method_index(shape, method)
				.ok_or_else(|| RpcError::UnknownMethod {
					shape: shape.to_string(),
					method: method.to_string(),
				})?;

		let correlation =
			CorrelationId(inner.next_correlation.fetch_add(1, Ordering::Relaxed) + 1);
		let mut packed = rpc::pack_args(args);
		if let Some(transformer) = &inner.transformer {
			for value in &mut packed.value {
				uri::transform_outgoing_json(transformer.as_ref(), value);
			}
		}

		let (tx, rx) = oneshot::channel();
		let settled = CancellationToken::new();
		inner.pending.lock().unwrap().insert(
			correlation,
			PendingCall {
				tx,
				settled: settled.clone(),
			},
		);

		if let Some(token) = token {
			let weak = Arc::downgrade(inner);
			tokio::spawn(async move {
				tokio::select! {
					() = settled.cancelled() => {}
					() = token.cancelled() => {
						if let Some(inner) = weak.upgrade()
							&& complete_local(&inner, correlation, Err(RpcError::Cancelled))
						{
							inner
								.sink
								.send_payload(RpcMessage::Cancel { correlation }.encode());
						}
					}
				}
			});
		}

		inner.sink.send_payload(
			RpcMessage::Request {
				correlation,
				proxy,
				method: method_index,
				args: packed,
			}
			.encode(),
		);

		rx.await.unwrap_or(Err(RpcError::ConnectionLost))
	}

	/// Feed one payload received from the protocol.
	pub fn handle_incoming(&self, payload: &[u8]) {
		let message = match RpcMessage::decode(payload) {
			Ok(message) => message,
			Err(error) => {
				tracing::warn!(error = %error, "dropping undecodable rpc frame");
				return;
			}
		};
		match message {
			RpcMessage::Request {
				correlation,
				proxy,
				method,
				args,
			} => self.dispatch_request(correlation, proxy, method, args),
			RpcMessage::ReplyOk {
				correlation,
				mut value,
			} => {
				if let Some(transformer) = &self.inner.transformer {
					uri::transform_incoming_json(transformer.as_ref(), &mut value.value);
				}
				if !complete_local(&self.inner, correlation, Ok(value)) {
					tracing::trace!(?correlation, "reply for unknown or settled call");
				}
			}
			RpcMessage::ReplyErr { correlation, error } => {
				if !complete_local(&self.inner, correlation, Err(RpcError::Remote(error))) {
					tracing::trace!(?correlation, "error reply for unknown or settled call");
				}
			}
			RpcMessage::Cancel { correlation } => {
				if let Some(token) = self.inner.inflight.lock().unwrap().get(&correlation) {
					token.cancel();
				}
			}
		}
	}

	fn dispatch_request(
		&self,
		correlation: CorrelationId,
		proxy: ProxyId,
		method: u8,
		mut packed: WithBuffers<Vec<Value>>,
	) {
		let inner = self.inner.clone();
		if let Some(transformer) = &inner.transformer {
			for value in &mut packed.value {
				uri::transform_incoming_json(transformer.as_ref(), value);
			}
		}

		let handler = inner.handlers.lock().unwrap().get(&proxy).cloned();
		let Some(handler) = handler else {
			let shape = inner
				.registry
				.descriptor(proxy)
				.map_or("<unknown>", |descriptor| descriptor.name);
			self.reply_err(
				correlation,
				ServiceFault::method_not_found(format!("no handler for proxy {shape}")),
			);
			return;
		};

		let args = match rpc::unpack_args(packed) {
			Ok(args) => args,
			Err(error) => {
				self.reply_err(
					correlation,
					ServiceFault::bad_arguments(format!("argument decode failed: {error}")),
				);
				return;
			}
		};

		let token = CancellationToken::new();
		inner
			.inflight
			.lock()
			.unwrap()
			.insert(correlation, token.clone());

		let manager = self.clone();
		tokio::spawn(async move {
			let result = handler.call(method, args, token).await;
			manager.inner.inflight.lock().unwrap().remove(&correlation);
			match result {
				Ok(mut value) => {
					if let Some(transformer) = &manager.inner.transformer {
						uri::transform_outgoing_json(transformer.as_ref(), &mut value.value);
					}
					manager
						.inner
						.sink
						.send_payload(RpcMessage::ReplyOk { correlation, value }.encode());
				}
				Err(fault) => manager.reply_err(correlation, fault),
			}
		});
	}

	fn reply_err(&self, correlation: CorrelationId, fault: ServiceFault) {
		tracing::debug!(?correlation, fault = %fault, "inbound call failed");
		self.inner.sink.send_payload(
			RpcMessage::ReplyErr {
				correlation,
				error: fault.into_payload(),
			}
			.encode(),
		);
	}

	/// Fail all pending calls and cancel all inflight inbound work.
	pub fn dispose(&self) {
		if self.inner.disposed.swap(true, Ordering::SeqCst) {
			return;
		}
		let pending: Vec<PendingCall> = {
			let mut map = self.inner.pending.lock().unwrap();
			map.drain().map(|(_, call)| call).collect()
		};
		for call in pending {
			call.settled.cancel();
			let _ = call.tx.send(Err(RpcError::ConnectionLost));
		}
		let inflight: Vec<CancellationToken> = {
			let mut map = self.inner.inflight.lock().unwrap();
			map.drain().map(|(_, token)| token).collect()
		};
		for token in inflight {
			token.cancel();
		}
	}
}

fn complete_local(
	inner: &Arc<RpcInner>,
	correlation: CorrelationId,
	result: Result<WithBuffers<Value>, RpcError>,
) -> bool {
	let Some(call) = inner.pending.lock().unwrap().remove(&correlation) else {
		return false;
	};
	call.settled.cancel();
	let _ = call.tx.send(result);
	true
}
