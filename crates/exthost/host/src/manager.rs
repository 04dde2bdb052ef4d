//! Host manager: owns one guest connection's life.
//!
//! Construction receives a socket plus the project path. `start` registers
//! the configured extensions, frames the socket with a persistent protocol,
//! and drives the three-message handshake:
//!
//! | incoming | action |
//! |---|---|
//! | *Ready* | build the init blob and send it |
//! | *Initialized* | wire RPC, register services, attach the mirror, activate extensions |
//! | *Terminate* | begin shutdown |
//! | other 1-byte payload | log as unknown control frame |
//! | longer payloads | RPC frames, handed to the RPC layer |

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::init::{
	EnvironmentData, ExtensionDescription, ExtensionsData, InitData, WorkspaceData, WorkspaceFolder,
};
use vesper_exthost_proto::rpc::RpcArg;
use vesper_exthost_proto::types::control;
use vesper_exthost_proto::{paths, shapes};

use crate::config::HostConfig;
use crate::load::LoadMonitor;
use crate::mirror::{DeltaBatch, DeltaSink, EditorMirror, LoggingWorkbench, WorkbenchEditors};
use crate::protocol::PersistentProtocol;
use crate::registry::ServiceRegistry;
use crate::rpc::RpcManager;
use crate::secrets::SecretStore;
use crate::services::{ServiceContext, build_host_services, commands::CommandRegistry, storage::StorageState};
use crate::socket::HostSocket;

/// Inventory of extensions registered for activation.
#[derive(Debug, Default)]
pub struct ExtensionCatalog {
	entries: Mutex<Vec<ExtensionDescription>>,
}

impl ExtensionCatalog {
	/// Register an extension; identifiers are unique, later wins.
	pub fn register(&self, description: ExtensionDescription) {
		let mut entries = self.entries.lock().unwrap();
		entries.retain(|entry| entry.identifier != description.identifier);
		entries.push(description);
	}

	/// All registered extensions.
	#[must_use]
	pub fn all(&self) -> Vec<ExtensionDescription> {
		self.entries.lock().unwrap().clone()
	}
}

/// Process-wide collaborators, passed down explicitly so tests can build
/// isolated instances.
pub struct HostContext {
	/// Host configuration snapshot.
	pub config: HostConfig,
	/// Interned proxy identifiers.
	pub registry: Arc<ServiceRegistry>,
	/// Process load estimator.
	pub load: Arc<LoadMonitor>,
	/// Product secret store.
	pub secrets: Arc<SecretStore>,
	/// Host command registry.
	pub commands: Arc<CommandRegistry>,
	/// Persistent extension storage.
	pub storage: Arc<StorageState>,
	/// Extension inventory.
	pub extensions: ExtensionCatalog,
}

impl HostContext {
	/// Context with production collaborators.
	#[must_use]
	pub fn new(config: HostConfig) -> Arc<Self> {
		Arc::new(Self {
			config,
			registry: Arc::new(ServiceRegistry::new()),
			load: LoadMonitor::new(),
			secrets: Arc::new(SecretStore::open_default()),
			commands: Arc::new(CommandRegistry::default()),
			storage: Arc::new(StorageState::new(paths::product_dir().join("storage.json"))),
			extensions: ExtensionCatalog::default(),
		})
	}

	/// Context with an isolated secret store and no tick thread.
	#[doc(hidden)]
	#[must_use]
	pub fn for_tests(config: HostConfig, secrets: Arc<SecretStore>, storage: Arc<StorageState>) -> Arc<Self> {
		Arc::new(Self {
			config,
			registry: Arc::new(ServiceRegistry::new()),
			load: LoadMonitor::new_manual(),
			secrets,
			commands: Arc::new(CommandRegistry::default()),
			storage,
			extensions: ExtensionCatalog::default(),
		})
	}
}

/// Where a connection is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
	/// Waiting for the guest's *Ready* byte.
	AwaitingReady,
	/// Init blob sent; waiting for *Initialized*.
	AwaitingInitialized,
	/// RPC wired, services registered, extensions activating.
	Running,
	/// Connection torn down.
	Closed,
}

struct ManagerInner {
	context: Arc<HostContext>,
	project_path: PathBuf,
	socket: HostSocket,
	workbench: Arc<dyn WorkbenchEditors>,
	protocol: OnceLock<PersistentProtocol>,
	rpc: OnceLock<RpcManager>,
	mirror: OnceLock<EditorMirror>,
	phase: Mutex<HandshakePhase>,
	tasks: CancellationToken,
}

/// Owner of one guest connection.
#[derive(Clone)]
pub struct HostManager {
	inner: Arc<ManagerInner>,
}

impl HostManager {
	/// Manager for `socket`, serving `project_path`.
	#[must_use]
	pub fn new(context: Arc<HostContext>, project_path: PathBuf, socket: HostSocket) -> Self {
		Self::with_workbench(context, project_path, socket, Arc::new(LoggingWorkbench))
	}

	/// Manager with an explicit workbench collaborator.
	#[must_use]
	pub fn with_workbench(
		context: Arc<HostContext>,
		project_path: PathBuf,
		socket: HostSocket,
		workbench: Arc<dyn WorkbenchEditors>,
	) -> Self {
		Self {
			inner: Arc::new(ManagerInner {
				context,
				project_path,
				socket,
				workbench,
				protocol: OnceLock::new(),
				rpc: OnceLock::new(),
				mirror: OnceLock::new(),
				phase: Mutex::new(HandshakePhase::AwaitingReady),
				tasks: CancellationToken::new(),
			}),
		}
	}

	/// Register configured extensions and begin driving the handshake.
	pub fn start(&self) {
		if self.inner.context.load.has_high_load() {
			tracing::warn!("accepting guest connection under high process load");
		}
		for extension in &self.inner.context.config.extensions {
			self.inner.context.extensions.register(extension.clone());
		}

		let weak = Arc::downgrade(&self.inner);
		let protocol = PersistentProtocol::new(
			self.inner.socket.clone(),
			Arc::new(move |payload| {
				if let Some(inner) = weak.upgrade() {
					ManagerInner::handle_payload(&inner, payload);
				}
			}),
		);
		let _ = self.inner.protocol.set(protocol);
		tracing::info!(project = %self.inner.project_path.display(), "host manager started");
	}

	/// Current handshake phase.
	#[must_use]
	pub fn phase(&self) -> HandshakePhase {
		*self.inner.phase.lock().unwrap()
	}

	/// The connection's mirror, once the handshake completed.
	#[must_use]
	pub fn mirror(&self) -> Option<EditorMirror> {
		self.inner.mirror.get().cloned()
	}

	/// Whether the underlying protocol lost its socket and awaits a new one.
	#[must_use]
	pub fn is_waiting_for_reconnect(&self) -> bool {
		self.inner
			.protocol
			.get()
			.is_some_and(PersistentProtocol::is_waiting_for_reconnect)
	}

	/// Hand a freshly accepted socket to the waiting protocol.
	pub fn accept_reconnection(&self, socket: HostSocket) {
		if let Some(protocol) = self.inner.protocol.get() {
			protocol.begin_accept_reconnection(socket, &[]);
		}
	}

	/// Ask the guest to shut down.
	pub fn send_terminate(&self) {
		if let Some(protocol) = self.inner.protocol.get() {
			protocol.send_control(vec![control::TERMINATE]);
		}
	}

	/// Tear the connection down: scoped tasks, RPC, protocol, socket,
	/// in that order. Idempotent.
	pub fn dispose(&self) {
		{
			let mut phase = self.inner.phase.lock().unwrap();
			if *phase == HandshakePhase::Closed {
				return;
			}
			*phase = HandshakePhase::Closed;
		}
		self.inner.tasks.cancel();
		if let Some(rpc) = self.inner.rpc.get() {
			rpc.dispose();
		}
		if let Some(protocol) = self.inner.protocol.get() {
			protocol.dispose();
		}
		self.inner.socket.dispose();
		tracing::info!("host manager disposed");
	}
}

impl ManagerInner {
	fn handle_payload(inner: &Arc<Self>, payload: Vec<u8>) {
		if payload.len() == 1 {
			match payload[0] {
				control::READY => Self::on_ready(inner),
				control::INITIALIZED => Self::on_initialized(inner),
				control::TERMINATE => {
					tracing::info!("guest requested termination");
					HostManager {
						inner: inner.clone(),
					}
					.dispose();
				}
				other => tracing::warn!(byte = other, "unknown control frame"),
			}
			return;
		}

		if let Some(rpc) = inner.rpc.get() {
			rpc.handle_incoming(&payload);
		} else {
			tracing::debug!(len = payload.len(), "dropping rpc frame before handshake completed");
		}
	}

	fn on_ready(inner: &Arc<Self>) {
		{
			let mut phase = inner.phase.lock().unwrap();
			if *phase != HandshakePhase::AwaitingReady {
				tracing::warn!(phase = ?*phase, "unexpected Ready");
				return;
			}
			*phase = HandshakePhase::AwaitingInitialized;
		}

		let init = Self::build_init(inner);
		match serde_json::to_vec(&init) {
			Ok(blob) => {
				tracing::debug!(bytes = blob.len(), "sending init blob");
				if let Some(protocol) = inner.protocol.get() {
					protocol.send(blob);
				}
			}
			Err(error) => tracing::error!(error = %error, "init blob serialization failed"),
		}
	}

	fn build_init(inner: &Arc<Self>) -> InitData {
		let config = &inner.context.config;
		let project = &inner.project_path;
		let name = project
			.file_name()
			.map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().into_owned());
		let mut hasher = DefaultHasher::new();
		project.hash(&mut hasher);
		let id = format!("{name}-{:016x}", hasher.finish());
		let uri = url::Url::from_file_path(project)
			.map(String::from)
			.unwrap_or_else(|()| format!("file://{}", project.display()));

		InitData {
			commit: config.commit.clone(),
			version: config.version.clone(),
			environment: EnvironmentData {
				app_name: config.app_name.clone(),
				app_root: config.app_root.display().to_string(),
				app_settings_home: paths::product_dir().display().to_string(),
			},
			workspace: WorkspaceData {
				id,
				name: name.clone(),
				folders: vec![WorkspaceFolder {
					uri,
					name,
					index: 0,
				}],
			},
			extensions: ExtensionsData {
				all_extensions: inner.context.extensions.all(),
			},
			configuration: config.configuration_bundle(),
		}
	}

	fn on_initialized(inner: &Arc<Self>) {
		{
			let mut phase = inner.phase.lock().unwrap();
			if *phase != HandshakePhase::AwaitingInitialized {
				tracing::warn!(phase = ?*phase, "unexpected Initialized");
				return;
			}
			*phase = HandshakePhase::Running;
		}

		let Some(protocol) = inner.protocol.get() else {
			return;
		};
		let rpc = RpcManager::new(
			Arc::new(protocol.sender()),
			inner.context.registry.clone(),
			None,
		);
		let mirror = EditorMirror::new(
			Arc::new(RpcDeltaSink { rpc: rpc.clone() }),
			inner.workbench.clone(),
		);

		let service_context = ServiceContext {
			mirror: mirror.clone(),
			secrets: inner.context.secrets.clone(),
			commands: inner.context.commands.clone(),
			storage: inner.context.storage.clone(),
		};
		for handler in build_host_services(&service_context) {
			rpc.register_handler(handler);
		}

		let _ = inner.rpc.set(rpc.clone());
		let _ = inner.mirror.set(mirror);
		tracing::info!("rpc wired, services registered");

		let extensions = inner.context.extensions.all();
		let scope = inner.tasks.clone();
		tokio::spawn(async move {
			for extension in extensions {
				let activate = rpc.call(
					shapes::guest::EXTENSION_SERVICE,
					"activate",
					vec![
						RpcArg::Json(json!(extension.identifier)),
						RpcArg::Json(json!({ "startup": true, "activationEvent": null })),
					],
					None,
				);
				tokio::select! {
					() = scope.cancelled() => return,
					result = activate => {
						if let Err(error) = result {
							tracing::error!(
								extension = %extension.identifier,
								error = %error,
								"extension activation failed"
							);
						}
					}
				}
			}
		});
	}
}

/// Ships mirror deltas to the guest over RPC, in category order.
struct RpcDeltaSink {
	rpc: RpcManager,
}

impl DeltaSink for RpcDeltaSink {
	fn ship(&self, batch: DeltaBatch) -> Pin<Box<dyn Future<Output = ()> + Send>> {
		let rpc = self.rpc.clone();
		Box::pin(async move {
			if let Some(structural) = batch.structural {
				let payload = serde_json::to_value(&structural).unwrap_or_default();
				if let Err(error) = rpc
					.call(
						shapes::guest::DOCUMENTS_AND_EDITORS,
						"acceptDocumentsAndEditorsDelta",
						vec![RpcArg::Json(payload)],
						None,
					)
					.await
				{
					tracing::warn!(error = %error, "structural delta not delivered");
					return;
				}
			}
			for (id, delta) in batch.editor_properties {
				let payload = serde_json::to_value(&delta).unwrap_or_default();
				if let Err(error) = rpc
					.call(
						shapes::guest::EDITORS,
						"acceptEditorPropertiesChanged",
						vec![RpcArg::Json(json!(id.0)), RpcArg::Json(payload)],
						None,
					)
					.await
				{
					tracing::warn!(error = %error, "editor properties delta not delivered");
				}
			}
			for change in batch.content_changes {
				let payload = serde_json::to_value(&change).unwrap_or_default();
				if let Err(error) = rpc
					.call(
						shapes::guest::DOCUMENTS,
						"acceptModelChanged",
						vec![RpcArg::Json(json!(change.uri)), RpcArg::Json(payload)],
						None,
					)
					.await
				{
					tracing::warn!(error = %error, "content delta not delivered");
				}
			}
		})
	}
}

/// Routes accepted sockets: reconnecting guests back to their waiting
/// manager, fresh guests to a fresh manager.
pub struct HostSupervisor {
	context: Arc<HostContext>,
	project_path: PathBuf,
	managers: Mutex<Vec<HostManager>>,
}

impl HostSupervisor {
	/// Supervisor for one project.
	#[must_use]
	pub fn new(context: Arc<HostContext>, project_path: PathBuf) -> Arc<Self> {
		Arc::new(Self {
			context,
			project_path,
			managers: Mutex::new(Vec::new()),
		})
	}

	/// Connection sink to plug into a transport server.
	#[must_use]
	pub fn connection_sink(self: &Arc<Self>) -> crate::server::ConnectionSink {
		let supervisor = self.clone();
		Arc::new(move |socket| supervisor.accept(socket))
	}

	fn accept(&self, socket: HostSocket) {
		{
			let managers = self.managers.lock().unwrap();
			if let Some(waiting) = managers
				.iter()
				.find(|manager| manager.is_waiting_for_reconnect())
			{
				tracing::info!("routing reconnecting guest to existing manager");
				waiting.accept_reconnection(socket);
				return;
			}
		}
		let manager = HostManager::new(
			self.context.clone(),
			self.project_path.clone(),
			socket,
		);
		manager.start();
		self.managers.lock().unwrap().push(manager);
	}

	/// Ask every guest to terminate, then tear all managers down.
	pub fn shutdown(&self) {
		let managers: Vec<HostManager> = self.managers.lock().unwrap().drain(..).collect();
		for manager in &managers {
			manager.send_terminate();
		}
		for manager in managers {
			manager.dispose();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde_json::Value;
	use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
	use vesper_exthost_proto::frame::{FrameHeader, FrameKind, HEADER_LEN};
	use vesper_exthost_proto::rpc::{RpcMessage, WithBuffers};

	use super::*;
	use crate::socket::SocketKind;

	struct GuestSide {
		stream: DuplexStream,
		next_id: u32,
		last_seen: u32,
	}

	impl GuestSide {
		async fn send_payload(&mut self, kind: FrameKind, payload: &[u8]) {
			self.next_id += 1;
			let header = FrameHeader {
				kind,
				id: self.next_id,
				ack: self.last_seen,
				len: payload.len() as u32,
			};
			self.stream.write_all(&header.encode()).await.unwrap();
			self.stream.write_all(payload).await.unwrap();
		}

		/// Next payload-bearing frame, skipping housekeeping frames.
		async fn read_payload(&mut self) -> Vec<u8> {
			loop {
				let mut header_bytes = [0u8; HEADER_LEN];
				self.stream.read_exact(&mut header_bytes).await.unwrap();
				let header = FrameHeader::decode(&header_bytes).unwrap();
				let mut payload = vec![0u8; header.len as usize];
				self.stream.read_exact(&mut payload).await.unwrap();
				if header.kind.is_replayable() {
					self.last_seen = header.id;
					return payload;
				}
			}
		}
	}

	fn test_manager() -> (HostManager, GuestSide, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let mut values = std::collections::HashMap::new();
		values.insert("extension.id".to_string(), "publisher.ext".to_string());
		values.insert("extension.main".to_string(), "dist/main.js".to_string());
		let config = HostConfig::from_product(&crate::config::ProductConfig::from_values(values));
		let context = HostContext::for_tests(
			config,
			Arc::new(SecretStore::new(dir.path().join("secrets.json"))),
			Arc::new(StorageState::new(dir.path().join("storage.json"))),
		);

		let (ours, theirs) = tokio::io::duplex(1024 * 1024);
		let (read, write) = tokio::io::split(ours);
		let socket = HostSocket::from_stream(read, write, SocketKind::Stream, "guest-test");
		let manager = HostManager::new(context, dir.path().to_path_buf(), socket);
		manager.start();
		(
			manager,
			GuestSide {
				stream: theirs,
				next_id: 0,
				last_seen: 0,
			},
			dir,
		)
	}

	#[tokio::test(flavor = "current_thread")]
	async fn happy_path_handshake_activates_the_extension() {
		let (manager, mut guest, _dir) = test_manager();
		assert_eq!(manager.phase(), HandshakePhase::AwaitingReady);

		// Ready: the host answers with the init blob.
		guest.send_payload(FrameKind::Control, &[control::READY]).await;
		let blob = guest.read_payload().await;
		let init: Value = serde_json::from_slice(&blob).unwrap();
		assert!(init["version"].is_string());
		assert!(init["workspace"]["folders"].is_array());
		assert_eq!(
			init["extensions"]["allExtensions"][0]["identifier"],
			"publisher.ext"
		);
		assert!(init["configuration"]["workbench.colorTheme"].is_string());
		assert_eq!(manager.phase(), HandshakePhase::AwaitingInitialized);

		// Initialized: the host wires RPC and activates the extension.
		guest
			.send_payload(FrameKind::Control, &[control::INITIALIZED])
			.await;
		let request = guest.read_payload().await;
		let RpcMessage::Request {
			correlation,
			proxy,
			method,
			args,
		} = RpcMessage::decode(&request).unwrap()
		else {
			panic!("expected activate request");
		};
		let registry = ServiceRegistry::new();
		assert_eq!(
			Some(proxy),
			registry.lookup(shapes::guest::EXTENSION_SERVICE)
		);
		assert_eq!(registry.method_name(proxy, method), Some("activate"));
		assert_eq!(args.value[0], serde_json::json!("publisher.ext"));
		assert_eq!(args.value[1]["startup"], serde_json::json!(true));
		assert_eq!(manager.phase(), HandshakePhase::Running);

		// Record success; nothing further is surfaced.
		guest
			.send_payload(
				FrameKind::Regular,
				&RpcMessage::ReplyOk {
					correlation,
					value: WithBuffers::plain(Value::Null),
				}
				.encode(),
			)
			.await;
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(manager.phase(), HandshakePhase::Running);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn unknown_control_byte_is_logged_not_fatal() {
		let (manager, mut guest, _dir) = test_manager();
		guest.send_payload(FrameKind::Control, &[0x77]).await;
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(manager.phase(), HandshakePhase::AwaitingReady);

		// Handshake still proceeds afterwards.
		guest.send_payload(FrameKind::Control, &[control::READY]).await;
		let _blob = guest.read_payload().await;
		assert_eq!(manager.phase(), HandshakePhase::AwaitingInitialized);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn terminate_control_byte_disposes_the_connection() {
		let (manager, mut guest, _dir) = test_manager();
		guest
			.send_payload(FrameKind::Control, &[control::TERMINATE])
			.await;
		tokio::time::timeout(Duration::from_secs(1), async {
			while manager.phase() != HandshakePhase::Closed {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
	}

	#[tokio::test(flavor = "current_thread")]
	async fn init_blob_is_only_sent_after_ready() {
		let (_manager, mut guest, _dir) = test_manager();
		// Nothing should arrive before Ready except housekeeping frames.
		guest.send_payload(FrameKind::Control, &[control::READY]).await;
		let blob = guest.read_payload().await;
		assert!(blob.len() > 1);
	}
}
