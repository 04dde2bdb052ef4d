//! Host-provided service shapes.
//!
//! A handful of shapes carry real behavior (commands, messages, output,
//! secrets, storage, bulk edits, documents-and-editors); the rest of the
//! namespace registers as logging stubs behind one generic handler. Method
//! signatures are decoded with explicit per-parameter helpers rather than
//! reflection; numeric arguments tolerate the guest's floating-point
//! integers.

pub mod bulk_edits;
pub mod commands;
pub mod docs_editors;
pub mod messages;
pub mod output;
pub mod secret_state;
pub mod storage;

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use crate::mirror::EditorMirror;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};
use crate::secrets::SecretStore;

/// Shared collaborators handed to every concrete service.
#[derive(Clone)]
pub struct ServiceContext {
	/// The connection's editor/document mirror.
	pub mirror: EditorMirror,
	/// The product secret store.
	pub secrets: Arc<SecretStore>,
	/// Host-side command registry.
	pub commands: Arc<commands::CommandRegistry>,
	/// Persistent key/value storage.
	pub storage: Arc<storage::StorageState>,
}

/// Build handlers for the whole host namespace: concrete services where
/// behavior exists, logging stubs everywhere else.
#[must_use]
pub fn build_host_services(context: &ServiceContext) -> Vec<Arc<dyn ServiceHandler>> {
	let mut handlers: Vec<Arc<dyn ServiceHandler>> = vec![
		Arc::new(commands::CommandService::new(context.commands.clone())),
		Arc::new(messages::MessageService),
		Arc::new(output::OutputService::default()),
		Arc::new(secret_state::SecretStateService::new(
			context.secrets.clone(),
		)),
		Arc::new(storage::StorageService::new(context.storage.clone())),
		Arc::new(bulk_edits::BulkEditsService::new(context.mirror.clone())),
		Arc::new(docs_editors::DocumentsAndEditorsService::new(
			context.mirror.clone(),
		)),
	];

	let concrete: Vec<&'static str> = handlers.iter().map(|handler| handler.shape()).collect();
	for &shape in shapes::HOST_SHAPES {
		if !concrete.contains(&shape) {
			handlers.push(Arc::new(LoggingStub { shape }));
		}
	}
	handlers
}

/// Stub handler: logs the call and resolves with the JSON unit.
pub struct LoggingStub {
	shape: &'static str,
}

impl ServiceHandler for LoggingStub {
	fn shape(&self) -> &'static str {
		self.shape
	}

	fn call(&self, method: u8, args: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		tracing::debug!(shape = self.shape, method, argc = args.len(), "stubbed service call");
		Box::pin(async { Ok(WithBuffers::plain(Value::Null)) })
	}
}

/// Per-parameter decoders shared by the concrete services.
pub(crate) mod args {
	use super::{RpcArg, ServiceFault, Value};

	pub fn json(args: &[RpcArg], index: usize) -> Result<&Value, ServiceFault> {
		match args.get(index) {
			Some(RpcArg::Json(value)) => Ok(value),
			Some(_) => Err(ServiceFault::bad_arguments(format!(
				"argument {index} must be json"
			))),
			None => Err(ServiceFault::bad_arguments(format!(
				"missing argument {index}"
			))),
		}
	}

	pub fn string(args: &[RpcArg], index: usize) -> Result<String, ServiceFault> {
		json(args, index)?
			.as_str()
			.map(str::to_string)
			.ok_or_else(|| ServiceFault::bad_arguments(format!("argument {index} must be a string")))
	}

	/// Integer decode tolerating floating-point wire encodings.
	pub fn integer(args: &[RpcArg], index: usize) -> Result<i64, ServiceFault> {
		let value = json(args, index)?;
		value
			.as_i64()
			.or_else(|| value.as_f64().map(|f| f as i64))
			.ok_or_else(|| ServiceFault::bad_arguments(format!("argument {index} must be a number")))
	}

	pub fn boolean(args: &[RpcArg], index: usize) -> Result<bool, ServiceFault> {
		json(args, index)?
			.as_bool()
			.ok_or_else(|| ServiceFault::bad_arguments(format!("argument {index} must be a bool")))
	}

	/// A URI argument: either a plain string or a components object.
	pub fn uri(args: &[RpcArg], index: usize) -> Result<String, ServiceFault> {
		let value = json(args, index)?;
		if let Some(text) = value.as_str() {
			return Ok(text.to_string());
		}
		super::uri_from_components(value).ok_or_else(|| {
			ServiceFault::bad_arguments(format!("argument {index} must be a uri"))
		})
	}
}

/// Render a `{scheme, authority, path, …}` object back into a URI string.
pub(crate) fn uri_from_components(value: &Value) -> Option<String> {
	let object = value.as_object()?;
	let scheme = object.get("scheme")?.as_str()?;
	let authority = object
		.get("authority")
		.and_then(Value::as_str)
		.unwrap_or_default();
	let path = object.get("path").and_then(Value::as_str).unwrap_or_default();
	let mut uri = format!("{scheme}://{authority}{path}");
	if let Some(query) = object.get("query").and_then(Value::as_str)
		&& !query.is_empty()
	{
		uri.push('?');
		uri.push_str(query);
	}
	if let Some(fragment) = object.get("fragment").and_then(Value::as_str)
		&& !fragment.is_empty()
	{
		uri.push('#');
		uri.push_str(fragment);
	}
	Some(uri)
}
