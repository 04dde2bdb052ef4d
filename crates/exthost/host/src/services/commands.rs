//! Command registry and the `MainThreadCommands` shape.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::args;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};

/// Host-side callback backing a command id.
pub type CommandCallback = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

/// Commands known to the host plus ids contributed by the guest.
#[derive(Default)]
pub struct CommandRegistry {
	host_commands: Mutex<HashMap<String, CommandCallback>>,
	guest_commands: Mutex<HashSet<String>>,
}

impl CommandRegistry {
	/// Register a host-implemented command.
	pub fn register_host_command(&self, id: impl Into<String>, callback: CommandCallback) {
		self.host_commands.lock().unwrap().insert(id.into(), callback);
	}

	/// Whether the guest contributed this command id.
	#[must_use]
	pub fn is_guest_command(&self, id: &str) -> bool {
		self.guest_commands.lock().unwrap().contains(id)
	}

	fn note_guest_command(&self, id: String) {
		self.guest_commands.lock().unwrap().insert(id);
	}

	fn drop_guest_command(&self, id: &str) {
		self.guest_commands.lock().unwrap().remove(id);
	}

	fn host_command(&self, id: &str) -> Option<CommandCallback> {
		self.host_commands.lock().unwrap().get(id).cloned()
	}
}

/// `MainThreadCommands`: registerCommand / unregisterCommand / executeCommand.
pub struct CommandService {
	registry: Arc<CommandRegistry>,
}

impl CommandService {
	/// Service over the given registry.
	#[must_use]
	pub fn new(registry: Arc<CommandRegistry>) -> Self {
		Self { registry }
	}
}

impl ServiceHandler for CommandService {
	fn shape(&self) -> &'static str {
		shapes::host::COMMANDS
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		let registry = self.registry.clone();
		Box::pin(async move {
			match method {
				// registerCommand
				0 => {
					let id = args::string(&args_in, 0)?;
					tracing::debug!(command = %id, "guest registered command");
					registry.note_guest_command(id);
					Ok(WithBuffers::plain(Value::Null))
				}
				// unregisterCommand
				1 => {
					let id = args::string(&args_in, 0)?;
					registry.drop_guest_command(&id);
					Ok(WithBuffers::plain(Value::Null))
				}
				// executeCommand
				2 => {
					let id = args::string(&args_in, 0)?;
					let call_args: Vec<Value> = args_in
						.into_iter()
						.skip(1)
						.filter_map(|arg| match arg {
							RpcArg::Json(value) => Some(value),
							_ => None,
						})
						.collect();
					let Some(callback) = registry.host_command(&id) else {
						return Err(ServiceFault::handler(format!("command not found: {id}")));
					};
					callback(call_args)
						.map(WithBuffers::plain)
						.map_err(ServiceFault::handler)
				}
				other => Err(ServiceFault::method_not_found(format!(
					"MainThreadCommands has no method {other}"
				))),
			}
		})
	}
}
