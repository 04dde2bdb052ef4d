//! `MainThreadMessageService`: surface guest messages to the user.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::args;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};

/// Routes guest messages into the host log; no modal UI here, so the
/// chosen action is always "none".
pub struct MessageService;

impl ServiceHandler for MessageService {
	fn shape(&self) -> &'static str {
		shapes::host::MESSAGE_SERVICE
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		Box::pin(async move {
			match method {
				// showMessage(severity, message, options?, actions?)
				0 => {
					let severity = args::integer(&args_in, 0)?;
					let message = args::string(&args_in, 1)?;
					match severity {
						// Error and warning severities keep their level.
						3 => tracing::error!(target: "vesper_exthost::messages", "{message}"),
						2 => tracing::warn!(target: "vesper_exthost::messages", "{message}"),
						_ => tracing::info!(target: "vesper_exthost::messages", "{message}"),
					}
					Ok(WithBuffers::plain(Value::Null))
				}
				other => Err(ServiceFault::method_not_found(format!(
					"MainThreadMessageService has no method {other}"
				))),
			}
		})
	}
}
