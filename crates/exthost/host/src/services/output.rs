//! `MainThreadOutputService`: named output channels draining into the log.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::args;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};

/// Output channel registry; appended chunks land in the host log tagged
/// with the channel name.
#[derive(Default)]
pub struct OutputService {
	channels: Mutex<ChannelTable>,
}

#[derive(Default)]
struct ChannelTable {
	by_id: HashMap<i64, String>,
	next_id: i64,
}

impl ServiceHandler for OutputService {
	fn shape(&self) -> &'static str {
		shapes::host::OUTPUT_SERVICE
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		let result = (|| match method {
			// register(name) -> channel id
			0 => {
				let name = args::string(&args_in, 0)?;
				let mut channels = self.channels.lock().unwrap();
				channels.next_id += 1;
				let id = channels.next_id;
				channels.by_id.insert(id, name);
				Ok(json!(id))
			}
			// append(id, chunk)
			1 => {
				let id = args::integer(&args_in, 0)?;
				let chunk = args::string(&args_in, 1)?;
				let channels = self.channels.lock().unwrap();
				let Some(name) = channels.by_id.get(&id) else {
					return Err(ServiceFault::bad_arguments(format!(
						"unknown output channel {id}"
					)));
				};
				for line in chunk.lines() {
					tracing::info!(target: "vesper_exthost::output", channel = %name, "{line}");
				}
				Ok(Value::Null)
			}
			// dispose(id)
			2 => {
				let id = args::integer(&args_in, 0)?;
				self.channels.lock().unwrap().by_id.remove(&id);
				Ok(Value::Null)
			}
			other => Err(ServiceFault::method_not_found(format!(
				"MainThreadOutputService has no method {other}"
			))),
		})();
		Box::pin(async move { result.map(WithBuffers::plain) })
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test(flavor = "current_thread")]
	async fn register_append_dispose_lifecycle() {
		let service = OutputService::default();
		let id = service
			.call(
				0,
				vec![RpcArg::Json(json!("Extension Log"))],
				CancellationToken::new(),
			)
			.await
			.unwrap()
			.value;

		service
			.call(
				1,
				vec![RpcArg::Json(id.clone()), RpcArg::Json(json!("a line\n"))],
				CancellationToken::new(),
			)
			.await
			.unwrap();

		service
			.call(2, vec![RpcArg::Json(id.clone())], CancellationToken::new())
			.await
			.unwrap();

		let fault = service
			.call(
				1,
				vec![RpcArg::Json(id), RpcArg::Json(json!("after dispose"))],
				CancellationToken::new(),
			)
			.await
			.unwrap_err();
		assert_eq!(fault.kind, crate::rpc::FaultKind::BadArguments);
	}
}
