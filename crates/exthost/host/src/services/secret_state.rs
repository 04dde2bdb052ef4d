//! `MainThreadSecretState`: bridge to the product secret store.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::args;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};
use crate::secrets::SecretStore;

/// Suspendable get/set/delete over the mutex-serialized secret store.
pub struct SecretStateService {
	store: Arc<SecretStore>,
}

impl SecretStateService {
	/// Service over the given store.
	#[must_use]
	pub fn new(store: Arc<SecretStore>) -> Self {
		Self { store }
	}
}

impl ServiceHandler for SecretStateService {
	fn shape(&self) -> &'static str {
		shapes::host::SECRET_STATE
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		let store = self.store.clone();
		Box::pin(async move {
			let extension_id = args::string(&args_in, 0)?;
			let key = args::string(&args_in, 1)?;
			match method {
				// getPassword
				0 => {
					let value = store
						.get(&extension_id, &key)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					Ok(WithBuffers::plain(
						value.map_or(Value::Null, Value::String),
					))
				}
				// setPassword
				1 => {
					let value = args::string(&args_in, 2)?;
					store
						.set(&extension_id, &key, &value)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					Ok(WithBuffers::plain(Value::Null))
				}
				// deletePassword
				2 => {
					store
						.delete(&extension_id, &key)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					Ok(WithBuffers::plain(Value::Null))
				}
				other => Err(ServiceFault::method_not_found(format!(
					"MainThreadSecretState has no method {other}"
				))),
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test(flavor = "current_thread")]
	async fn get_set_delete_through_the_rpc_surface() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(SecretStore::new(dir.path().join("secrets.json")));
		let service = SecretStateService::new(store);
		let call = |method, extra: Option<&str>| {
			let mut call_args = vec![
				RpcArg::Json(json!("publisher.ext")),
				RpcArg::Json(json!("token")),
			];
			if let Some(value) = extra {
				call_args.push(RpcArg::Json(json!(value)));
			}
			service.call(method, call_args, CancellationToken::new())
		};

		assert_eq!(call(0, None).await.unwrap().value, Value::Null);
		call(1, Some("hunter2")).await.unwrap();
		assert_eq!(call(0, None).await.unwrap().value, json!("hunter2"));
		call(2, None).await.unwrap();
		assert_eq!(call(0, None).await.unwrap().value, Value::Null);
	}
}
