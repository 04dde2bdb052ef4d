//! `MainThreadStorage`: persisted extension key/value state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::args;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};

/// File-backed storage, mutex-serialized like the secret store. Shared and
/// workspace-scoped values live under distinct prefixes in one file.
#[derive(Debug)]
pub struct StorageState {
	path: PathBuf,
	lock: Mutex<()>,
}

impl StorageState {
	/// Storage over the given file.
	#[must_use]
	pub fn new(path: PathBuf) -> Self {
		Self {
			path,
			lock: Mutex::new(()),
		}
	}

	async fn get(&self, shared: bool, key: &str) -> std::io::Result<Option<Value>> {
		let _guard = self.lock.lock().await;
		let table = self.read_all().await?;
		Ok(table.get(&scoped_key(shared, key)).cloned())
	}

	async fn set(&self, shared: bool, key: &str, value: Value) -> std::io::Result<()> {
		let _guard = self.lock.lock().await;
		let mut table = self.read_all().await?;
		if value.is_null() {
			table.remove(&scoped_key(shared, key));
		} else {
			table.insert(scoped_key(shared, key), value);
		}
		self.write_all(&table).await
	}

	async fn read_all(&self) -> std::io::Result<HashMap<String, Value>> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
			Err(error) => Err(error),
		}
	}

	async fn write_all(&self, table: &HashMap<String, Value>) -> std::io::Result<()> {
		if let Some(parent) = self.path.parent()
			&& !parent.exists()
		{
			tokio::fs::create_dir_all(parent).await?;
		}
		let json = serde_json::to_vec_pretty(table).unwrap_or_default();
		tokio::fs::write(&self.path, json).await
	}
}

fn scoped_key(shared: bool, key: &str) -> String {
	if shared {
		format!("shared/{key}")
	} else {
		format!("workspace/{key}")
	}
}

/// `MainThreadStorage`: getValue / setValue.
pub struct StorageService {
	state: Arc<StorageState>,
}

impl StorageService {
	/// Service over the given storage state.
	#[must_use]
	pub fn new(state: Arc<StorageState>) -> Self {
		Self { state }
	}
}

impl ServiceHandler for StorageService {
	fn shape(&self) -> &'static str {
		shapes::host::STORAGE
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		let state = self.state.clone();
		Box::pin(async move {
			let shared = args::boolean(&args_in, 0)?;
			let key = args::string(&args_in, 1)?;
			match method {
				// getValue
				0 => {
					let value = state
						.get(shared, &key)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					Ok(WithBuffers::plain(value.unwrap_or(Value::Null)))
				}
				// setValue
				1 => {
					let value = args::json(&args_in, 2)?.clone();
					state
						.set(shared, &key, value)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					Ok(WithBuffers::plain(Value::Null))
				}
				other => Err(ServiceFault::method_not_found(format!(
					"MainThreadStorage has no method {other}"
				))),
			}
		})
	}
}
