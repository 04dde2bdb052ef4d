//! Secret storage for extensions.
//!
//! Secrets live in one JSON file under the user home, keyed by extension id
//! and then by secret key. Every operation is suspendable, takes the store
//! mutex for its whole read-modify-write cycle, and is independently
//! cancellable; any interleaving of concurrent calls is equivalent to some
//! serial execution.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use vesper_exthost_proto::paths;

type SecretMap = HashMap<String, HashMap<String, String>>;

/// Mutex-serialized JSON-file secret store.
#[derive(Debug)]
pub struct SecretStore {
	path: PathBuf,
	lock: Mutex<()>,
}

impl SecretStore {
	/// A store over the given file.
	#[must_use]
	pub fn new(path: PathBuf) -> Self {
		Self {
			path,
			lock: Mutex::new(()),
		}
	}

	/// The store at the product's default secrets path.
	#[must_use]
	pub fn open_default() -> Self {
		Self::new(paths::secrets_path())
	}

	/// Read one secret.
	///
	/// # Errors
	///
	/// Returns the underlying error for unreadable files.
	pub async fn get(&self, extension_id: &str, key: &str) -> std::io::Result<Option<String>> {
		let _guard = self.lock.lock().await;
		let secrets = self.read_all().await?;
		Ok(secrets
			.get(extension_id)
			.and_then(|entry| entry.get(key))
			.cloned())
	}

	/// Write one secret.
	///
	/// # Errors
	///
	/// Returns the underlying error for unreadable or unwritable files.
	pub async fn set(&self, extension_id: &str, key: &str, value: &str) -> std::io::Result<()> {
		let _guard = self.lock.lock().await;
		let mut secrets = self.read_all().await?;
		secrets
			.entry(extension_id.to_string())
			.or_default()
			.insert(key.to_string(), value.to_string());
		self.write_all(&secrets).await
	}

	/// Delete one secret. Removing the last key of an extension removes the
	/// extension's entry.
	///
	/// # Errors
	///
	/// Returns the underlying error for unreadable or unwritable files.
	pub async fn delete(&self, extension_id: &str, key: &str) -> std::io::Result<()> {
		let _guard = self.lock.lock().await;
		let mut secrets = self.read_all().await?;
		if let Some(entry) = secrets.get_mut(extension_id) {
			entry.remove(key);
			if entry.is_empty() {
				secrets.remove(extension_id);
			}
		}
		self.write_all(&secrets).await
	}

	async fn read_all(&self) -> std::io::Result<SecretMap> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(SecretMap::new()),
			Err(error) => Err(error),
		}
	}

	async fn write_all(&self, secrets: &SecretMap) -> std::io::Result<()> {
		if let Some(parent) = self.path.parent()
			&& !parent.exists()
		{
			tokio::fs::create_dir_all(parent).await?;
		}
		let json = serde_json::to_vec_pretty(secrets).unwrap_or_default();
		tokio::fs::write(&self.path, json).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	fn store_in(dir: &tempfile::TempDir) -> SecretStore {
		SecretStore::new(dir.path().join("secrets.json"))
	}

	#[tokio::test(flavor = "current_thread")]
	async fn set_get_delete_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let store = store_in(&dir);

		store.set("publisher.ext", "token", "s3cret").await.unwrap();
		assert_eq!(
			store.get("publisher.ext", "token").await.unwrap().as_deref(),
			Some("s3cret")
		);

		store.delete("publisher.ext", "token").await.unwrap();
		assert_eq!(store.get("publisher.ext", "token").await.unwrap(), None);
	}

	#[tokio::test(flavor = "current_thread")]
	async fn deleting_last_key_removes_the_extension_entry() {
		let dir = tempfile::tempdir().unwrap();
		let store = store_in(&dir);

		store.set("publisher.ext", "a", "1").await.unwrap();
		store.delete("publisher.ext", "a").await.unwrap();

		let raw = tokio::fs::read_to_string(dir.path().join("secrets.json"))
			.await
			.unwrap();
		let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
		assert!(parsed.as_object().unwrap().is_empty());
	}

	#[tokio::test]
	async fn concurrent_writes_serialize() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(store_in(&dir));

		let mut tasks = Vec::new();
		for i in 0..16 {
			let store = store.clone();
			tasks.push(tokio::spawn(async move {
				store
					.set("publisher.ext", &format!("k{i}"), &format!("v{i}"))
					.await
					.unwrap();
			}));
		}
		for task in tasks {
			task.await.unwrap();
		}

		// Every write survived some serial order.
		for i in 0..16 {
			assert_eq!(
				store
					.get("publisher.ext", &format!("k{i}"))
					.await
					.unwrap()
					.as_deref(),
				Some(format!("v{i}").as_str())
			);
		}
	}
}
