//! Product file paths and socket directory resolution.

use std::path::PathBuf;

/// Returns the per-user product directory, `~/.vesper` by default.
///
/// # Resolution Order
///
/// 1. `VESPER_HOME` environment variable.
/// 2. `<home>/.vesper`.
/// 3. System temp directory (homeless environments, e.g. containers).
#[must_use]
pub fn product_dir() -> PathBuf {
	if let Ok(p) = std::env::var("VESPER_HOME") {
		return PathBuf::from(p);
	}

	dirs::home_dir()
		.map(|home| home.join(".vesper"))
		.unwrap_or_else(|| std::env::temp_dir().join(".vesper"))
}

/// Path of the secret store file.
#[must_use]
pub fn secrets_path() -> PathBuf {
	product_dir().join("secrets.json")
}

/// Path of the main configuration file (Java-properties syntax).
#[must_use]
pub fn main_config_path() -> PathBuf {
	product_dir().join("vesper.properties")
}

/// Path of a per-extension configuration file.
#[must_use]
pub fn extension_config_path(extension_id: &str) -> PathBuf {
	product_dir().join(format!("{extension_id}.properties"))
}

/// Directory where transport sockets are created.
///
/// Prefers the system runtime directory (e.g. `$XDG_RUNTIME_DIR`), falling
/// back to the temp directory when it is absent or unwritable.
#[must_use]
pub fn socket_dir() -> PathBuf {
	dirs::runtime_dir()
		.filter(|p| std::fs::create_dir_all(p).is_ok())
		.unwrap_or_else(std::env::temp_dir)
}
