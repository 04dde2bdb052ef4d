//! Product configuration and proxy resolution.
//!
//! The main configuration lives at `~/.vesper/vesper.properties` in
//! Java-properties syntax, with per-extension files alongside it. Proxy
//! settings come from the configuration when present, otherwise from the
//! process environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use vesper_exthost_proto::init::{ConfigurationBundle, ExtensionDescription};

/// Parse Java-properties text: `key=value` or `key: value` lines, `#` and
/// `!` comments. Later keys win.
#[must_use]
pub fn parse_properties(text: &str) -> HashMap<String, String> {
	let mut values = HashMap::new();
	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
			continue;
		}
		let Some(split) = line.find(['=', ':']) else {
			continue;
		};
		let key = line[..split].trim();
		let value = line[split + 1..].trim();
		if !key.is_empty() {
			values.insert(key.to_string(), value.to_string());
		}
	}
	values
}

/// Key/value view over one properties file.
#[derive(Debug, Clone, Default)]
pub struct ProductConfig {
	values: HashMap<String, String>,
}

impl ProductConfig {
	/// Load a properties file; a missing file yields an empty config.
	///
	/// # Errors
	///
	/// Returns the underlying error for unreadable (but existing) files.
	pub async fn load(path: &Path) -> std::io::Result<Self> {
		match tokio::fs::read_to_string(path).await {
			Ok(text) => Ok(Self {
				values: parse_properties(&text),
			}),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
			Err(error) => Err(error),
		}
	}

	/// Build a config from in-memory values.
	#[must_use]
	pub fn from_values(values: HashMap<String, String>) -> Self {
		Self { values }
	}

	/// Look up a setting.
	#[must_use]
	pub fn get(&self, key: &str) -> Option<&str> {
		self.values.get(key).map(String::as_str)
	}
}

/// Resolved proxy settings injected into the guest environment.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
	/// HTTP proxy URL.
	pub http_proxy: Option<String>,
	/// HTTPS proxy URL.
	pub https_proxy: Option<String>,
	/// Proxy bypass list.
	pub no_proxy: Option<String>,
	/// Proxy auto-config script URL.
	pub pac_url: Option<String>,
}

impl ProxyConfig {
	/// Derive proxy settings from configuration when present, else from the
	/// environment (`HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`/`PROXY_PAC_URL`,
	/// case-insensitive).
	#[must_use]
	pub fn resolve(config: &ProductConfig) -> Self {
		let configured = config.get("http.proxy").map(str::to_string);
		Self {
			http_proxy: configured
				.clone()
				.or_else(|| env_var_ci("HTTP_PROXY")),
			https_proxy: configured.or_else(|| env_var_ci("HTTPS_PROXY")),
			no_proxy: config
				.get("http.noProxy")
				.map(str::to_string)
				.or_else(|| env_var_ci("NO_PROXY")),
			pac_url: env_var_ci("PROXY_PAC_URL"),
		}
	}

	/// Environment variables to inject into the guest.
	#[must_use]
	pub fn env_vars(&self) -> Vec<(String, String)> {
		let mut vars = Vec::new();
		if let Some(pac) = &self.pac_url {
			vars.push(("PROXY_PAC_URL".to_string(), pac.clone()));
			return vars;
		}
		if let Some(proxy) = &self.http_proxy {
			vars.push(("HTTP_PROXY".to_string(), proxy.clone()));
		}
		if let Some(proxy) = &self.https_proxy {
			vars.push(("HTTPS_PROXY".to_string(), proxy.clone()));
		}
		if let Some(bypass) = &self.no_proxy {
			vars.push(("NO_PROXY".to_string(), bypass.clone()));
		}
		vars
	}
}

fn env_var_ci(name: &str) -> Option<String> {
	std::env::var(name)
		.or_else(|_| std::env::var(name.to_lowercase()))
		.ok()
		.filter(|value| !value.is_empty())
}

/// Everything the host manager needs to describe itself to a guest.
#[derive(Debug, Clone)]
pub struct HostConfig {
	/// Product name presented to extensions.
	pub app_name: String,
	/// Product version.
	pub version: String,
	/// Build commit, when known.
	pub commit: Option<String>,
	/// Installation root.
	pub app_root: PathBuf,
	/// Active color theme.
	pub color_theme: String,
	/// Installed extensions.
	pub extensions: Vec<ExtensionDescription>,
	/// Resolved proxy settings.
	pub proxy: ProxyConfig,
}

impl HostConfig {
	/// Build a host config from the product configuration file.
	#[must_use]
	pub fn from_product(product: &ProductConfig) -> Self {
		let mut extensions = Vec::new();
		if let (Some(id), Some(main)) = (product.get("extension.id"), product.get("extension.main"))
		{
			extensions.push(ExtensionDescription {
				identifier: id.to_string(),
				version: product
					.get("extension.version")
					.unwrap_or("0.0.0")
					.to_string(),
				main: main.to_string(),
				location: product.get("extension.location").unwrap_or("").to_string(),
				activation_events: vec!["*".to_string()],
			});
		}

		Self {
			app_name: product.get("app.name").unwrap_or("vesper").to_string(),
			version: env!("CARGO_PKG_VERSION").to_string(),
			commit: product.get("app.commit").map(str::to_string),
			app_root: std::env::current_exe()
				.ok()
				.and_then(|exe| exe.parent().map(Path::to_path_buf))
				.unwrap_or_else(|| PathBuf::from(".")),
			color_theme: product
				.get("workbench.colorTheme")
				.unwrap_or("Default Dark")
				.to_string(),
			extensions,
			proxy: ProxyConfig::resolve(product),
		}
	}

	/// The configuration bundle forwarded inside the init blob.
	#[must_use]
	pub fn configuration_bundle(&self) -> ConfigurationBundle {
		ConfigurationBundle {
			color_theme: self.color_theme.clone(),
			proxy: self.proxy.http_proxy.clone(),
			proxy_support: self
				.proxy
				.http_proxy
				.is_some()
				.then(|| "override".to_string()),
			no_proxy: self.proxy.no_proxy.clone(),
		}
	}
}
