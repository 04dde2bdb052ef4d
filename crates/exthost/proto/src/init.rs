//! Init blob sent to the guest once after *Ready*.

use serde::{Deserialize, Serialize};

/// The JSON document shipped to the guest after it signals *Ready*.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
	/// Build commit of the host, when known.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub commit: Option<String>,
	/// Host product version.
	pub version: String,
	/// Host environment description.
	pub environment: EnvironmentData,
	/// Workspace the guest is attached to.
	pub workspace: WorkspaceData,
	/// Extensions known to the host.
	pub extensions: ExtensionsData,
	/// Configuration bundle forwarded verbatim to the guest.
	pub configuration: ConfigurationBundle,
}

/// Host environment fields of the init blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentData {
	/// Product name presented to extensions.
	pub app_name: String,
	/// Installation root of the host application.
	pub app_root: String,
	/// Per-user settings directory.
	pub app_settings_home: String,
}

/// Workspace description in the init blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceData {
	/// Stable workspace identifier.
	pub id: String,
	/// Display name.
	pub name: String,
	/// Root folders, in order.
	pub folders: Vec<WorkspaceFolder>,
}

/// One workspace root folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceFolder {
	/// Folder URI.
	pub uri: String,
	/// Display name.
	pub name: String,
	/// Position among the workspace folders.
	pub index: u32,
}

/// Extension inventory shipped to the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionsData {
	/// Every extension the host knows about.
	pub all_extensions: Vec<ExtensionDescription>,
}

/// Description of one installed extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescription {
	/// `publisher.name` identifier.
	pub identifier: String,
	/// Extension version string.
	pub version: String,
	/// Entry script, relative to the extension root.
	pub main: String,
	/// Extension root directory URI.
	pub location: String,
	/// Declared activation events.
	#[serde(default)]
	pub activation_events: Vec<String>,
}

/// Configuration values the guest needs at startup.
///
/// Keys are flat, dotted setting names; unrecognized settings are not
/// forwarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationBundle {
	/// Active color theme; always present.
	#[serde(rename = "workbench.colorTheme")]
	pub color_theme: String,
	/// Explicit proxy URL, when configured.
	#[serde(rename = "http.proxy", skip_serializing_if = "Option::is_none")]
	pub proxy: Option<String>,
	/// Proxy support mode (`off`, `on`, `fallback`, `override`).
	#[serde(rename = "http.proxySupport", skip_serializing_if = "Option::is_none")]
	pub proxy_support: Option<String>,
	/// Comma-separated proxy bypass list.
	#[serde(rename = "http.noProxy", skip_serializing_if = "Option::is_none")]
	pub no_proxy: Option<String>,
}
