//! Shape names for both RPC namespaces.
//!
//! Each entry is the string half of a proxy identifier; the numeric half is
//! allocated by the registry at process start, in the order listed here.

/// Shapes the host provides and the guest consumes.
pub mod host {
	pub const EDITOR_TABS: &str = "MainThreadEditorTabs";
	pub const BULK_EDITS: &str = "MainThreadBulkEdits";
	pub const COMMANDS: &str = "MainThreadCommands";
	pub const CONFIGURATION: &str = "MainThreadConfiguration";
	pub const DEBUG_SERVICE: &str = "MainThreadDebugService";
	pub const DIAGNOSTICS: &str = "MainThreadDiagnostics";
	pub const DOCUMENTS: &str = "MainThreadDocuments";
	pub const DOCUMENT_CONTENT_PROVIDERS: &str = "MainThreadDocumentContentProviders";
	pub const DOCUMENTS_AND_EDITORS: &str = "MainThreadDocumentsAndEditors";
	pub const EDITOR_INSETS: &str = "MainThreadEditorInsets";
	pub const EXTENSION_SERVICE: &str = "MainThreadExtensionService";
	pub const FILE_SYSTEM: &str = "MainThreadFileSystem";
	pub const FILE_SYSTEM_EVENTS: &str = "MainThreadFileSystemEventService";
	pub const LANGUAGE_FEATURES: &str = "MainThreadLanguageFeatures";
	pub const LOGGER: &str = "MainThreadLogger";
	pub const MESSAGE_SERVICE: &str = "MainThreadMessageService";
	pub const OUTPUT_SERVICE: &str = "MainThreadOutputService";
	pub const SEARCH: &str = "MainThreadSearch";
	pub const SECRET_STATE: &str = "MainThreadSecretState";
	pub const STORAGE: &str = "MainThreadStorage";
	pub const STATUS_BAR: &str = "MainThreadStatusBar";
	pub const TELEMETRY: &str = "MainThreadTelemetry";
	pub const TERMINAL_SERVICE: &str = "MainThreadTerminalService";
	pub const TERMINAL_SHELL_INTEGRATION: &str = "MainThreadTerminalShellIntegration";
	pub const TEXT_EDITORS: &str = "MainThreadTextEditors";
	pub const URLS: &str = "MainThreadUrls";
	pub const WEBVIEWS: &str = "MainThreadWebviews";
	pub const WEBVIEW_VIEWS: &str = "MainThreadWebviewViews";
	pub const WINDOW: &str = "MainThreadWindow";
}

/// Shapes the guest provides and the host consumes.
pub mod guest {
	pub const COMMANDS: &str = "ExtHostCommands";
	pub const CONFIGURATION: &str = "ExtHostConfiguration";
	pub const DOCUMENTS_AND_EDITORS: &str = "ExtHostDocumentsAndEditors";
	pub const DOCUMENTS: &str = "ExtHostDocuments";
	pub const EDITORS: &str = "ExtHostEditors";
	pub const EDITOR_TABS: &str = "ExtHostEditorTabs";
	pub const EXTENSION_SERVICE: &str = "ExtHostExtensionService";
	pub const FILE_SYSTEM_EVENTS: &str = "ExtHostFileSystemEventService";
	pub const TERMINAL_SERVICE: &str = "ExtHostTerminalService";
	pub const TERMINAL_SHELL_INTEGRATION: &str = "ExtHostTerminalShellIntegration";
	pub const WEBVIEWS: &str = "ExtHostWebviews";
	pub const WEBVIEW_VIEWS: &str = "ExtHostWebviewViews";
	pub const WORKSPACE: &str = "ExtHostWorkspace";
}

/// Host-provided namespace, in id-allocation order.
pub const HOST_SHAPES: &[&str] = &[
	host::EDITOR_TABS,
	host::BULK_EDITS,
	host::COMMANDS,
	host::CONFIGURATION,
	host::DEBUG_SERVICE,
	host::DIAGNOSTICS,
	host::DOCUMENTS,
	host::DOCUMENT_CONTENT_PROVIDERS,
	host::DOCUMENTS_AND_EDITORS,
	host::EDITOR_INSETS,
	host::EXTENSION_SERVICE,
	host::FILE_SYSTEM,
	host::FILE_SYSTEM_EVENTS,
	host::LANGUAGE_FEATURES,
	host::LOGGER,
	host::MESSAGE_SERVICE,
	host::OUTPUT_SERVICE,
	host::SEARCH,
	host::SECRET_STATE,
	host::STORAGE,
	host::STATUS_BAR,
	host::TELEMETRY,
	host::TERMINAL_SERVICE,
	host::TERMINAL_SHELL_INTEGRATION,
	host::TEXT_EDITORS,
	host::URLS,
	host::WEBVIEWS,
	host::WEBVIEW_VIEWS,
	host::WINDOW,
];

/// Guest-provided namespace, in id-allocation order.
pub const GUEST_SHAPES: &[&str] = &[
	guest::COMMANDS,
	guest::CONFIGURATION,
	guest::DOCUMENTS_AND_EDITORS,
	guest::DOCUMENTS,
	guest::EDITORS,
	guest::EDITOR_TABS,
	guest::EXTENSION_SERVICE,
	guest::FILE_SYSTEM_EVENTS,
	guest::TERMINAL_SERVICE,
	guest::TERMINAL_SHELL_INTEGRATION,
	guest::WEBVIEWS,
	guest::WEBVIEW_VIEWS,
	guest::WORKSPACE,
];
