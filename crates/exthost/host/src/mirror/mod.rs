//! Live document-and-editor mirror synchronized to the guest.
//!
//! The mirror keeps two copies of the world: the live state mutated by the
//! IDE, and the state last shipped to the guest. A scheduled flush diffs
//! the two, ships the difference in three ordered categories (structural,
//! per-editor properties, per-document content), and promotes the live
//! state to shipped. Flushes coalesce under a debounce; `sync_updates`
//! forces one immediately.
//!
//! Internal maps sit behind a single logical lock; deltas are computed
//! atomically against a snapshot.

pub(crate) mod delta;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use vesper_exthost_proto::editors::{
	DocumentContentDelta, DocumentModel, EditorModel, EditorOptions, EditorPropertiesDelta, Range,
	Selection, StructuralDelta,
};
use vesper_exthost_proto::types::EditorId;

/// Cap on mirrored document content; excess is truncated with a warning.
pub const MAX_DOCUMENT_BYTES: usize = 3 * 1024 * 1024;

/// Debounce window coalescing mirror updates.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(10);

/// Mirror operation failures.
#[derive(Debug, Error)]
pub enum MirrorError {
	/// The URI names no mirrored document.
	#[error("document not in mirror: {0}")]
	DocumentNotFound(String),
	/// The id names no mirrored editor.
	#[error("editor not in mirror: {0:?}")]
	EditorNotFound(EditorId),
	/// Reading or writing the backing file failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// One flush worth of changes, shipped in category order.
#[derive(Debug, Default)]
pub struct DeltaBatch {
	/// Documents and editors coming or going. Shipped first.
	pub structural: Option<StructuralDelta>,
	/// Per-editor property changes. Shipped second.
	pub editor_properties: Vec<(EditorId, EditorPropertiesDelta)>,
	/// Per-document content changes. Shipped last.
	pub content_changes: Vec<DocumentContentDelta>,
}

impl DeltaBatch {
	/// Whether the batch carries any change.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.structural.is_none()
			&& self.editor_properties.is_empty()
			&& self.content_changes.is_empty()
	}
}

/// Ships computed deltas to the guest. The production sink goes through
/// RPC; tests record batches.
pub trait DeltaSink: Send + Sync + 'static {
	/// Deliver one batch; categories inside must be applied in order.
	fn ship(&self, batch: DeltaBatch) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Coordinates with the IDE's editor manager to actually display files.
pub trait WorkbenchEditors: Send + Sync + 'static {
	/// Bring a file into view.
	fn show_file(&self, uri: &str) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;
	/// Bring a diff view into view.
	fn show_diff(
		&self,
		left: &str,
		right: &str,
		title: &str,
	) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;
}

/// Workbench stand-in that only logs. Used headless and in tests.
#[derive(Debug, Default)]
pub struct LoggingWorkbench;

impl WorkbenchEditors for LoggingWorkbench {
	fn show_file(&self, uri: &str) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> {
		tracing::debug!(uri, "show file");
		Box::pin(async { Ok(()) })
	}

	fn show_diff(
		&self,
		left: &str,
		right: &str,
		title: &str,
	) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>> {
		tracing::debug!(left, right, title, "show diff");
		Box::pin(async { Ok(()) })
	}
}

/// Mirrored world state. Ordered maps keep delta output deterministic.
#[derive(Debug, Clone, Default)]
pub(crate) struct MirrorState {
	pub(crate) documents: BTreeMap<String, DocumentModel>,
	pub(crate) editors: BTreeMap<EditorId, EditorModel>,
	pub(crate) active_editor: Option<EditorId>,
}

struct MirrorShared {
	live: MirrorState,
	shipped: MirrorState,
	next_editor_id: u32,
	flush_scheduled: bool,
}

struct MirrorInner {
	state: Mutex<MirrorShared>,
	sink: Arc<dyn DeltaSink>,
	workbench: Arc<dyn WorkbenchEditors>,
}

/// The host-side mirror of documents and editors.
#[derive(Clone)]
pub struct EditorMirror {
	inner: Arc<MirrorInner>,
}

impl EditorMirror {
	/// Create a mirror shipping into `sink` and displaying through
	/// `workbench`.
	#[must_use]
	pub fn new(sink: Arc<dyn DeltaSink>, workbench: Arc<dyn WorkbenchEditors>) -> Self {
		Self {
			inner: Arc::new(MirrorInner {
				state: Mutex::new(MirrorShared {
					live: MirrorState::default(),
					shipped: MirrorState::default(),
					next_editor_id: 0,
					flush_scheduled: false,
				}),
				sink,
				workbench,
			}),
		}
	}

	/// Bring a document into the mirror. Already-known URIs return
	/// immediately; otherwise the backing file is read, capped at
	/// [`MAX_DOCUMENT_BYTES`].
	///
	/// # Errors
	///
	/// Returns [`MirrorError::Io`] when an existing backing file cannot be
	/// read.
	pub async fn open_document(&self, uri: &str, is_text: bool) -> Result<(), MirrorError> {
		if self
			.inner
			.state
			.lock()
			.unwrap()
			.live
			.documents
			.contains_key(uri)
		{
			return Ok(());
		}

		let text = if is_text {
			match uri_to_path(uri) {
				Some(path) => read_capped(&path, uri).await?,
				None => String::new(),
			}
		} else {
			String::new()
		};

		let model = DocumentModel {
			uri: uri.to_string(),
			version_id: 1,
			lines: split_lines(&text),
			eol: "\n".to_string(),
			language_id: String::new(),
			is_dirty: false,
			encoding: "utf8".to_string(),
		};

		let mut state = self.inner.state.lock().unwrap();
		state.live.documents.entry(uri.to_string()).or_insert(model);
		drop(state);
		self.schedule_update();
		Ok(())
	}

	/// Ensure a document is mirrored and attach a fresh editor to it,
	/// making it the active editor.
	///
	/// # Errors
	///
	/// Propagates document-open failures.
	pub async fn sync_to_guest(
		&self,
		uri: &str,
		_diff: bool,
		is_text: bool,
		options: Option<EditorOptions>,
	) -> Result<EditorId, MirrorError> {
		self.open_document(uri, is_text).await?;

		let mut state = self.inner.state.lock().unwrap();
		state.next_editor_id += 1;
		let id = EditorId(state.next_editor_id);
		let origin = vesper_exthost_proto::editors::Position { line: 1, column: 1 };
		state.live.editors.insert(
			id,
			EditorModel {
				id,
				document_uri: uri.to_string(),
				options: options.unwrap_or_default(),
				selections: vec![Selection {
					anchor: origin,
					active: origin,
				}],
				visible_ranges: Vec::new(),
				position: None,
			},
		);
		state.live.active_editor = Some(id);
		drop(state);
		self.schedule_update();
		Ok(id)
	}

	/// Display a file in the IDE, then mirror it with a fresh editor.
	///
	/// # Errors
	///
	/// Propagates workbench and document-open failures.
	pub async fn open_editor(&self, uri: &str) -> Result<EditorId, MirrorError> {
		self.inner.workbench.show_file(uri).await?;
		self.sync_to_guest(uri, false, true, None).await
	}

	/// Display a diff view, then mirror both sides with an editor on the
	/// right-hand document.
	///
	/// # Errors
	///
	/// Propagates workbench and document-open failures.
	pub async fn open_diff_editor(
		&self,
		left: &str,
		right: &str,
		title: &str,
	) -> Result<EditorId, MirrorError> {
		self.inner.workbench.show_diff(left, right, title).await?;
		self.open_document(left, true).await?;
		self.sync_to_guest(right, true, true, None).await
	}

	/// Evict an editor. The document goes too when no other editor
	/// references it.
	///
	/// # Errors
	///
	/// Returns [`MirrorError::EditorNotFound`] for unknown ids.
	pub fn remove_editor(&self, id: EditorId) -> Result<(), MirrorError> {
		let mut state = self.inner.state.lock().unwrap();
		let Some(removed) = state.live.editors.remove(&id) else {
			return Err(MirrorError::EditorNotFound(id));
		};
		let document_still_held = state
			.live
			.editors
			.values()
			.any(|editor| editor.document_uri == removed.document_uri);
		if !document_still_held {
			state.live.documents.remove(&removed.document_uri);
		}
		if state.live.active_editor == Some(id) {
			state.live.active_editor = None;
		}
		drop(state);
		self.schedule_update();
		Ok(())
	}

	/// Replace a document's text, bumping its version and marking it dirty.
	///
	/// # Errors
	///
	/// Returns [`MirrorError::DocumentNotFound`] for unknown URIs.
	pub fn set_document_text(&self, uri: &str, text: &str) -> Result<(), MirrorError> {
		let mut state = self.inner.state.lock().unwrap();
		let document = state
			.live
			.documents
			.get_mut(uri)
			.ok_or_else(|| MirrorError::DocumentNotFound(uri.to_string()))?;
		document.lines = split_lines(text);
		document.is_dirty = true;
		document.version_id += 1;
		drop(state);
		self.schedule_update();
		Ok(())
	}

	/// Set a document's language association.
	///
	/// # Errors
	///
	/// Returns [`MirrorError::DocumentNotFound`] for unknown URIs.
	pub fn set_language(&self, uri: &str, language_id: &str) -> Result<(), MirrorError> {
		let mut state = self.inner.state.lock().unwrap();
		let document = state
			.live
			.documents
			.get_mut(uri)
			.ok_or_else(|| MirrorError::DocumentNotFound(uri.to_string()))?;
		if document.language_id != language_id {
			document.language_id = language_id.to_string();
			document.version_id += 1;
		}
		drop(state);
		self.schedule_update();
		Ok(())
	}

	/// Write a dirty document back to disk and clear its dirty flag.
	///
	/// # Errors
	///
	/// Returns [`MirrorError::DocumentNotFound`] for unknown URIs and
	/// [`MirrorError::Io`] for write failures.
	pub async fn save_document(&self, uri: &str) -> Result<(), MirrorError> {
		let (path, text) = {
			let state = self.inner.state.lock().unwrap();
			let document = state
				.live
				.documents
				.get(uri)
				.ok_or_else(|| MirrorError::DocumentNotFound(uri.to_string()))?;
			(uri_to_path(uri), document.lines.join(&document.eol))
		};
		if let Some(path) = path {
			tokio::fs::write(&path, text).await?;
		}
		let mut state = self.inner.state.lock().unwrap();
		if let Some(document) = state.live.documents.get_mut(uri)
			&& document.is_dirty
		{
			document.is_dirty = false;
			document.version_id += 1;
		}
		drop(state);
		self.schedule_update();
		Ok(())
	}

	/// Update an editor's displayed properties.
	///
	/// # Errors
	///
	/// Returns [`MirrorError::EditorNotFound`] for unknown ids.
	pub fn update_editor_properties(
		&self,
		id: EditorId,
		options: Option<EditorOptions>,
		selections: Option<Vec<Selection>>,
		visible_ranges: Option<Vec<Range>>,
	) -> Result<(), MirrorError> {
		let mut state = self.inner.state.lock().unwrap();
		let editor = state
			.live
			.editors
			.get_mut(&id)
			.ok_or(MirrorError::EditorNotFound(id))?;
		if let Some(options) = options {
			editor.options = options;
		}
		if let Some(selections) = selections {
			editor.selections = selections;
		}
		if let Some(visible_ranges) = visible_ranges {
			editor.visible_ranges = visible_ranges;
		}
		drop(state);
		self.schedule_update();
		Ok(())
	}

	/// Change the globally active editor. At most one editor is active.
	pub fn set_active_editor(&self, id: Option<EditorId>) {
		let mut state = self.inner.state.lock().unwrap();
		let known = id.filter(|id| state.live.editors.contains_key(id));
		state.live.active_editor = known;
		drop(state);
		self.schedule_update();
	}

	/// Current model of a document, if mirrored.
	#[must_use]
	pub fn document(&self, uri: &str) -> Option<DocumentModel> {
		self.inner.state.lock().unwrap().live.documents.get(uri).cloned()
	}

	/// Force an immediate flush of all coalesced changes.
	pub async fn sync_updates(&self) {
		self.flush().await;
	}

	fn schedule_update(&self) {
		{
			let mut state = self.inner.state.lock().unwrap();
			if state.flush_scheduled {
				return;
			}
			state.flush_scheduled = true;
		}
		let mirror = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(FLUSH_DEBOUNCE).await;
			mirror.flush().await;
		});
	}

	async fn flush(&self) {
		let batch = {
			let mut state = self.inner.state.lock().unwrap();
			let state = &mut *state;
			state.flush_scheduled = false;
			let batch = delta::compute(&state.shipped, &state.live);
			state.shipped = state.live.clone();
			batch
		};
		if !batch.is_empty() {
			self.inner.sink.ship(batch).await;
		}
	}
}

fn uri_to_path(uri: &str) -> Option<PathBuf> {
	if let Ok(parsed) = url::Url::parse(uri) {
		if parsed.scheme() == "file" {
			return parsed.to_file_path().ok();
		}
		return None;
	}
	// Bare paths are accepted as local files.
	Some(PathBuf::from(uri))
}

async fn read_capped(path: &std::path::Path, uri: &str) -> std::io::Result<String> {
	let mut bytes = match tokio::fs::read(path).await {
		Ok(bytes) => bytes,
		Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
		Err(error) => return Err(error),
	};
	if bytes.len() > MAX_DOCUMENT_BYTES {
		tracing::warn!(
			uri,
			size = bytes.len(),
			cap = MAX_DOCUMENT_BYTES,
			"document exceeds mirror cap, truncating"
		);
		bytes.truncate(MAX_DOCUMENT_BYTES);
	}
	Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn split_lines(text: &str) -> Vec<String> {
	text.split('\n')
		.map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
		.collect()
}
