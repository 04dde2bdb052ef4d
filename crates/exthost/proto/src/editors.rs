//! Mirror delta shapes shipped to the guest.
//!
//! Three ordered categories per flush: structural (documents/editors coming
//! and going), per-editor properties, and per-document content.

use serde::{Deserialize, Serialize};

use crate::types::EditorId;

/// 1-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
	/// 1-based line number.
	pub line: u32,
	/// 1-based column number.
	pub column: u32,
}

/// Half-open range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
	/// Inclusive start.
	pub start: Position,
	/// Exclusive end.
	pub end: Position,
}

/// A selection: anchor plus active cursor end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
	/// Where the selection started.
	pub anchor: Position,
	/// Where the cursor is.
	pub active: Position,
}

/// Editor display options the guest cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorOptions {
	/// Width of a tab stop in columns.
	pub tab_size: u32,
	/// Whether tab inserts spaces.
	pub insert_spaces: bool,
}

impl Default for EditorOptions {
	fn default() -> Self {
		Self {
			tab_size: 4,
			insert_spaces: true,
		}
	}
}

/// Full document model, shipped when a document joins the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentModel {
	/// Document identity.
	pub uri: String,
	/// Strictly increasing per document.
	pub version_id: u32,
	/// Content lines, without terminators.
	pub lines: Vec<String>,
	/// Line terminator joining `lines`.
	pub eol: String,
	/// Language association, possibly empty.
	pub language_id: String,
	/// Whether the document differs from disk.
	pub is_dirty: bool,
	/// Text encoding label.
	pub encoding: String,
}

/// Full editor model, shipped when an editor joins the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorModel {
	/// Process-unique editor id.
	pub id: EditorId,
	/// URI of the document this editor shows.
	pub document_uri: String,
	/// Display options.
	pub options: EditorOptions,
	/// Current selections.
	pub selections: Vec<Selection>,
	/// Currently visible ranges.
	pub visible_ranges: Vec<Range>,
	/// View column, when the editor is placed in a group.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub position: Option<u32>,
}

/// Structural delta: documents and editors added or removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralDelta {
	/// URIs of documents that left the mirror.
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub removed_documents: Vec<String>,
	/// Documents that joined the mirror.
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub added_documents: Vec<DocumentModel>,
	/// Editors that left the mirror.
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub removed_editors: Vec<EditorId>,
	/// Editors that joined the mirror.
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub added_editors: Vec<EditorModel>,
	/// New active editor; outer `None` means unchanged, inner `None` means
	/// no editor is active.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub new_active_editor: Option<Option<EditorId>>,
}

impl StructuralDelta {
	/// Whether this delta carries any change.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.removed_documents.is_empty()
			&& self.added_documents.is_empty()
			&& self.removed_editors.is_empty()
			&& self.added_editors.is_empty()
			&& self.new_active_editor.is_none()
	}
}

/// Property changes for one editor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorPropertiesDelta {
	/// Changed options, when they changed.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub options: Option<EditorOptions>,
	/// Changed selections, when they changed.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub selections: Option<Vec<Selection>>,
	/// Changed visible ranges, when they changed.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub visible_ranges: Option<Vec<Range>>,
}

impl EditorPropertiesDelta {
	/// Whether this delta carries any change.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.options.is_none() && self.selections.is_none() && self.visible_ranges.is_none()
	}
}

/// Content change for one document: a full-range replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContentDelta {
	/// Document identity.
	pub uri: String,
	/// Version after applying this change.
	pub version_id: u32,
	/// Range covering the entire previous content.
	pub range: Range,
	/// Offset of the replaced span; always 0 for full replacements.
	pub range_offset: u64,
	/// Length of the replaced span: the previous total length.
	pub range_length: u64,
	/// The complete new text.
	pub text: String,
	/// Line terminator after the change.
	pub eol: String,
	/// Language association after the change.
	pub language_id: String,
	/// Dirty flag after the change.
	pub is_dirty: bool,
	/// Encoding after the change.
	pub encoding: String,
}
