//! Delta computation between the shipped and live mirror states.

use vesper_exthost_proto::editors::{
	DocumentContentDelta, DocumentModel, EditorPropertiesDelta, Position, Range, StructuralDelta,
};

use super::{DeltaBatch, MirrorState};

/// Diff `old` (last shipped) against `new` (live) into one batch.
pub(crate) fn compute(old: &MirrorState, new: &MirrorState) -> DeltaBatch {
	let mut structural = StructuralDelta::default();

	for uri in old.documents.keys() {
		if !new.documents.contains_key(uri) {
			structural.removed_documents.push(uri.clone());
		}
	}
	for (uri, document) in &new.documents {
		if !old.documents.contains_key(uri) {
			structural.added_documents.push(document.clone());
		}
	}
	for id in old.editors.keys() {
		if !new.editors.contains_key(id) {
			structural.removed_editors.push(*id);
		}
	}
	for (id, editor) in &new.editors {
		if !old.editors.contains_key(id) {
			structural.added_editors.push(editor.clone());
		}
	}
	if old.active_editor != new.active_editor {
		structural.new_active_editor = Some(new.active_editor);
	}

	let mut editor_properties = Vec::new();
	for (id, editor) in &new.editors {
		let Some(previous) = old.editors.get(id) else {
			continue;
		};
		let mut delta = EditorPropertiesDelta::default();
		if previous.options != editor.options {
			delta.options = Some(editor.options);
		}
		if previous.selections != editor.selections {
			delta.selections = Some(editor.selections.clone());
		}
		if previous.visible_ranges != editor.visible_ranges {
			delta.visible_ranges = Some(editor.visible_ranges.clone());
		}
		if !delta.is_empty() {
			editor_properties.push((*id, delta));
		}
	}

	let mut content_changes = Vec::new();
	for (uri, document) in &new.documents {
		let Some(previous) = old.documents.get(uri) else {
			continue;
		};
		if shippable_fields_equal(previous, document) {
			continue;
		}
		content_changes.push(DocumentContentDelta {
			uri: uri.clone(),
			version_id: document.version_id,
			range: full_range(previous),
			range_offset: 0,
			range_length: total_len(previous) as u64,
			text: document.lines.join(&document.eol),
			eol: document.eol.clone(),
			language_id: document.language_id.clone(),
			is_dirty: document.is_dirty,
			encoding: document.encoding.clone(),
		});
	}

	DeltaBatch {
		structural: (!structural.is_empty()).then_some(structural),
		editor_properties,
		content_changes,
	}
}

fn shippable_fields_equal(a: &DocumentModel, b: &DocumentModel) -> bool {
	a.lines == b.lines
		&& a.eol == b.eol
		&& a.language_id == b.language_id
		&& a.is_dirty == b.is_dirty
		&& a.encoding == b.encoding
}

/// Range covering a document's entire content: `[1:1, lastLine:lastCol]`.
pub(crate) fn full_range(document: &DocumentModel) -> Range {
	let last_line = document.lines.len().max(1) as u32;
	let last_col = document
		.lines
		.last()
		.map_or(1, |line| line.chars().count() as u32 + 1);
	Range {
		start: Position { line: 1, column: 1 },
		end: Position {
			line: last_line,
			column: last_col,
		},
	}
}

/// Total character length of the joined document text.
pub(crate) fn total_len(document: &DocumentModel) -> usize {
	let line_total: usize = document.lines.iter().map(|line| line.chars().count()).sum();
	let separators = document.lines.len().saturating_sub(1) * document.eol.chars().count();
	line_total + separators
}
