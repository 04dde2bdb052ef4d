//! Mirror behavior tests over a recording sink.

use std::sync::{Arc, Mutex};

use vesper_exthost_proto::editors::{EditorOptions, Position, Selection};

use super::*;

#[derive(Default)]
struct RecordingSink {
	batches: Mutex<Vec<DeltaBatch>>,
}

impl DeltaSink for Arc<RecordingSink> {
	fn ship(&self, batch: DeltaBatch) -> Pin<Box<dyn Future<Output = ()> + Send>> {
		self.batches.lock().unwrap().push(batch);
		Box::pin(async {})
	}
}

fn mirror() -> (EditorMirror, Arc<RecordingSink>) {
	let sink = Arc::new(RecordingSink::default());
	let mirror = EditorMirror::new(Arc::new(sink.clone()), Arc::new(LoggingWorkbench));
	(mirror, sink)
}

fn file_uri(dir: &tempfile::TempDir, name: &str) -> String {
	url::Url::from_file_path(dir.path().join(name))
		.unwrap()
		.to_string()
}

#[tokio::test(flavor = "current_thread")]
async fn open_document_initializes_the_model() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "alpha\nbeta").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, _sink) = mirror();

	mirror.open_document(&uri, true).await.unwrap();
	let document = mirror.document(&uri).unwrap();
	assert_eq!(document.version_id, 1);
	assert_eq!(document.lines, vec!["alpha", "beta"]);
	assert_eq!(document.eol, "\n");
	assert!(!document.is_dirty);
	assert_eq!(document.encoding, "utf8");

	// Opening again is a no-op.
	mirror.open_document(&uri, true).await.unwrap();
	assert_eq!(mirror.document(&uri).unwrap().version_id, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_documents_are_truncated() {
	let dir = tempfile::tempdir().unwrap();
	let big = "x".repeat(4 * 1024 * 1024);
	std::fs::write(dir.path().join("big.txt"), &big).unwrap();
	let uri = file_uri(&dir, "big.txt");
	let (mirror, _sink) = mirror();

	mirror.open_document(&uri, true).await.unwrap();
	let document = mirror.document(&uri).unwrap();
	let total: usize = document.lines.iter().map(String::len).sum();
	assert_eq!(total, MAX_DOCUMENT_BYTES);
	assert_eq!(document.version_id, 1);
	assert!(!document.is_dirty);
}

#[tokio::test(flavor = "current_thread")]
async fn structural_delta_ships_additions_then_removals() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "one").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, sink) = mirror();

	let editor = mirror.sync_to_guest(&uri, false, true, None).await.unwrap();
	mirror.sync_updates().await;

	{
		let batches = sink.batches.lock().unwrap();
		let structural = batches[0].structural.as_ref().unwrap();
		assert_eq!(structural.added_documents.len(), 1);
		assert_eq!(structural.added_editors.len(), 1);
		assert_eq!(structural.new_active_editor, Some(Some(editor)));
	}

	mirror.remove_editor(editor).unwrap();
	mirror.sync_updates().await;

	let batches = sink.batches.lock().unwrap();
	let structural = batches[1].structural.as_ref().unwrap();
	assert_eq!(structural.removed_documents, vec![uri]);
	assert_eq!(structural.removed_editors, vec![editor]);
	assert_eq!(structural.new_active_editor, Some(None));
}

#[tokio::test(flavor = "current_thread")]
async fn document_eviction_waits_for_the_last_editor() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "one").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, _sink) = mirror();

	let first = mirror.sync_to_guest(&uri, false, true, None).await.unwrap();
	let second = mirror.sync_to_guest(&uri, false, true, None).await.unwrap();

	mirror.remove_editor(first).unwrap();
	assert!(mirror.document(&uri).is_some());
	mirror.remove_editor(second).unwrap();
	assert!(mirror.document(&uri).is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn content_delta_is_a_full_range_replacement() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "old text").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, sink) = mirror();

	mirror.open_document(&uri, true).await.unwrap();
	mirror.sync_updates().await;
	mirror.set_document_text(&uri, "brand new\ncontent").unwrap();
	mirror.sync_updates().await;

	let batches = sink.batches.lock().unwrap();
	let change = &batches[1].content_changes[0];
	assert_eq!(change.version_id, 2);
	assert_eq!(change.range.start, Position { line: 1, column: 1 });
	assert_eq!(change.range.end, Position { line: 1, column: 9 });
	assert_eq!(change.range_offset, 0);
	assert_eq!(change.range_length, "old text".len() as u64);
	assert_eq!(change.text, "brand new\ncontent");
	assert!(change.is_dirty);
}

#[tokio::test(flavor = "current_thread")]
async fn editor_property_changes_ship_as_property_deltas() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "one").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, sink) = mirror();

	let editor = mirror.sync_to_guest(&uri, false, true, None).await.unwrap();
	mirror.sync_updates().await;

	let cursor = Position { line: 1, column: 3 };
	mirror
		.update_editor_properties(
			editor,
			Some(EditorOptions {
				tab_size: 2,
				insert_spaces: false,
			}),
			Some(vec![Selection {
				anchor: cursor,
				active: cursor,
			}]),
			None,
		)
		.unwrap();
	mirror.sync_updates().await;

	let batches = sink.batches.lock().unwrap();
	assert!(batches[1].structural.is_none());
	let (changed_id, delta) = &batches[1].editor_properties[0];
	assert_eq!(*changed_id, editor);
	assert_eq!(delta.options.unwrap().tab_size, 2);
	assert_eq!(delta.selections.as_ref().unwrap()[0].active.column, 3);
	assert!(delta.visible_ranges.is_none());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn updates_coalesce_under_the_debounce() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "one").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, sink) = mirror();

	mirror.open_document(&uri, true).await.unwrap();
	mirror.set_document_text(&uri, "two").unwrap();
	mirror.set_document_text(&uri, "three").unwrap();

	tokio::time::sleep(std::time::Duration::from_millis(50)).await;
	let batches = sink.batches.lock().unwrap();
	assert_eq!(batches.len(), 1);
	let structural = batches[0].structural.as_ref().unwrap();
	// The coalesced flush ships the final state only.
	assert_eq!(structural.added_documents[0].lines, vec!["three"]);
	assert!(batches[0].content_changes.is_empty());
}

/// Applies a batch the way the guest would; used to check idempotence.
fn apply_batch(state: &mut MirrorState, batch: &DeltaBatch) {
	if let Some(structural) = &batch.structural {
		for uri in &structural.removed_documents {
			state.documents.remove(uri);
		}
		for document in &structural.added_documents {
			state.documents.insert(document.uri.clone(), document.clone());
		}
		for id in &structural.removed_editors {
			state.editors.remove(id);
		}
		for editor in &structural.added_editors {
			state.editors.insert(editor.id, editor.clone());
		}
		if let Some(active) = structural.new_active_editor {
			state.active_editor = active;
		}
	}
	for (id, delta) in &batch.editor_properties {
		let Some(editor) = state.editors.get_mut(id) else {
			continue;
		};
		if let Some(options) = delta.options {
			editor.options = options;
		}
		if let Some(selections) = &delta.selections {
			editor.selections = selections.clone();
		}
		if let Some(visible_ranges) = &delta.visible_ranges {
			editor.visible_ranges = visible_ranges.clone();
		}
	}
	for change in &batch.content_changes {
		let Some(document) = state.documents.get_mut(&change.uri) else {
			continue;
		};
		document.lines = change.text.split('\n').map(str::to_string).collect();
		document.version_id = change.version_id;
		document.eol = change.eol.clone();
		document.language_id = change.language_id.clone();
		document.is_dirty = change.is_dirty;
		document.encoding = change.encoding.clone();
	}
}

#[tokio::test(flavor = "current_thread")]
async fn applying_the_delta_reproduces_the_target_state() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
	std::fs::write(dir.path().join("b.txt"), "beta").unwrap();
	let uri_a = file_uri(&dir, "a.txt");
	let uri_b = file_uri(&dir, "b.txt");
	let (mirror, sink) = mirror();

	mirror.sync_to_guest(&uri_a, false, true, None).await.unwrap();
	mirror.sync_updates().await;

	// Guest state after the first flush.
	let mut guest = MirrorState::default();
	apply_batch(&mut guest, &sink.batches.lock().unwrap()[0]);

	mirror.sync_to_guest(&uri_b, false, true, None).await.unwrap();
	mirror.set_document_text(&uri_a, "changed").unwrap();
	mirror.sync_updates().await;

	let host_view = {
		let state = mirror.inner.state.lock().unwrap();
		state.live.clone()
	};
	let batches = sink.batches.lock().unwrap();
	apply_batch(&mut guest, &batches[1]);
	assert_eq!(guest.documents, host_view.documents);
	assert_eq!(guest.editors, host_view.editors);
	assert_eq!(guest.active_editor, host_view.active_editor);

	// Re-applying the same delta is a no-op.
	let before = guest.clone();
	apply_batch(&mut guest, &batches[1]);
	assert_eq!(guest.documents, before.documents);
	assert_eq!(guest.editors, before.editors);
}

#[tokio::test(flavor = "current_thread")]
async fn save_clears_the_dirty_flag_and_writes_to_disk() {
	let dir = tempfile::tempdir().unwrap();
	std::fs::write(dir.path().join("a.txt"), "on disk").unwrap();
	let uri = file_uri(&dir, "a.txt");
	let (mirror, _sink) = mirror();

	mirror.open_document(&uri, true).await.unwrap();
	mirror.set_document_text(&uri, "edited").unwrap();
	assert!(mirror.document(&uri).unwrap().is_dirty);

	mirror.save_document(&uri).await.unwrap();
	assert!(!mirror.document(&uri).unwrap().is_dirty);
	assert_eq!(
		std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
		"edited"
	);
}
