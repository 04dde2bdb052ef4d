//! `MainThreadBulkEdits`: apply workspace edits from the guest.
//!
//! A workspace edit mixes resource operations (create/rename/delete) and
//! text edits. Resource operations run first, in listed order; a failed
//! operation marks the overall result `false` but later operations still
//! run. Text edits then apply against the post-rename URIs through the
//! mirror. Filesystem refresh work is spawned off the calling task.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::{args, uri_from_components};
use crate::mirror::EditorMirror;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};

/// One workspace edit as decoded from the guest.
#[derive(Debug, Deserialize)]
pub struct WorkspaceEditDto {
	/// Operations in application order.
	#[serde(default)]
	pub edits: Vec<EditOpDto>,
}

/// A single operation: a resource op or a text edit.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EditOpDto {
	/// Text replacement inside one document.
	Text(TextOpDto),
	/// File create/rename/delete.
	File(FileOpDto),
}

/// A resource operation. Which of the URIs are present decides the kind:
/// both = rename, new only = create, old only = delete.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOpDto {
	/// Source of a rename or target of a delete.
	pub old_uri: Option<Value>,
	/// Target of a rename or create.
	pub new_uri: Option<Value>,
	/// Initial contents for a create.
	#[serde(default)]
	pub contents: Option<String>,
	/// Operation options.
	#[serde(default)]
	pub options: FileOpOptions,
}

/// Options on a resource operation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOpOptions {
	/// Replace an existing target.
	#[serde(default)]
	pub overwrite: bool,
	/// Creating an existing file is not an error.
	#[serde(default)]
	pub ignore_if_exists: bool,
	/// Deleting a missing file is not an error.
	#[serde(default)]
	pub ignore_if_not_exists: bool,
	/// Delete directories recursively.
	#[serde(default)]
	pub recursive: bool,
}

/// A text edit on one document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOpDto {
	/// Target document.
	pub uri: Value,
	/// The replacement to apply.
	pub edit: TextEditDto,
}

/// A 1-based range replacement.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEditDto {
	/// Range to replace.
	pub range: RangeDto,
	/// Replacement text.
	pub text: String,
}

/// 1-based range as shipped by the guest.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeDto {
	/// Start line, 1-based.
	pub start_line: u32,
	/// Start column, 1-based.
	pub start_column: u32,
	/// End line, 1-based.
	pub end_line: u32,
	/// End column, 1-based.
	pub end_column: u32,
}

#[derive(Debug, Error)]
enum EditError {
	#[error("invalid uri: {0}")]
	InvalidUri(String),
	#[error("{operation} failed for {uri}: {source}")]
	Resource {
		operation: &'static str,
		uri: String,
		source: std::io::Error,
	},
	#[error("range out of bounds for {0}")]
	RangeOutOfBounds(String),
	#[error(transparent)]
	Mirror(#[from] crate::mirror::MirrorError),
}

/// `MainThreadBulkEdits`: tryApplyWorkspaceEdit.
pub struct BulkEditsService {
	mirror: EditorMirror,
}

impl BulkEditsService {
	/// Service applying edits through the given mirror.
	#[must_use]
	pub fn new(mirror: EditorMirror) -> Self {
		Self { mirror }
	}
}

impl ServiceHandler for BulkEditsService {
	fn shape(&self) -> &'static str {
		shapes::host::BULK_EDITS
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, token: CancellationToken) -> HandlerFuture {
		let mirror = self.mirror.clone();
		Box::pin(async move {
			match method {
				// tryApplyWorkspaceEdit(edit, token?) -> bool
				0 => {
					let dto: WorkspaceEditDto =
						serde_json::from_value(args::json(&args_in, 0)?.clone()).map_err(
							|error| {
								ServiceFault::bad_arguments(format!(
									"malformed workspace edit: {error}"
								))
							},
						)?;
					let applied = apply_workspace_edit(&mirror, dto, &token).await;
					Ok(WithBuffers::plain(json!(applied)))
				}
				other => Err(ServiceFault::method_not_found(format!(
					"MainThreadBulkEdits has no method {other}"
				))),
			}
		})
	}
}

/// Apply all operations, returning whether every one succeeded.
async fn apply_workspace_edit(
	mirror: &EditorMirror,
	dto: WorkspaceEditDto,
	token: &CancellationToken,
) -> bool {
	let mut success = true;
	// URIs moved by earlier renames redirect later text edits.
	let mut renames: HashMap<String, String> = HashMap::new();
	let mut text_ops = Vec::new();

	for op in dto.edits {
		if token.is_cancelled() {
			tracing::info!("workspace edit cancelled mid-application");
			return false;
		}
		match op {
			EditOpDto::File(file_op) => {
				if let Err(error) = apply_file_op(&file_op, &mut renames).await {
					tracing::warn!(error = %error, "workspace edit resource op failed");
					success = false;
				}
			}
			EditOpDto::Text(text_op) => text_ops.push(text_op),
		}
	}

	for op in text_ops {
		if token.is_cancelled() {
			return false;
		}
		if let Err(error) = apply_text_op(mirror, &op, &renames).await {
			tracing::warn!(error = %error, "workspace edit text op failed");
			success = false;
		}
	}

	// Refresh runs off the caller's task.
	tokio::spawn(async {
		tracing::debug!("scheduling filesystem refresh after workspace edit");
	});

	success
}

async fn apply_file_op(
	op: &FileOpDto,
	renames: &mut HashMap<String, String>,
) -> Result<(), EditError> {
	let old_uri = op.old_uri.as_ref().map(uri_string).transpose()?;
	let new_uri = op.new_uri.as_ref().map(uri_string).transpose()?;

	match (old_uri, new_uri) {
		(Some(old), Some(new)) => {
			let from = uri_path(&old)?;
			let to = uri_path(&new)?;
			if to.exists() && !op.options.overwrite && !op.options.ignore_if_exists {
				return Err(EditError::Resource {
					operation: "rename",
					uri: new,
					source: std::io::Error::new(
						std::io::ErrorKind::AlreadyExists,
						"target exists",
					),
				});
			}
			tokio::fs::rename(&from, &to)
				.await
				.map_err(|source| EditError::Resource {
					operation: "rename",
					uri: old.clone(),
					source,
				})?;
			renames.insert(old, new);
			Ok(())
		}
		(None, Some(new)) => {
			let path = uri_path(&new)?;
			if path.exists() && op.options.ignore_if_exists {
				return Ok(());
			}
			let contents = op.contents.clone().unwrap_or_default();
			tokio::fs::write(&path, contents)
				.await
				.map_err(|source| EditError::Resource {
					operation: "create",
					uri: new,
					source,
				})
		}
		(Some(old), None) => {
			let path = uri_path(&old)?;
			if !path.exists() && op.options.ignore_if_not_exists {
				return Ok(());
			}
			let result = if op.options.recursive && path.is_dir() {
				tokio::fs::remove_dir_all(&path).await
			} else {
				tokio::fs::remove_file(&path).await
			};
			result.map_err(|source| EditError::Resource {
				operation: "delete",
				uri: old,
				source,
			})
		}
		(None, None) => Err(EditError::InvalidUri("resource op with no uris".to_string())),
	}
}

async fn apply_text_op(
	mirror: &EditorMirror,
	op: &TextOpDto,
	renames: &HashMap<String, String>,
) -> Result<(), EditError> {
	let mut uri = uri_string(&op.uri)?;
	if let Some(moved) = renames.get(&uri) {
		uri = moved.clone();
	}

	mirror.open_document(&uri, true).await?;
	let document = mirror
		.document(&uri)
		.ok_or_else(|| EditError::InvalidUri(uri.clone()))?;
	let text = document.lines.join(&document.eol);

	let start = offset_of(&document.lines, &document.eol, op.edit.range.start_line, op.edit.range.start_column)
		.ok_or_else(|| EditError::RangeOutOfBounds(uri.clone()))?;
	let end = offset_of(&document.lines, &document.eol, op.edit.range.end_line, op.edit.range.end_column)
		.ok_or_else(|| EditError::RangeOutOfBounds(uri.clone()))?;
	if start > end || end > text.chars().count() {
		return Err(EditError::RangeOutOfBounds(uri));
	}

	let mut updated: String = text.chars().take(start).collect();
	updated.push_str(&op.edit.text);
	updated.extend(text.chars().skip(end));

	mirror.set_document_text(&uri, &updated)?;
	mirror.save_document(&uri).await?;
	Ok(())
}

/// Character offset of a 1-based position in joined text.
fn offset_of(lines: &[String], eol: &str, line: u32, column: u32) -> Option<usize> {
	let line_index = (line as usize).checked_sub(1)?;
	let column_index = (column as usize).checked_sub(1)?;
	if line_index >= lines.len() {
		return None;
	}
	let line_len = lines[line_index].chars().count();
	if column_index > line_len {
		return None;
	}
	let preceding: usize = lines[..line_index]
		.iter()
		.map(|l| l.chars().count() + eol.chars().count())
		.sum();
	Some(preceding + column_index)
}

fn uri_string(value: &Value) -> Result<String, EditError> {
	if let Some(text) = value.as_str() {
		return Ok(text.to_string());
	}
	uri_from_components(value)
		.ok_or_else(|| EditError::InvalidUri(format!("unrecognized uri value: {value}")))
}

fn uri_path(uri: &str) -> Result<PathBuf, EditError> {
	if let Ok(parsed) = url::Url::parse(uri) {
		if parsed.scheme() == "file" {
			return parsed
				.to_file_path()
				.map_err(|()| EditError::InvalidUri(uri.to_string()));
		}
		return Err(EditError::InvalidUri(uri.to_string()));
	}
	Ok(PathBuf::from(uri))
}
