//! `MainThreadDocumentsAndEditors`: guest-requested mirror operations.

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use vesper_exthost_proto::rpc::{RpcArg, WithBuffers};
use vesper_exthost_proto::shapes;

use super::args;
use crate::mirror::EditorMirror;
use crate::rpc::{HandlerFuture, ServiceFault, ServiceHandler};

/// Lets the guest pull documents into the mirror and open editors.
pub struct DocumentsAndEditorsService {
	mirror: EditorMirror,
}

impl DocumentsAndEditorsService {
	/// Service over the connection's mirror.
	#[must_use]
	pub fn new(mirror: EditorMirror) -> Self {
		Self { mirror }
	}
}

impl ServiceHandler for DocumentsAndEditorsService {
	fn shape(&self) -> &'static str {
		shapes::host::DOCUMENTS_AND_EDITORS
	}

	fn call(&self, method: u8, args_in: Vec<RpcArg>, _token: CancellationToken) -> HandlerFuture {
		let mirror = self.mirror.clone();
		Box::pin(async move {
			match method {
				// tryOpenDocument(uri) -> uri of the mirrored document
				0 => {
					let uri = args::uri(&args_in, 0)?;
					mirror
						.open_document(&uri, true)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					mirror.sync_updates().await;
					Ok(WithBuffers::plain(Value::String(uri)))
				}
				// tryShowEditor(uri) -> editor id
				1 => {
					let uri = args::uri(&args_in, 0)?;
					let editor = mirror
						.open_editor(&uri)
						.await
						.map_err(|error| ServiceFault::handler(error.to_string()))?;
					mirror.sync_updates().await;
					Ok(WithBuffers::plain(json!(editor.0)))
				}
				other => Err(ServiceFault::method_not_found(format!(
					"MainThreadDocumentsAndEditors has no method {other}"
				))),
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use serde_json::json;

	use super::*;
	use crate::mirror::{DeltaBatch, DeltaSink, LoggingWorkbench};

	struct NullSink;

	impl DeltaSink for NullSink {
		fn ship(
			&self,
			_batch: DeltaBatch,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
			Box::pin(async {})
		}
	}

	#[tokio::test(flavor = "current_thread")]
	async fn try_open_document_populates_the_mirror() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("doc.txt"), "content").unwrap();
		let uri = url::Url::from_file_path(dir.path().join("doc.txt"))
			.unwrap()
			.to_string();

		let mirror = EditorMirror::new(Arc::new(NullSink), Arc::new(LoggingWorkbench));
		let service = DocumentsAndEditorsService::new(mirror.clone());

		let reply = service
			.call(
				0,
				vec![RpcArg::Json(json!(uri.clone()))],
				CancellationToken::new(),
			)
			.await
			.unwrap();
		assert_eq!(reply.value, json!(uri));
		assert_eq!(mirror.document(&uri).unwrap().lines, vec!["content"]);
	}
}
