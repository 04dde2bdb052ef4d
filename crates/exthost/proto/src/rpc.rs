//! RPC envelope carried inside `Regular` frames.
//!
//! A logical call is serialized as a small binary envelope around a JSON
//! body. Binary blobs never pass through JSON: they are extracted into a
//! sidecar vector and replaced by index markers, so large payloads avoid
//! base64 overhead. A cancellation token is a dedicated marker that the
//! receive side resolves to a per-call cancellation source.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{CorrelationId, ProxyId};

/// JSON key marking an extracted binary blob: `{"$buffer": <sidecar index>}`.
pub const BUFFER_KEY: &str = "$buffer";

/// JSON key marking the cancellation-token argument: `{"$token": true}`.
pub const TOKEN_KEY: &str = "$token";

/// A JSON-serializable value bundled with out-of-band binary buffers.
///
/// The JSON side refers to a buffer by its index in `buffers` through a
/// `{"$buffer": n}` marker object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WithBuffers<T> {
	/// The JSON-serializable value, with markers in place of blobs.
	pub value: T,
	/// Out-of-band binary payloads, referenced by index.
	pub buffers: Vec<Vec<u8>>,
}

impl<T> WithBuffers<T> {
	/// Wrap a value that references no buffers.
	#[must_use]
	pub fn plain(value: T) -> Self {
		Self {
			value,
			buffers: Vec::new(),
		}
	}
}

/// One positional argument of a call, before wire packing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcArg {
	/// A plain JSON value.
	Json(Value),
	/// A binary blob, carried out-of-band.
	Buffer(Vec<u8>),
	/// The cancellation token slot for this call.
	Token,
}

/// Error descriptor for a failed call, shipped in a `ReplyErr` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcErrorPayload {
	/// Error kind, e.g. `MethodNotFound` or `HandlerException`.
	pub kind: String,
	/// Human-readable description.
	pub message: String,
	/// Guest-side stack trace, when one was available.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stack: Option<String>,
}

/// One RPC frame, host→guest or guest→host.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
	/// Invoke `method` (by index in the shape's method table) on `proxy`.
	Request {
		/// Per-direction correlation id.
		correlation: CorrelationId,
		/// Target proxy.
		proxy: ProxyId,
		/// Method index in the shape's method table.
		method: u8,
		/// Positional arguments plus buffer sidecar.
		args: WithBuffers<Vec<Value>>,
	},
	/// Successful completion of the request with the same correlation id.
	ReplyOk {
		/// Correlation id of the completed request.
		correlation: CorrelationId,
		/// Return value plus buffer sidecar.
		value: WithBuffers<Value>,
	},
	/// Failed completion of the request with the same correlation id.
	ReplyErr {
		/// Correlation id of the failed request.
		correlation: CorrelationId,
		/// Error descriptor.
		error: RpcErrorPayload,
	},
	/// Best-effort cancellation of an in-flight request.
	Cancel {
		/// Correlation id of the request to cancel.
		correlation: CorrelationId,
	},
}

const KIND_REQUEST: u8 = 1;
const KIND_REPLY_OK: u8 = 2;
const KIND_REPLY_ERR: u8 = 3;
const KIND_CANCEL: u8 = 4;

/// Errors produced while decoding an RPC envelope.
#[derive(Debug, Error)]
pub enum RpcDecodeError {
	/// The envelope ended before its declared contents.
	#[error("truncated rpc envelope")]
	Truncated,
	/// The kind byte does not name a known RPC frame kind.
	#[error("unknown rpc frame kind: 0x{0:02x}")]
	UnknownKind(u8),
	/// A JSON body failed to parse.
	#[error("malformed rpc body: {0}")]
	BadJson(#[from] serde_json::Error),
	/// A `{"$buffer": n}` marker referenced a missing sidecar slot.
	#[error("buffer marker references missing sidecar index {0}")]
	BadBufferIndex(u64),
}

/// Replace blob and token arguments with JSON markers, extracting blobs
/// into the sidecar.
#[must_use]
pub fn pack_args(args: Vec<RpcArg>) -> WithBuffers<Vec<Value>> {
	let mut buffers = Vec::new();
	let values = args
		.into_iter()
		.map(|arg| match arg {
			RpcArg::Json(value) => value,
			RpcArg::Buffer(bytes) => {
				let index = buffers.len();
				buffers.push(bytes);
				serde_json::json!({ BUFFER_KEY: index })
			}
			RpcArg::Token => serde_json::json!({ TOKEN_KEY: true }),
		})
		.collect();
	WithBuffers {
		value: values,
		buffers,
	}
}

/// Resolve markers back into positional arguments.
///
/// # Errors
///
/// Returns [`RpcDecodeError::BadBufferIndex`] when a marker points outside
/// the sidecar.
pub fn unpack_args(packed: WithBuffers<Vec<Value>>) -> Result<Vec<RpcArg>, RpcDecodeError> {
	let mut buffers: Vec<Option<Vec<u8>>> = packed.buffers.into_iter().map(Some).collect();
	packed
		.value
		.into_iter()
		.map(|value| {
			if let Some(object) = value.as_object() {
				if object.len() == 1 {
					if let Some(index) = object.get(BUFFER_KEY).and_then(Value::as_u64) {
						let slot = buffers
							.get_mut(index as usize)
							.ok_or(RpcDecodeError::BadBufferIndex(index))?;
						let bytes = slot.take().ok_or(RpcDecodeError::BadBufferIndex(index))?;
						return Ok(RpcArg::Buffer(bytes));
					}
					if object.contains_key(TOKEN_KEY) {
						return Ok(RpcArg::Token);
					}
				}
			}
			Ok(RpcArg::Json(value))
		})
		.collect()
}

impl RpcMessage {
	/// Encode into the payload of a `Regular` frame.
	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(64);
		match self {
			Self::Request {
				correlation,
				proxy,
				method,
				args,
			} => {
				out.push(KIND_REQUEST);
				out.extend_from_slice(&correlation.0.to_be_bytes());
				out.push(proxy.0);
				out.push(*method);
				encode_body(&mut out, &args.value, &args.buffers);
			}
			Self::ReplyOk { correlation, value } => {
				out.push(KIND_REPLY_OK);
				out.extend_from_slice(&correlation.0.to_be_bytes());
				encode_body(&mut out, &value.value, &value.buffers);
			}
			Self::ReplyErr { correlation, error } => {
				out.push(KIND_REPLY_ERR);
				out.extend_from_slice(&correlation.0.to_be_bytes());
				let json = serde_json::to_vec(error).unwrap_or_default();
				out.extend_from_slice(&(json.len() as u32).to_be_bytes());
				out.extend_from_slice(&json);
			}
			Self::Cancel { correlation } => {
				out.push(KIND_CANCEL);
				out.extend_from_slice(&correlation.0.to_be_bytes());
			}
		}
		out
	}

	/// Decode from the payload of a `Regular` frame.
	///
	/// # Errors
	///
	/// Returns [`RpcDecodeError`] for truncated envelopes, unknown kinds,
	/// or malformed JSON bodies.
	pub fn decode(payload: &[u8]) -> Result<Self, RpcDecodeError> {
		let mut cursor = Cursor::new(payload);
		let kind = cursor.u8()?;
		let correlation = CorrelationId(cursor.u32()?);
		match kind {
			KIND_REQUEST => {
				let proxy = ProxyId(cursor.u8()?);
				let method = cursor.u8()?;
				let (value, buffers) = decode_body(&mut cursor)?;
				Ok(Self::Request {
					correlation,
					proxy,
					method,
					args: WithBuffers {
						value: serde_json::from_slice(&value)?,
						buffers,
					},
				})
			}
			KIND_REPLY_OK => {
				let (value, buffers) = decode_body(&mut cursor)?;
				Ok(Self::ReplyOk {
					correlation,
					value: WithBuffers {
						value: serde_json::from_slice(&value)?,
						buffers,
					},
				})
			}
			KIND_REPLY_ERR => {
				let len = cursor.u32()? as usize;
				let json = cursor.bytes(len)?;
				Ok(Self::ReplyErr {
					correlation,
					error: serde_json::from_slice(json)?,
				})
			}
			KIND_CANCEL => Ok(Self::Cancel { correlation }),
			other => Err(RpcDecodeError::UnknownKind(other)),
		}
	}

	/// Correlation id of this frame, whichever kind it is.
	#[must_use]
	pub fn correlation(&self) -> CorrelationId {
		match self {
			Self::Request { correlation, .. }
			| Self::ReplyOk { correlation, .. }
			| Self::ReplyErr { correlation, .. }
			| Self::Cancel { correlation } => *correlation,
		}
	}
}

fn encode_body(out: &mut Vec<u8>, value: &impl Serialize, buffers: &[Vec<u8>]) {
	let json = serde_json::to_vec(value).unwrap_or_default();
	out.extend_from_slice(&(json.len() as u32).to_be_bytes());
	out.extend_from_slice(&json);
	out.push(buffers.len() as u8);
	for buffer in buffers {
		out.extend_from_slice(&(buffer.len() as u32).to_be_bytes());
		out.extend_from_slice(buffer);
	}
}

fn decode_body(cursor: &mut Cursor<'_>) -> Result<(Vec<u8>, Vec<Vec<u8>>), RpcDecodeError> {
	let json_len = cursor.u32()? as usize;
	let json = cursor.bytes(json_len)?.to_vec();
	let count = cursor.u8()? as usize;
	let mut buffers = Vec::with_capacity(count);
	for _ in 0..count {
		let len = cursor.u32()? as usize;
		buffers.push(cursor.bytes(len)?.to_vec());
	}
	Ok((json, buffers))
}

struct Cursor<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	fn u8(&mut self) -> Result<u8, RpcDecodeError> {
		let byte = *self.data.get(self.pos).ok_or(RpcDecodeError::Truncated)?;
		self.pos += 1;
		Ok(byte)
	}

	fn u32(&mut self) -> Result<u32, RpcDecodeError> {
		let bytes = self.bytes(4)?;
		Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
	}

	fn bytes(&mut self, len: usize) -> Result<&'a [u8], RpcDecodeError> {
		let end = self.pos.checked_add(len).ok_or(RpcDecodeError::Truncated)?;
		let slice = self.data.get(self.pos..end).ok_or(RpcDecodeError::Truncated)?;
		self.pos = end;
		Ok(slice)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn request_roundtrip_with_buffers() {
		let args = pack_args(vec![
			RpcArg::Json(json!("uri://a")),
			RpcArg::Buffer(vec![1, 2, 3]),
			RpcArg::Token,
		]);
		let msg = RpcMessage::Request {
			correlation: CorrelationId(7),
			proxy: ProxyId(3),
			method: 2,
			args,
		};
		let decoded = RpcMessage::decode(&msg.encode()).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn pack_unpack_preserves_argument_order() {
		let original = vec![
			RpcArg::Buffer(vec![9, 9]),
			RpcArg::Json(json!({"x": 1})),
			RpcArg::Token,
			RpcArg::Buffer(vec![1]),
		];
		let packed = pack_args(original.clone());
		assert_eq!(packed.buffers.len(), 2);
		assert_eq!(unpack_args(packed).unwrap(), original);
	}

	#[test]
	fn marker_with_missing_sidecar_is_rejected() {
		let packed = WithBuffers {
			value: vec![json!({ BUFFER_KEY: 0 })],
			buffers: Vec::new(),
		};
		assert!(matches!(
			unpack_args(packed),
			Err(RpcDecodeError::BadBufferIndex(0))
		));
	}

	#[test]
	fn reply_err_carries_descriptor() {
		let msg = RpcMessage::ReplyErr {
			correlation: CorrelationId(11),
			error: RpcErrorPayload {
				kind: "HandlerException".to_string(),
				message: "boom".to_string(),
				stack: Some("at line 1".to_string()),
			},
		};
		assert_eq!(RpcMessage::decode(&msg.encode()).unwrap(), msg);
	}

	#[test]
	fn truncated_envelope_is_rejected() {
		let msg = RpcMessage::Cancel {
			correlation: CorrelationId(5),
		};
		let bytes = msg.encode();
		assert!(matches!(
			RpcMessage::decode(&bytes[..bytes.len() - 1]),
			Err(RpcDecodeError::Truncated)
		));
	}
}
