//! Identifier newtypes and handshake control bytes.

use serde::{Deserialize, Serialize};

/// Correlation id tagging one request/reply pair, unique per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u32);

/// Process-local numeric half of a proxy identifier.
///
/// The string half (the shape name) is interned once at registry
/// construction; frames on the wire carry only this integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProxyId(pub u8);

/// Unique identifier for mirrored editors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EditorId(pub u32);

/// Single-byte handshake tokens exchanged once per connection.
///
/// They travel as 1-byte payloads on the framed channel; the host manager
/// recognizes them by payload length.
pub mod control {
	/// Guest signals it is ready to receive the init blob.
	pub const READY: u8 = 0x02;
	/// Guest signals the init blob was accepted and RPC may be wired.
	pub const INITIALIZED: u8 = 0x01;
	/// Host instructs the guest to shut down.
	pub const TERMINATE: u8 = 0x03;
}
