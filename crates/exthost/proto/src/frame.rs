//! Frame header layout for the persistent protocol.
//!
//! Every unit on the wire is a fixed 13-byte header followed by an opaque
//! payload. All multi-byte fields are big-endian.
//!
//! | field | width | meaning |
//! |---|---|---|
//! | kind | 1 | [`FrameKind`] discriminator |
//! | id | 4 | sender-assigned monotonically increasing id (0 for housekeeping frames) |
//! | ack | 4 | highest contiguous id the sender has processed |
//! | len | 4 | payload length in bytes |

use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 13;

/// Upper bound on a single payload. Anything larger is a framing fault.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Discriminator for frames on the persistent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
	/// Placeholder; never legal on the wire.
	None = 0,
	/// Payload-bearing frame delivered to the upper layer; acked and replayed.
	Regular = 1,
	/// Payload-bearing control frame (handshake bytes); acked and replayed.
	Control = 2,
	/// Ack-only frame; carries no payload and no id.
	Ack = 3,
	/// Orderly final frame; the connection is done and resources may go.
	Disconnect = 4,
	/// Ask the peer to retransmit all unacked frames with id >= the one encoded in the payload.
	ReplayRequest = 5,
	/// Stop delivering payloads upward until [`FrameKind::Resume`].
	Pause = 6,
	/// Resume payload delivery; buffered payloads drain in order.
	Resume = 7,
	/// Liveness signal; keeps responsiveness tracking fed during idle spells.
	KeepAlive = 8,
}

impl FrameKind {
	/// Whether frames of this kind are assigned ids and kept for replay.
	#[must_use]
	pub const fn is_replayable(self) -> bool {
		matches!(self, Self::Regular | Self::Control)
	}

	fn from_wire(byte: u8) -> Option<Self> {
		Some(match byte {
			0 => Self::None,
			1 => Self::Regular,
			2 => Self::Control,
			3 => Self::Ack,
			4 => Self::Disconnect,
			5 => Self::ReplayRequest,
			6 => Self::Pause,
			7 => Self::Resume,
			8 => Self::KeepAlive,
			_ => return None,
		})
	}
}

/// Errors produced while parsing a frame header.
///
/// All of these are fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
	/// The kind byte does not name a known frame kind.
	#[error("unknown frame kind: 0x{0:02x}")]
	UnknownKind(u8),
	/// The declared payload length exceeds [`MAX_PAYLOAD_LEN`].
	#[error("frame payload too large: {0} bytes")]
	Oversized(u32),
}

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
	/// Frame kind discriminator.
	pub kind: FrameKind,
	/// Sender-assigned id; 0 for housekeeping frames.
	pub id: u32,
	/// Highest contiguous id the sender has processed.
	pub ack: u32,
	/// Payload length in bytes.
	pub len: u32,
}

impl FrameHeader {
	/// Encode the header into its 13-byte wire form.
	#[must_use]
	pub fn encode(&self) -> [u8; HEADER_LEN] {
		let mut out = [0u8; HEADER_LEN];
		out[0] = self.kind as u8;
		out[1..5].copy_from_slice(&self.id.to_be_bytes());
		out[5..9].copy_from_slice(&self.ack.to_be_bytes());
		out[9..13].copy_from_slice(&self.len.to_be_bytes());
		out
	}

	/// Decode a header from its 13-byte wire form.
	///
	/// # Errors
	///
	/// Returns [`FramingError`] for an unknown kind byte or an oversized
	/// declared payload length.
	pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, FramingError> {
		let kind = FrameKind::from_wire(bytes[0]).ok_or(FramingError::UnknownKind(bytes[0]))?;
		let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
		let ack = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
		let len = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
		if len > MAX_PAYLOAD_LEN {
			return Err(FramingError::Oversized(len));
		}
		Ok(Self { kind, id, ack, len })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_roundtrip() {
		let header = FrameHeader {
			kind: FrameKind::Regular,
			id: 0x01020304,
			ack: 0xA0B0C0D0,
			len: 42,
		};
		let bytes = header.encode();
		assert_eq!(FrameHeader::decode(&bytes), Ok(header));
	}

	#[test]
	fn header_fields_are_big_endian() {
		let header = FrameHeader {
			kind: FrameKind::Ack,
			id: 1,
			ack: 2,
			len: 3,
		};
		let bytes = header.encode();
		assert_eq!(bytes[0], 3);
		assert_eq!(&bytes[1..5], &[0, 0, 0, 1]);
		assert_eq!(&bytes[5..9], &[0, 0, 0, 2]);
		assert_eq!(&bytes[9..13], &[0, 0, 0, 3]);
	}

	#[test]
	fn unknown_kind_rejected() {
		let mut bytes = [0u8; HEADER_LEN];
		bytes[0] = 0x7f;
		assert_eq!(
			FrameHeader::decode(&bytes),
			Err(FramingError::UnknownKind(0x7f))
		);
	}

	#[test]
	fn oversized_payload_rejected() {
		let header = FrameHeader {
			kind: FrameKind::Regular,
			id: 1,
			ack: 0,
			len: MAX_PAYLOAD_LEN + 1,
		};
		let bytes = header.encode();
		assert_eq!(
			FrameHeader::decode(&bytes),
			Err(FramingError::Oversized(MAX_PAYLOAD_LEN + 1))
		);
	}
}
