//! Byte accumulation across chunk boundaries.
//!
//! The socket reader hands the protocol whatever chunk sizes the OS
//! produced; the frame parser wants exact byte runs. [`ChunkBuffer`] bridges
//! the two: chunks go in whole, reads come out exact.

use std::collections::VecDeque;

use thiserror::Error;

/// Requested more bytes than are currently buffered.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("buffer underflow: requested {requested} bytes, {available} available")]
pub struct BufferUnderflow {
	/// Bytes requested by the caller.
	pub requested: usize,
	/// Bytes currently buffered.
	pub available: usize,
}

/// An ordered list of byte chunks with a running total length.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
	chunks: VecDeque<Vec<u8>>,
	/// Bytes already consumed from the head chunk.
	head_offset: usize,
	len: usize,
}

impl ChunkBuffer {
	/// Create an empty buffer.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Total buffered bytes.
	#[must_use]
	pub fn len(&self) -> usize {
		self.len
	}

	/// Whether no bytes are buffered.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Append a chunk. Empty chunks are dropped.
	pub fn append(&mut self, bytes: impl Into<Vec<u8>>) {
		let bytes = bytes.into();
		if bytes.is_empty() {
			return;
		}
		self.len += bytes.len();
		self.chunks.push_back(bytes);
	}

	/// Remove and return exactly `n` bytes from the front.
	///
	/// # Errors
	///
	/// Returns [`BufferUnderflow`] when fewer than `n` bytes are buffered;
	/// the buffer is left untouched.
	pub fn read(&mut self, n: usize) -> Result<Vec<u8>, BufferUnderflow> {
		if n > self.len {
			return Err(BufferUnderflow {
				requested: n,
				available: self.len,
			});
		}
		if n == 0 {
			return Ok(Vec::new());
		}

		// Fast path: the head chunk alone covers the read.
		let head_remaining = self.chunks[0].len() - self.head_offset;
		if head_remaining >= n {
			let start = self.head_offset;
			let out = self.chunks[0][start..start + n].to_vec();
			self.head_offset += n;
			self.len -= n;
			if self.head_offset == self.chunks[0].len() {
				self.chunks.pop_front();
				self.head_offset = 0;
			}
			return Ok(out);
		}

		// Slow path: copy across chunks into a fresh allocation.
		let mut out = Vec::with_capacity(n);
		let mut remaining = n;
		while remaining > 0 {
			let head = &self.chunks[0];
			let available = head.len() - self.head_offset;
			let take = available.min(remaining);
			out.extend_from_slice(&head[self.head_offset..self.head_offset + take]);
			self.head_offset += take;
			remaining -= take;
			self.len -= take;
			if self.head_offset == head.len() {
				self.chunks.pop_front();
				self.head_offset = 0;
			}
		}
		Ok(out)
	}

	/// Return the front `n` bytes without removing them.
	///
	/// # Errors
	///
	/// Returns [`BufferUnderflow`] when fewer than `n` bytes are buffered.
	pub fn peek(&self, n: usize) -> Result<Vec<u8>, BufferUnderflow> {
		if n > self.len {
			return Err(BufferUnderflow {
				requested: n,
				available: self.len,
			});
		}

		let mut out = Vec::with_capacity(n);
		let mut offset = self.head_offset;
		for chunk in &self.chunks {
			if out.len() == n {
				break;
			}
			let take = (chunk.len() - offset).min(n - out.len());
			out.extend_from_slice(&chunk[offset..offset + take]);
			offset = 0;
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_within_single_chunk() {
		let mut buf = ChunkBuffer::new();
		buf.append(vec![1, 2, 3, 4]);
		assert_eq!(buf.read(2).unwrap(), vec![1, 2]);
		assert_eq!(buf.read(2).unwrap(), vec![3, 4]);
		assert!(buf.is_empty());
	}

	#[test]
	fn read_spanning_chunks() {
		let mut buf = ChunkBuffer::new();
		buf.append(vec![1, 2]);
		buf.append(vec![3]);
		buf.append(vec![4, 5, 6]);
		assert_eq!(buf.read(5).unwrap(), vec![1, 2, 3, 4, 5]);
		assert_eq!(buf.len(), 1);
		assert_eq!(buf.read(1).unwrap(), vec![6]);
	}

	#[test]
	fn underflow_leaves_buffer_untouched() {
		let mut buf = ChunkBuffer::new();
		buf.append(vec![1, 2, 3]);
		assert_eq!(
			buf.read(4),
			Err(BufferUnderflow {
				requested: 4,
				available: 3,
			})
		);
		assert_eq!(buf.read(3).unwrap(), vec![1, 2, 3]);
	}

	#[test]
	fn peek_does_not_consume() {
		let mut buf = ChunkBuffer::new();
		buf.append(vec![1]);
		buf.append(vec![2, 3]);
		assert_eq!(buf.peek(3).unwrap(), vec![1, 2, 3]);
		assert_eq!(buf.len(), 3);
		assert_eq!(buf.read(3).unwrap(), vec![1, 2, 3]);
	}

	#[test]
	fn reassembles_any_chunk_split() {
		// Framing round-trip: any split of the same bytes reads back whole.
		let payload: Vec<u8> = (0..=255).collect();
		for split in [1usize, 3, 7, 64, 255, 256] {
			let mut buf = ChunkBuffer::new();
			for chunk in payload.chunks(split) {
				buf.append(chunk.to_vec());
			}
			assert_eq!(buf.read(payload.len()).unwrap(), payload);
		}
	}

	#[test]
	fn empty_chunks_are_ignored() {
		let mut buf = ChunkBuffer::new();
		buf.append(Vec::new());
		buf.append(vec![9]);
		buf.append(Vec::new());
		assert_eq!(buf.len(), 1);
		assert_eq!(buf.read(1).unwrap(), vec![9]);
	}
}
