//! Bounded byte buffers for the receive and send paths.
//!
//! [`ReadBuffer`] is a single contiguous region holding bytes received from the transport but not
//! yet consumed by the response parser. Its capacity bounds the header block a server may send.
//! [`OutBuf`] is the write staging area: the request line, headers, and any inline body are
//! coalesced into it and drained through partial writes.

/// A bounded, contiguous receive buffer with a read cursor and a write cursor.
///
/// When the write cursor reaches the end of the region, unread bytes are compacted to the front
/// before more space is handed out. The buffer never grows; a parser that needs more contiguous
/// bytes than the capacity treats that as a protocol error.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
	buf: Box<[u8]>,
	start: usize,
	end: usize,
}

impl ReadBuffer {
	/// Constructs a buffer with the given capacity.
	pub fn new(capacity: usize) -> Self {
		Self {
			buf: vec![0; capacity].into_boxed_slice(),
			start: 0,
			end: 0,
		}
	}

	/// Returns the number of unread bytes.
	pub fn len(&self) -> usize {
		self.end - self.start
	}

	/// Returns whether there are no unread bytes.
	pub fn is_empty(&self) -> bool {
		self.start == self.end
	}

	/// Returns whether the unread bytes fill the entire capacity.
	pub fn is_full(&self) -> bool {
		self.len() == self.buf.len()
	}

	/// Returns the unread bytes.
	pub fn readable(&self) -> &[u8] {
		&self.buf[self.start..self.end]
	}

	/// Advances the read cursor past `n` bytes.
	pub fn consume(&mut self, n: usize) {
		debug_assert!(n <= self.len());
		self.start += n;
		if self.start == self.end {
			self.start = 0;
			self.end = 0;
		}
	}

	/// Returns the free tail of the buffer, compacting unread bytes to the front first if the
	/// tail has been exhausted.
	///
	/// The returned slice is empty only when the buffer is full.
	pub fn space(&mut self) -> &mut [u8] {
		if self.end == self.buf.len() && self.start > 0 {
			self.buf.copy_within(self.start..self.end, 0);
			self.end -= self.start;
			self.start = 0;
		}
		&mut self.buf[self.end..]
	}

	/// Records that `n` bytes were written into the slice returned by [`space`](Self::space).
	pub fn commit(&mut self, n: usize) {
		debug_assert!(self.end + n <= self.buf.len());
		self.end += n;
	}

	/// Returns the offset of the first occurrence of `needle` within the unread bytes.
	pub fn find(&self, needle: &[u8]) -> Option<usize> {
		self.readable()
			.windows(needle.len())
			.position(|window| window == needle)
	}
}

/// The outbound staging area: a block of wire bytes plus a send cursor.
#[derive(Debug)]
pub(crate) struct OutBuf {
	data: Vec<u8>,
	pos: usize,
}

impl OutBuf {
	/// Wraps a fully assembled wire image.
	pub fn new(data: Vec<u8>) -> Self {
		Self { data, pos: 0 }
	}

	/// Returns the bytes not yet accepted by the transport.
	pub fn remaining(&self) -> &[u8] {
		&self.data[self.pos..]
	}

	/// Returns whether everything has been written.
	pub fn is_empty(&self) -> bool {
		self.pos == self.data.len()
	}

	/// Returns how many bytes the transport has accepted so far.
	pub fn written(&self) -> usize {
		self.pos
	}

	/// Advances the send cursor past `n` accepted bytes.
	pub fn advance(&mut self, n: usize) {
		debug_assert!(self.pos + n <= self.data.len());
		self.pos += n;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	/// Fills the buffer's free space from a slice, returning how many bytes fit.
	fn fill_from(buffer: &mut ReadBuffer, src: &[u8]) -> usize {
		let space = buffer.space();
		let n = space.len().min(src.len());
		space[..n].copy_from_slice(&src[..n]);
		buffer.commit(n);
		n
	}

	/// Tests basic fill and consume.
	#[test]
	fn test_fill_consume() {
		let mut buffer = ReadBuffer::new(8);
		assert_eq!(fill_from(&mut buffer, b"abcdef"), 6);
		assert_eq!(buffer.readable(), b"abcdef");
		buffer.consume(4);
		assert_eq!(buffer.readable(), b"ef");
		buffer.consume(2);
		assert!(buffer.is_empty());
	}

	/// Tests that exhausting the tail compacts unread bytes to the front.
	#[test]
	fn test_compaction() {
		let mut buffer = ReadBuffer::new(8);
		fill_from(&mut buffer, b"abcdefgh");
		assert!(buffer.is_full());
		assert!(buffer.space().is_empty());
		buffer.consume(6);
		// Two unread bytes; compaction must free six.
		assert_eq!(fill_from(&mut buffer, b"123456"), 6);
		assert_eq!(buffer.readable(), b"gh123456");
	}

	/// Tests the sentinel search.
	#[test]
	fn test_find() {
		let mut buffer = ReadBuffer::new(32);
		fill_from(&mut buffer, b"HTTP/1.1 200 OK\r\n\r\nbody");
		assert_eq!(buffer.find(b"\r\n\r\n"), Some(15));
		assert_eq!(buffer.find(b"\r\n"), Some(15));
		assert_eq!(buffer.find(b"nope"), None);
	}

	/// Tests the outbound cursor.
	#[test]
	fn test_out_buf() {
		let mut out = OutBuf::new(b"GET / HTTP/1.1\r\n\r\n".to_vec());
		assert_eq!(out.written(), 0);
		out.advance(4);
		assert_eq!(out.remaining(), b"/ HTTP/1.1\r\n\r\n");
		out.advance(out.remaining().len());
		assert!(out.is_empty());
	}
}
