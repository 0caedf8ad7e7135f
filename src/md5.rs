//! MD5 (RFC 1321) and base64, for the optional `Content-MD5` request header.
//!
//! Used only for the integrity header, not for anything cryptographic.

// T[i] = floor(2^32 * |sin(i + 1)|), per RFC 1321 section 3.4.
const T: [u32; 64] = [
	0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
	0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
	0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
	0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
	0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
	0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
	0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
	0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

// Rotation schedule, one four-entry cycle per round.
const S1: [u32; 4] = [7, 12, 17, 22];
const S2: [u32; 4] = [5, 9, 14, 20];
const S3: [u32; 4] = [4, 11, 16, 23];
const S4: [u32; 4] = [6, 10, 15, 21];

// The auxiliary functions F, G, H, I from RFC 1321 section 3.4.
fn f(x: u32, y: u32, z: u32) -> u32 {
	(x & y) | (!x & z)
}

fn g(x: u32, y: u32, z: u32) -> u32 {
	(x & z) | (y & !z)
}

fn h(x: u32, y: u32, z: u32) -> u32 {
	x ^ y ^ z
}

fn i(x: u32, y: u32, z: u32) -> u32 {
	y ^ (x | !z)
}

/// Computes the MD5 digest of `data`.
pub(crate) fn digest(data: &[u8]) -> [u8; 16] {
	let mut state: [u32; 4] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

	let mut blocks = data.chunks_exact(64);
	for block in blocks.by_ref() {
		compress(&mut state, block);
	}

	// One or two final blocks carry the tail, the 0x80 marker, zero fill, and the bit count.
	let tail = blocks.remainder();
	let mut padded = [0u8; 128];
	padded[..tail.len()].copy_from_slice(tail);
	padded[tail.len()] = 0x80;
	let padded_len = if tail.len() < 56 { 64 } else { 128 };
	let bit_count = (data.len() as u64).wrapping_mul(8);
	padded[padded_len - 8..padded_len].copy_from_slice(&bit_count.to_le_bytes());
	for block in padded[..padded_len].chunks_exact(64) {
		compress(&mut state, block);
	}

	let mut out = [0u8; 16];
	for (slot, word) in out.chunks_exact_mut(4).zip(state) {
		slot.copy_from_slice(&word.to_le_bytes());
	}
	out
}

/// Folds one 64-byte block into the running state.
fn compress(state: &mut [u32; 4], block: &[u8]) {
	debug_assert_eq!(block.len(), 64);
	let mut m = [0u32; 16];
	for (index, chunk) in block.chunks_exact(4).enumerate() {
		m[index] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
	}

	let [mut a, mut b, mut c, mut d] = *state;
	for step in 0..16 {
		(a, b, c, d) = round(a, b, c, d, f(b, c, d), m[step], T[step], S1[step % 4]);
	}
	for step in 16..32 {
		let word = m[(5 * step + 1) % 16];
		(a, b, c, d) = round(a, b, c, d, g(b, c, d), word, T[step], S2[step % 4]);
	}
	for step in 32..48 {
		let word = m[(3 * step + 5) % 16];
		(a, b, c, d) = round(a, b, c, d, h(b, c, d), word, T[step], S3[step % 4]);
	}
	for step in 48..64 {
		let word = m[(7 * step) % 16];
		(a, b, c, d) = round(a, b, c, d, i(b, c, d), word, T[step], S4[step % 4]);
	}

	state[0] = state[0].wrapping_add(a);
	state[1] = state[1].wrapping_add(b);
	state[2] = state[2].wrapping_add(c);
	state[3] = state[3].wrapping_add(d);
}

/// One MD5 step: mix, rotate, and cycle the working registers.
fn round(a: u32, b: u32, c: u32, d: u32, mixed: u32, word: u32, t: u32, s: u32) -> (u32, u32, u32, u32) {
	let rotated = a
		.wrapping_add(mixed)
		.wrapping_add(word)
		.wrapping_add(t)
		.rotate_left(s);
	(d, b.wrapping_add(rotated), b, c)
}

const BASE64_ALPHABET: &[u8; 64] =
	b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Encodes bytes as standard base64 with padding.
pub(crate) fn base64(data: &[u8]) -> String {
	let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
	for group in data.chunks(3) {
		let b0 = group[0] as u32;
		let b1 = group.get(1).copied().unwrap_or(0) as u32;
		let b2 = group.get(2).copied().unwrap_or(0) as u32;
		let triple = (b0 << 16) | (b1 << 8) | b2;
		out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3F] as char);
		out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3F] as char);
		out.push(if group.len() > 1 {
			BASE64_ALPHABET[(triple >> 6) as usize & 0x3F] as char
		} else {
			'='
		});
		out.push(if group.len() > 2 {
			BASE64_ALPHABET[triple as usize & 0x3F] as char
		} else {
			'='
		});
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;
	use std::fmt::Write as _;

	fn hex(bytes: &[u8]) -> String {
		let mut out = String::with_capacity(bytes.len() * 2);
		for b in bytes {
			let _ = write!(out, "{b:02x}");
		}
		out
	}

	/// Tests the RFC 1321 reference digests.
	#[test]
	fn test_digest_vectors() {
		assert_eq!(hex(&digest(b"")), "d41d8cd98f00b204e9800998ecf8427e");
		assert_eq!(hex(&digest(b"abc")), "900150983cd24fb0d6963f7d28e17f72");
		assert_eq!(
			hex(&digest(b"message digest")),
			"f96b697d7cb7938d525a2f31aaf161d0"
		);
	}

	/// Tests the longer RFC 1321 vectors: a tail of 56 bytes or more spills the padding into a
	/// second final block, and an 80-byte input exercises a full block plus a short tail.
	#[test]
	fn test_digest_padding_boundary() {
		assert_eq!(
			hex(&digest(
				b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789"
			)),
			"d174ab98d277d9f5a5611c2c9f419d9f"
		);
		assert_eq!(
			hex(&digest(
				b"12345678901234567890123456789012345678901234567890123456789012345678901234567890"
			)),
			"57edf4a22be3c955ac49da2e2107b67a"
		);
	}

	/// Tests base64 padding behavior.
	#[test]
	fn test_base64() {
		assert_eq!(base64(b""), "");
		assert_eq!(base64(b"f"), "Zg==");
		assert_eq!(base64(b"fo"), "Zm8=");
		assert_eq!(base64(b"foo"), "Zm9v");
		assert_eq!(base64(b"foobar"), "Zm9vYmFy");
	}

	/// Tests the combination used for the Content-MD5 header.
	#[test]
	fn test_content_md5_value() {
		assert_eq!(base64(&digest(b"hello world")), "XrY7u+Ae7tCTyyK7j1rNww==");
	}
}
