//! The response parser: status line, header block, body framing, chunk headers, trailers.
//!
//! The connection accumulates bytes until the end-of-headers sentinel and hands the complete
//! block here. Parsing is strict HTTP/1.1: the status line must read `HTTP/1.1 <code> <reason>`,
//! header lines end in CRLF, and obsolete line folding is tolerated on the way in by joining
//! continuation lines with a single space.

use crate::error::Error;
use crate::headers::{self, HeaderMap};
use tracing::{debug, trace};

/// The most headers (or trailers) accepted in one block.
const MAX_HEADERS: usize = 256;

/// The body length discipline of a message, chosen deterministically from the header set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Framing {
	/// No body at all (HEAD responses and the 1xx/204/304 status codes).
	None,

	/// Exactly this many bytes.
	Fixed(u64),

	/// A chunk stream terminated by a zero-length chunk and an optional trailer block.
	Chunked,

	/// Everything up to a clean EOF; the connection is torn down afterwards.
	UntilClose,
}

/// A response, as returned by `read_response`. Immutable once produced; body data is read from
/// the connection itself.
#[derive(Clone, Debug)]
pub struct Response {
	/// The method of the request this response answers, echoed for correlation.
	pub method: String,

	/// The target of the request this response answers, echoed for correlation.
	pub target: String,

	/// The status code.
	pub status: u16,

	/// The reason phrase.
	pub reason: String,

	/// The response headers.
	pub headers: HeaderMap,

	/// The body length discipline.
	pub framing: Framing,
}

impl Response {
	/// Returns the body length, if the framing declares one up front.
	pub fn length(&self) -> Option<u64> {
		match self.framing {
			Framing::None => Some(0),
			Framing::Fixed(n) => Some(n),
			Framing::Chunked | Framing::UntilClose => None,
		}
	}
}

/// The decoded status line and header block, before body framing is decided.
pub(crate) struct Head {
	pub status: u16,
	pub reason: String,
	pub headers: HeaderMap,
}

/// Parses a complete header block (status line through the blank line, sentinel included).
///
/// # Errors
/// [`Error::UnsupportedResponse`] for an HTTP version below 1.1;
/// [`Error::InvalidResponse`] for anything httparse rejects, for header values that remain
/// illegal after unfolding, and for duplicated singleton headers.
pub(crate) fn parse_head(block: &[u8]) -> Result<Head, Error> {
	let mut storage = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut parsed = httparse::Response::new(&mut storage);
	let mut config = httparse::ParserConfig::default();
	config.allow_obsolete_multiline_headers_in_responses(true);
	match config.parse_response(&mut parsed, block) {
		Ok(httparse::Status::Complete(n)) if n == block.len() => (),
		Ok(_) => {
			return Err(Error::InvalidResponse(
				"malformed response header block".into(),
			))
		}
		Err(e) => return Err(Error::InvalidResponse(format!("bad response head: {e}"))),
	}

	match parsed.version {
		Some(1) => (),
		Some(minor) => {
			return Err(Error::UnsupportedResponse(format!(
				"HTTP/1.{minor} responses are not supported"
			)))
		}
		None => return Err(Error::InvalidResponse("missing HTTP version".into())),
	}
	let status = parsed
		.code
		.ok_or_else(|| Error::InvalidResponse("missing status code".into()))?;
	let reason = parsed.reason.unwrap_or("").trim().to_owned();
	trace!("parsed status line: {status:03} {reason}");

	let headers = convert_headers(parsed.headers)?;
	if let Some(name) = headers.duplicate_singleton() {
		return Err(Error::InvalidResponse(format!(
			"duplicate {name} header"
		)));
	}
	Ok(Head {
		status,
		reason,
		headers,
	})
}

/// Parses a chunked-trailer block (trailer lines through the blank line, sentinel included).
pub(crate) fn parse_trailer(block: &[u8]) -> Result<HeaderMap, Error> {
	let mut storage = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
	match httparse::parse_headers(block, &mut storage) {
		Ok(httparse::Status::Complete((_, parsed))) => convert_headers(parsed),
		Ok(httparse::Status::Partial) => {
			Err(Error::InvalidResponse("malformed trailer block".into()))
		}
		Err(e) => Err(Error::InvalidResponse(format!("bad trailer block: {e}"))),
	}
}

/// Converts httparse headers into the engine's multimap: unfold continuation lines, decode
/// latin-1, and enforce the field-value character rules.
fn convert_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, Error> {
	let mut headers = HeaderMap::new();
	for header in parsed {
		let value = headers::latin1_decode(&unfold(header.value));
		if !headers::is_field_value(&value) {
			return Err(Error::InvalidResponse(format!(
				"illegal value in {} header",
				header.name
			)));
		}
		// httparse only yields token names, so append cannot panic.
		headers.append(header.name, &value);
	}
	Ok(headers)
}

/// Collapses obsolete line folds: every line break plus its leading whitespace becomes a single
/// space, and surrounding blanks are trimmed.
fn unfold(value: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(value.len());
	let mut index = 0;
	while index < value.len() {
		let b = value[index];
		if b == b'\r' || b == b'\n' {
			index += 1;
			while index < value.len()
				&& matches!(value[index], b'\r' | b'\n' | b' ' | b'\t')
			{
				index += 1;
			}
			if !out.is_empty() && index < value.len() {
				out.push(b' ');
			}
		} else {
			out.push(b);
			index += 1;
		}
	}
	while out.last() == Some(&b' ') || out.last() == Some(&b'\t') {
		out.pop();
	}
	while out.first() == Some(&b' ') || out.first() == Some(&b'\t') {
		out.remove(0);
	}
	out
}

/// Decides the body length discipline from `(method, status, headers)`.
///
/// The dispatch order is fixed: bodiless statuses first, then `Transfer-Encoding`, then
/// `Content-Length`, then close-delimiting; a response matching none of these has no usable
/// framing and is unsupported.
pub(crate) fn body_framing(
	method: &str,
	status: u16,
	response_headers: &HeaderMap,
) -> Result<Framing, Error> {
	if method == "HEAD" || (100..200).contains(&status) || status == 204 || status == 304 {
		debug!("no body by status rules");
		return Ok(Framing::None);
	}
	if let Some(te) = response_headers.get("transfer-encoding") {
		let te = te.trim();
		if te.eq_ignore_ascii_case("chunked") {
			debug!("chunked encoding detected");
			return Ok(Framing::Chunked);
		}
		if !te.eq_ignore_ascii_case("identity") {
			// Anything else is a coding the server had no business sending.
			return Err(Error::InvalidResponse(format!(
				"cannot handle {te} transfer encoding"
			)));
		}
	}
	if let Some(length) = response_headers.get("content-length") {
		let length = length
			.trim()
			.parse::<u64>()
			.map_err(|_| Error::InvalidResponse(format!("bad Content-Length {length:?}")))?;
		return Ok(Framing::Fixed(length));
	}
	if headers::is_connection_close(response_headers) {
		debug!("close-delimited body");
		return Ok(Framing::UntilClose);
	}
	Err(Error::UnsupportedResponse(
		"response has no content length, is not chunked, and is not close-delimited".into(),
	))
}

/// Parses one chunk-size line (without its CRLF). Chunk extensions after `;` are ignored.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<u64, Error> {
	let size_part = match line.iter().position(|&b| b == b';') {
		Some(semi) => &line[..semi],
		None => line,
	};
	let text = std::str::from_utf8(size_part)
		.map_err(|_| Error::InvalidResponse("chunk size is not text".into()))?
		.trim();
	if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
		return Err(Error::InvalidResponse(format!(
			"cannot read chunk size {text:?}"
		)));
	}
	u64::from_str_radix(text, 16)
		.map_err(|_| Error::InvalidResponse(format!("chunk size {text:?} is too large")))
}

#[cfg(test)]
mod test {
	use super::*;

	/// Tests parsing a basic head.
	#[test]
	fn test_parse_head() {
		let head = parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: x\r\n\r\n").unwrap();
		assert_eq!(head.status, 200);
		assert_eq!(head.reason, "OK");
		assert_eq!(head.headers.get("content-length"), Some("5"));
		assert_eq!(head.headers.get("server"), Some("x"));
	}

	/// Tests that an empty reason phrase is accepted.
	#[test]
	fn test_parse_head_no_reason() {
		let head = parse_head(b"HTTP/1.1 204 \r\n\r\n").unwrap();
		assert_eq!(head.status, 204);
		assert_eq!(head.reason, "");
	}

	/// Tests that HTTP/1.0 is rejected as unsupported.
	#[test]
	fn test_parse_head_http_10() {
		match parse_head(b"HTTP/1.0 200 OK\r\n\r\n") {
			Err(Error::UnsupportedResponse(_)) => (),
			other => panic!("expected UnsupportedResponse, got {:?}", other.err()),
		}
	}

	/// Tests that a non-HTTP preamble is rejected as invalid.
	#[test]
	fn test_parse_head_not_http() {
		match parse_head(b"ICY 200 OK\r\n\r\n") {
			Err(Error::InvalidResponse(_)) => (),
			other => panic!("expected InvalidResponse, got {:?}", other.err()),
		}
	}

	/// Tests that folded header values are joined with a single space.
	#[test]
	fn test_parse_head_folded_value() {
		let head = parse_head(
			b"HTTP/1.1 200 OK\r\nX-Folded: part one\r\n    part two\r\nServer: x\r\n\r\n",
		)
		.unwrap();
		assert_eq!(head.headers.get("x-folded"), Some("part one part two"));
		assert_eq!(head.headers.get("server"), Some("x"));
	}

	/// Tests that a duplicated singleton header is rejected while general duplicates survive.
	#[test]
	fn test_parse_head_duplicates() {
		match parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n") {
			Err(Error::InvalidResponse(msg)) => assert!(msg.contains("content-length")),
			other => panic!("expected InvalidResponse, got {:?}", other.err()),
		}
		let head =
			parse_head(b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n")
				.unwrap();
		let cookies: Vec<&str> = head.headers.get_all("set-cookie").collect();
		assert_eq!(cookies, ["a=1", "b=2"]);
	}

	/// Tests a latin-1 header value surviving the wire.
	#[test]
	fn test_parse_head_latin1() {
		let head = parse_head(b"HTTP/1.1 200 OK\r\nX-Name: caf\xE9\r\nContent-Length: 0\r\n\r\n")
			.unwrap();
		assert_eq!(head.headers.get("x-name"), Some("caf\u{00E9}"));
	}

	/// Tests the body framing decision table.
	#[test]
	fn test_body_framing() {
		let mut headers = HeaderMap::new();
		headers.set("Content-Length", "10");
		assert_eq!(
			body_framing("GET", 200, &headers).unwrap(),
			Framing::Fixed(10)
		);
		// HEAD and bodiless statuses win over any framing headers.
		assert_eq!(body_framing("HEAD", 200, &headers).unwrap(), Framing::None);
		assert_eq!(body_framing("GET", 204, &headers).unwrap(), Framing::None);
		assert_eq!(body_framing("GET", 304, &headers).unwrap(), Framing::None);
		assert_eq!(body_framing("GET", 101, &headers).unwrap(), Framing::None);

		let mut headers = HeaderMap::new();
		headers.set("Transfer-Encoding", "chunked");
		assert_eq!(
			body_framing("GET", 200, &headers).unwrap(),
			Framing::Chunked
		);

		let mut headers = HeaderMap::new();
		headers.set("Transfer-Encoding", "gzip");
		assert!(matches!(
			body_framing("GET", 200, &headers),
			Err(Error::InvalidResponse(_))
		));

		let mut headers = HeaderMap::new();
		headers.set("Connection", "close");
		assert_eq!(
			body_framing("GET", 200, &headers).unwrap(),
			Framing::UntilClose
		);

		assert!(matches!(
			body_framing("GET", 200, &HeaderMap::new()),
			Err(Error::UnsupportedResponse(_))
		));
	}

	/// Tests that `identity` transfer encoding falls through to the other rules.
	#[test]
	fn test_body_framing_identity() {
		let mut headers = HeaderMap::new();
		headers.set("Transfer-Encoding", "identity");
		headers.set("Content-Length", "3");
		assert_eq!(
			body_framing("GET", 200, &headers).unwrap(),
			Framing::Fixed(3)
		);
	}

	/// Tests a bad Content-Length value.
	#[test]
	fn test_body_framing_bad_length() {
		let mut headers = HeaderMap::new();
		headers.set("Content-Length", "-1");
		assert!(matches!(
			body_framing("GET", 200, &headers),
			Err(Error::InvalidResponse(_))
		));
	}

	/// Tests chunk-size line parsing.
	#[test]
	fn test_parse_chunk_size() {
		assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
		assert_eq!(parse_chunk_size(b"C").unwrap(), 12);
		assert_eq!(parse_chunk_size(b"1a2b").unwrap(), 0x1a2b);
		assert_eq!(parse_chunk_size(b"5; name=value").unwrap(), 5);
		assert_eq!(parse_chunk_size(b"  5  ").unwrap(), 5);
		assert!(parse_chunk_size(b"xyz").is_err());
		assert!(parse_chunk_size(b"").is_err());
		assert!(parse_chunk_size(b"123456789012345678901").is_err());
	}

	/// Tests trailer-block parsing.
	#[test]
	fn test_parse_trailer() {
		let trailers = parse_trailer(b"X-Check: 99\r\nX-Other: yes\r\n\r\n").unwrap();
		assert_eq!(trailers.get("x-check"), Some("99"));
		assert_eq!(trailers.get("x-other"), Some("yes"));
	}

	/// Tests the unfold helper directly.
	#[test]
	fn test_unfold() {
		assert_eq!(unfold(b"plain"), b"plain");
		assert_eq!(unfold(b"one\r\n two"), b"one two");
		assert_eq!(unfold(b"one\r\n\t\t   two"), b"one two");
		assert_eq!(unfold(b"one\r\n "), b"one");
	}
}
