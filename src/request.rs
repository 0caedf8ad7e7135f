//! The request encoder.
//!
//! Serializes a request line and headers, chooses the body framing, and coalesces everything that
//! can be sent eagerly into one staged wire image. The encoder never touches the transport; the
//! pipeline decides when to push the staged bytes, and partial writes simply resume at the
//! cursor.

use crate::error::Error;
use crate::headers::{self, HeaderMap};
use crate::md5;
use std::fmt::Write as _;
use tracing::trace;

/// The request body, as declared by the caller at `send_request` time.
#[derive(Clone, Copy, Debug)]
pub enum Body<'a> {
	/// No body.
	None,

	/// The whole body, available now; it is coalesced with the headers into one write stream.
	Inline(&'a [u8]),

	/// A promise that exactly this many body bytes will arrive through later `write` calls.
	///
	/// This is the shape required for an `Expect: 100-continue` rendezvous, since the point of
	/// the handshake is to hold the body back until the server asks for it.
	Following(u64),
}

/// Where the connection gets the values it injects into a request.
pub(crate) struct Origin<'a> {
	pub hostname: &'a str,
	pub port: u16,
	pub tls: bool,
	pub proxy: bool,
	pub content_md5: bool,
}

/// A fully staged request: the coalesced wire image plus what the pipeline needs to know about
/// the part of the body that is not in it.
pub(crate) struct Encoded {
	/// The request line, headers, blank line, and any inline body, ready for the transport.
	pub wire: Vec<u8>,

	/// How many bytes of `wire` make up the request line, headers, and blank line. The pending
	/// record is enqueued the moment the send cursor crosses this offset.
	pub header_len: usize,

	/// `Some(n)` if the caller promised `n` body bytes through later `write` calls.
	pub following: Option<u64>,
}

/// Serializes a request.
///
/// The caller's header map is not modified; framing headers (`Content-Length`, `Expect`,
/// `Content-MD5`, `Host`) are injected into a copy.
///
/// # Errors
/// Returns [`Error::State`] if `expect100` is requested without a [`Body::Following`] body, or if
/// a streamed body is combined with chunked transfer encoding.
///
/// # Panics
/// In a debug build, panics if the method is not a token (or is `CONNECT`, which is not
/// supported), if the target is empty or contains bytes outside 0x21–0x7F, if a caller-supplied
/// `Transfer-Encoding` is anything other than `chunked`, or if a singleton header appears more
/// than once. Such requests are application bugs, not runtime conditions.
pub(crate) fn encode(
	method: &str,
	target: &str,
	caller_headers: &HeaderMap,
	body: Body<'_>,
	expect100: bool,
	origin: &Origin<'_>,
) -> Result<Encoded, Error> {
	debug_assert!(
		headers::is_token(method),
		"request method {method:?} is not a token"
	);
	debug_assert!(method != "CONNECT", "the CONNECT method is not supported");
	debug_assert!(
		headers::is_request_target(target) || target.contains("://"),
		"request target {target:?} contains invalid characters"
	);
	debug_assert!(
		target.starts_with('/') || target.contains("://"),
		"request target {target:?} is not origin-form or absolute-form"
	);

	let mut headers = caller_headers.clone();
	let chunked = match headers.get("transfer-encoding") {
		Some(te) => {
			debug_assert!(
				te.trim().eq_ignore_ascii_case("chunked"),
				"request Transfer-Encoding is {te:?}, but only chunked is supported"
			);
			true
		}
		None => false,
	};

	let mut following = None;
	match body {
		Body::None => {
			if expect100 {
				return Err(Error::State(
					"expect100 requires a body announced with Body::Following",
				));
			}
		}
		Body::Inline(bytes) => {
			if expect100 {
				return Err(Error::State(
					"expect100 requires a body announced with Body::Following",
				));
			}
			if chunked {
				headers.remove("Content-Length");
			} else {
				headers.set("Content-Length", &bytes.len().to_string());
			}
			if origin.content_md5 && !headers.contains("content-md5") {
				headers.set("Content-MD5", &md5::base64(&md5::digest(bytes)));
			}
		}
		Body::Following(length) => {
			if chunked {
				return Err(Error::State(
					"streamed request bodies are fixed-length; chunked bodies must be inline",
				));
			}
			headers.set("Content-Length", &length.to_string());
			if expect100 {
				headers.set("Expect", "100-continue");
			}
			following = Some(length);
		}
	}

	if !headers.contains("host") {
		headers.set("Host", &host_header(origin));
	}
	debug_assert!(
		headers.duplicate_singleton().is_none(),
		"request contains a duplicated singleton header"
	);

	// Request line. With a proxy the target is rewritten to absolute-form.
	let mut wire = Vec::with_capacity(256);
	wire.extend_from_slice(method.as_bytes());
	wire.push(b' ');
	if origin.proxy && !target.contains("://") {
		wire.extend_from_slice(b"http://");
		wire.extend_from_slice(authority(origin).as_bytes());
	}
	wire.extend_from_slice(target.as_bytes());
	wire.extend_from_slice(b" HTTP/1.1\r\n");

	for (name, value) in headers.iter() {
		wire.extend_from_slice(name.as_bytes());
		wire.extend_from_slice(b": ");
		headers::latin1_encode(value, &mut wire);
		wire.extend_from_slice(b"\r\n");
	}
	wire.extend_from_slice(b"\r\n");
	let header_len = wire.len();

	match body {
		Body::Inline(bytes) if chunked => {
			if !bytes.is_empty() {
				let mut size_line = String::new();
				// Writing to a String cannot fail.
				let _ = write!(size_line, "{:X}\r\n", bytes.len());
				wire.extend_from_slice(size_line.as_bytes());
				wire.extend_from_slice(bytes);
				wire.extend_from_slice(b"\r\n");
			}
			wire.extend_from_slice(b"0\r\n\r\n");
		}
		Body::Inline(bytes) => wire.extend_from_slice(bytes),
		Body::None if chunked => wire.extend_from_slice(b"0\r\n\r\n"),
		Body::None | Body::Following(_) => (),
	}

	trace!(
		"staged {} request for {} ({} wire bytes)",
		method,
		target,
		wire.len()
	);
	Ok(Encoded {
		wire,
		header_len,
		following,
	})
}

/// Builds the `Host` header value: bracketed for IPv6 literals, port omitted when it is the
/// scheme default.
fn host_header(origin: &Origin<'_>) -> String {
	let default_port = if origin.tls { 443 } else { 80 };
	let host = if origin.hostname.contains(':') {
		format!("[{}]", origin.hostname)
	} else {
		origin.hostname.to_owned()
	};
	if origin.port == default_port {
		host
	} else {
		format!("{}:{}", host, origin.port)
	}
}

/// Builds the authority part of an absolute-form target (proxy mode is plain HTTP, so the
/// default port is 80).
fn authority(origin: &Origin<'_>) -> String {
	let host = if origin.hostname.contains(':') {
		format!("[{}]", origin.hostname)
	} else {
		origin.hostname.to_owned()
	};
	if origin.port == 80 {
		host
	} else {
		format!("{}:{}", host, origin.port)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn origin() -> Origin<'static> {
		Origin {
			hostname: "server.example.com",
			port: 80,
			tls: false,
			proxy: false,
			content_md5: false,
		}
	}

	/// Tests a bare GET with an injected Host header.
	#[test]
	fn test_get() {
		let encoded = encode(
			"GET",
			"/where",
			&HeaderMap::new(),
			Body::None,
			false,
			&origin(),
		)
		.unwrap();
		assert_eq!(
			encoded.wire,
			b"GET /where HTTP/1.1\r\nHost: server.example.com\r\n\r\n"
		);
		assert_eq!(encoded.header_len, encoded.wire.len());
		assert_eq!(encoded.following, None);
	}

	/// Tests that a caller-supplied Host is not overridden and a non-default port is appended
	/// otherwise.
	#[test]
	fn test_host_injection() {
		let mut headers = HeaderMap::new();
		headers.set("Host", "override.example.com");
		let encoded = encode("GET", "/", &headers, Body::None, false, &origin()).unwrap();
		assert_eq!(
			encoded.wire,
			b"GET / HTTP/1.1\r\nHost: override.example.com\r\n\r\n"
		);

		let with_port = Origin {
			port: 8080,
			..origin()
		};
		let encoded = encode("GET", "/", &HeaderMap::new(), Body::None, false, &with_port).unwrap();
		assert_eq!(
			encoded.wire,
			b"GET / HTTP/1.1\r\nHost: server.example.com:8080\r\n\r\n"
		);
	}

	/// Tests an inline body with its computed Content-Length.
	#[test]
	fn test_inline_body() {
		let mut headers = HeaderMap::new();
		headers.set("Content-Type", "text/plain");
		let encoded = encode(
			"POST",
			"/submit",
			&headers,
			Body::Inline(b"hello"),
			false,
			&origin(),
		)
		.unwrap();
		assert_eq!(
			encoded.wire,
			&b"POST /submit HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nHost: server.example.com\r\n\r\nhello"[..]
		);
		assert_eq!(encoded.header_len, encoded.wire.len() - 5);
	}

	/// Tests chunked framing of an inline body, including removal of Content-Length.
	#[test]
	fn test_inline_chunked() {
		let mut headers = HeaderMap::new();
		headers.set("Transfer-Encoding", "chunked");
		headers.set("Content-Length", "999");
		let encoded = encode(
			"POST",
			"/submit",
			&headers,
			Body::Inline(b"Hello World!"),
			false,
			&origin(),
		)
		.unwrap();
		assert_eq!(
			encoded.wire,
			&b"POST /submit HTTP/1.1\r\nTransfer-Encoding: chunked\r\nHost: server.example.com\r\n\r\nC\r\nHello World!\r\n0\r\n\r\n"[..]
		);
	}

	/// Tests a deferred body with the 100-continue rendezvous headers.
	#[test]
	fn test_following_expect100() {
		let encoded = encode(
			"PUT",
			"/upload",
			&HeaderMap::new(),
			Body::Following(4),
			true,
			&origin(),
		)
		.unwrap();
		assert_eq!(
			encoded.wire,
			&b"PUT /upload HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\nHost: server.example.com\r\n\r\n"[..]
		);
		assert_eq!(encoded.following, Some(4));
		assert_eq!(encoded.header_len, encoded.wire.len());
	}

	/// Tests that expect100 without a deferred body is refused.
	#[test]
	fn test_expect100_requires_following() {
		match encode(
			"PUT",
			"/upload",
			&HeaderMap::new(),
			Body::Inline(b"data"),
			true,
			&origin(),
		) {
			Err(Error::State(_)) => (),
			other => panic!("expected a state error, got {:?}", other.map(|e| e.wire)),
		}
	}

	/// Tests the opt-in Content-MD5 computation.
	#[test]
	fn test_content_md5_opt_in() {
		let with_md5 = Origin {
			content_md5: true,
			..origin()
		};
		let encoded = encode(
			"POST",
			"/",
			&HeaderMap::new(),
			Body::Inline(b"hello world"),
			false,
			&with_md5,
		)
		.unwrap();
		let text = String::from_utf8(encoded.wire).unwrap();
		assert!(text.contains("Content-MD5: XrY7u+Ae7tCTyyK7j1rNww==\r\n"));

		// Off by default.
		let encoded = encode(
			"POST",
			"/",
			&HeaderMap::new(),
			Body::Inline(b"hello world"),
			false,
			&origin(),
		)
		.unwrap();
		let text = String::from_utf8(encoded.wire).unwrap();
		assert!(!text.contains("Content-MD5"));
	}

	/// Tests absolute-form rewriting in proxy mode.
	#[test]
	fn test_proxy_absolute_form() {
		let proxied = Origin {
			proxy: true,
			port: 8080,
			..origin()
		};
		let encoded = encode("GET", "/path?q=1", &HeaderMap::new(), Body::None, false, &proxied)
			.unwrap();
		let text = String::from_utf8(encoded.wire).unwrap();
		assert!(text.starts_with("GET http://server.example.com:8080/path?q=1 HTTP/1.1\r\n"));
	}

	/// Tests latin-1 emission of a high-byte header value.
	#[test]
	fn test_latin1_value() {
		let mut headers = HeaderMap::new();
		headers.set("X-Name", "caf\u{00E9}");
		let encoded = encode("GET", "/", &headers, Body::None, false, &origin()).unwrap();
		let needle = b"X-Name: caf\xE9\r\n";
		assert!(encoded
			.wire
			.windows(needle.len())
			.any(|window| window == needle));
	}
}
