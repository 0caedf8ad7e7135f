//! The failure taxonomy.
//!
//! Parser and transport failures propagate out of whichever cooperative step was running. A
//! [`Closed`](Error::Closed) or [`InvalidResponse`](Error::InvalidResponse) failure permanently
//! invalidates the connection: every later operation except `disconnect` reports the same
//! condition. [`State`](Error::State) and [`ExcessBodyData`](Error::ExcessBodyData) leave the
//! connection usable if the caller can resynchronize. A truncated body is never delivered
//! silently; a short read relative to the declared length is always [`Closed`](Error::Closed).

use std::net::ToSocketAddrs;

/// Errors produced by the client engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The transport reached EOF or was reset at a point where more data was required, or an
	/// operation was attempted on a connection that is not open.
	#[error("connection closed: {0}")]
	Closed(String),

	/// No progress was made within the configured deadline.
	#[error("operation timed out")]
	TimedOut,

	/// The server sent a wire-level malformed response.
	#[error("invalid response: {0}")]
	InvalidResponse(String),

	/// The server sent a wire-legal response the engine does not support, such as a body with no
	/// declared framing or an HTTP version below 1.1.
	#[error("unsupported response: {0}")]
	UnsupportedResponse(String),

	/// The caller tried to write past the declared request body length.
	#[error("cannot write {requested} body bytes, only {remaining} still announced")]
	ExcessBodyData {
		/// The number of bytes the caller tried to write.
		requested: u64,
		/// The number of body bytes the request still allows.
		remaining: u64,
	},

	/// The operation does not make sense in the current connection state.
	#[error("{0}")]
	State(&'static str),

	/// The hostname did not resolve to any address.
	#[error("hostname {hostname:?} did not resolve")]
	HostnameNotResolvable {
		/// The hostname that failed to resolve.
		hostname: String,
	},

	/// Name resolution failed in a way that points at the resolver rather than the name.
	#[error("no usable DNS while resolving {hostname:?}")]
	DnsUnavailable {
		/// The hostname that was being resolved.
		hostname: String,
	},

	/// A TLS protocol failure.
	#[error("tls error: {0}")]
	Tls(#[from] rustls::Error),

	/// An I/O error that the transport adapter did not normalize.
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Classifies a failure as a potentially temporary network problem.
///
/// This is advisory only, intended for caller-side retry loops. Timeouts, closed connections, and
/// transport-level resets all count as temporary.
///
/// An unresolvable hostname is formally a permanent failure, but it can also mean that there is
/// currently no route to any DNS server. The `probe_hosts` list is the caller's configuration for
/// telling the two apart: when it is non-empty and none of the probe hosts resolve either, the
/// failure is classified as temporary. Pass an empty list to skip probing.
pub fn is_temp_network_error(err: &Error, probe_hosts: &[&str]) -> bool {
	match err {
		Error::TimedOut | Error::Closed(_) | Error::DnsUnavailable { .. } => true,
		Error::Io(e) => matches!(
			e.kind(),
			std::io::ErrorKind::ConnectionReset
				| std::io::ErrorKind::ConnectionAborted
				| std::io::ErrorKind::ConnectionRefused
				| std::io::ErrorKind::BrokenPipe
				| std::io::ErrorKind::TimedOut
		),
		Error::HostnameNotResolvable { .. } => {
			!probe_hosts.is_empty() && !probe_hosts.iter().any(|h| resolves(h))
		}
		_ => false,
	}
}

/// Returns whether `host` currently resolves to at least one address.
fn resolves(host: &str) -> bool {
	(host, 80_u16)
		.to_socket_addrs()
		.map(|mut addrs| addrs.next().is_some())
		.unwrap_or(false)
}

#[cfg(test)]
mod test {
	use super::*;

	/// Tests the classification of the engine's own error kinds.
	#[test]
	fn test_temp_network_error_kinds() {
		assert!(is_temp_network_error(&Error::TimedOut, &[]));
		assert!(is_temp_network_error(
			&Error::Closed("peer went away".into()),
			&[]
		));
		assert!(is_temp_network_error(
			&Error::DnsUnavailable {
				hostname: "x".into()
			},
			&[]
		));
		assert!(!is_temp_network_error(
			&Error::InvalidResponse("bad".into()),
			&[]
		));
		assert!(!is_temp_network_error(&Error::State("nope"), &[]));
	}

	/// Tests the classification of normalized I/O error kinds.
	#[test]
	fn test_temp_io_kinds() {
		let reset = Error::Io(std::io::ErrorKind::ConnectionReset.into());
		assert!(is_temp_network_error(&reset, &[]));
		let denied = Error::Io(std::io::ErrorKind::PermissionDenied.into());
		assert!(!is_temp_network_error(&denied, &[]));
	}

	/// Tests that an unresolvable hostname is permanent without a probe list.
	#[test]
	fn test_unresolvable_without_probes() {
		let err = Error::HostnameNotResolvable {
			hostname: "nonexistent.invalid".into(),
		};
		assert!(!is_temp_network_error(&err, &[]));
	}

	/// Tests that an unresolvable hostname is temporary when the probe hosts do not resolve
	/// either.
	#[test]
	fn test_unresolvable_with_dead_probes() {
		let err = Error::HostnameNotResolvable {
			hostname: "nonexistent.invalid".into(),
		};
		assert!(is_temp_network_error(&err, &["also-nonexistent.invalid"]));
	}
}
