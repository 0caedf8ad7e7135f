//! The transport adapter: non-blocking send/recv over a plain or TLS-wrapped stream socket.
//!
//! Both operations return a [`Step`]: a byte count (zero meaning clean EOF on the read side), or
//! a [`PollNeeded`] naming the readiness the *transport* requires. For a TLS session that may be
//! the opposite direction from the logical operation: a logical read that has to flush a
//! handshake reply surfaces a write interest, and a logical write starved of handshake input
//! surfaces a read interest. Interrupted system calls are retried transparently, and peer-close,
//! reset, and broken-pipe conditions are normalized to [`Error::Closed`].

use crate::error::Error;
use crate::poll::{Interest, PollNeeded, Step};
use rustls::pki_types::ServerName;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// A non-blocking stream socket, optionally wrapped in a TLS session.
pub(crate) struct Transport {
	sock: TcpStream,
	tls: Option<Box<rustls::ClientConnection>>,
	peer_cert: Option<Vec<u8>>,
}

impl Transport {
	/// Wraps a connected socket without TLS.
	pub fn plain(sock: TcpStream) -> Result<Self, Error> {
		sock.set_nonblocking(true)?;
		Ok(Self {
			sock,
			tls: None,
			peer_cert: None,
		})
	}

	/// Wraps a connected socket in a TLS session and completes the handshake.
	///
	/// The handshake is driven to completion here, waiting for readiness as needed, so that the
	/// peer certificate can be snapshotted before any HTTP bytes flow. `deadline` bounds the
	/// whole handshake.
	pub fn tls(
		sock: TcpStream,
		config: Arc<rustls::ClientConfig>,
		hostname: &str,
		deadline: Option<Instant>,
	) -> Result<Self, Error> {
		sock.set_nonblocking(true)?;
		let name = ServerName::try_from(hostname.to_owned()).map_err(|_| {
			Error::HostnameNotResolvable {
				hostname: hostname.to_owned(),
			}
		})?;
		let session = rustls::ClientConnection::new(config, name)?;
		let mut transport = Self {
			sock,
			tls: Some(Box::new(session)),
			peer_cert: None,
		};
		transport.handshake(deadline)?;
		if let Some(tls) = &transport.tls {
			transport.peer_cert = tls
				.peer_certificates()
				.and_then(|certs| certs.first())
				.map(|cert| cert.as_ref().to_vec());
		}
		debug!("tls handshake complete");
		Ok(transport)
	}

	/// Drives the TLS handshake to completion, parking on readiness as needed.
	fn handshake(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
		let fd = self.sock.as_raw_fd();
		loop {
			let tls = match &mut self.tls {
				Some(tls) => tls,
				None => return Ok(()),
			};
			if !tls.is_handshaking() {
				return Ok(());
			}
			if tls.wants_write() {
				match tls.write_tls(&mut self.sock) {
					Ok(_) => continue,
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						PollNeeded::new(fd, Interest::WRITABLE).wait_deadline(deadline)?;
					}
					Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
					Err(e) => return Err(normalize_write_error(e)),
				}
			} else {
				match tls.read_tls(&mut self.sock) {
					Ok(0) => {
						return Err(Error::Closed(
							"connection closed during tls handshake".into(),
						))
					}
					Ok(_) => {
						tls.process_new_packets()?;
					}
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						PollNeeded::new(fd, Interest::READABLE).wait_deadline(deadline)?;
					}
					Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
					Err(e) => return Err(normalize_read_error(e)),
				}
			}
		}
	}

	/// Returns the underlying file descriptor, for readiness waiting.
	pub fn fd(&self) -> RawFd {
		self.sock.as_raw_fd()
	}

	/// Returns the peer's end-entity certificate in DER form, if this is a TLS transport.
	pub fn peer_certificate(&self) -> Option<&[u8]> {
		self.peer_cert.as_deref()
	}

	/// Attempts to read bytes into `dst`.
	///
	/// `Done(0)` is a clean EOF; whether EOF is acceptable at this point is for the caller to
	/// decide.
	pub fn try_read(&mut self, dst: &mut [u8]) -> Result<Step<usize>, Error> {
		let fd = self.sock.as_raw_fd();
		match &mut self.tls {
			None => loop {
				match self.sock.read(dst) {
					Ok(n) => return Ok(Step::Done(n)),
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						return Ok(Step::Pending(PollNeeded::new(fd, Interest::READABLE)))
					}
					Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
					Err(e) => return Err(normalize_read_error(e)),
				}
			},
			Some(tls) => loop {
				match tls.reader().read(dst) {
					Ok(n) => return Ok(Step::Done(n)),
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						// No plaintext buffered. Flush anything rustls wants to send (handshake
						// replies, key updates) before asking for more ciphertext; that flush is
						// where a logical read can surface a *write* interest.
						if tls.wants_write() {
							match tls.write_tls(&mut self.sock) {
								Ok(_) => continue,
								Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
									return Ok(Step::Pending(PollNeeded::new(
										fd,
										Interest::WRITABLE,
									)))
								}
								Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
								Err(e) => return Err(normalize_write_error(e)),
							}
						}
						match tls.read_tls(&mut self.sock) {
							Ok(0) => {
								trace!("raw eof under tls");
								return Ok(Step::Done(0));
							}
							Ok(_) => {
								tls.process_new_packets()?;
							}
							Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
								return Ok(Step::Pending(PollNeeded::new(fd, Interest::READABLE)))
							}
							Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
							Err(e) => return Err(normalize_read_error(e)),
						}
					}
					Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
						// Peer closed without a close_notify. The framing layers above decide
						// whether the response was complete.
						trace!("tls stream ended without close_notify");
						return Ok(Step::Done(0));
					}
					Err(e) => return Err(normalize_read_error(e)),
				}
			},
		}
	}

	/// Attempts to write bytes from `src`, returning how many were accepted.
	pub fn try_write(&mut self, src: &[u8]) -> Result<Step<usize>, Error> {
		let fd = self.sock.as_raw_fd();
		match &mut self.tls {
			None => loop {
				match self.sock.write(src) {
					Ok(n) => return Ok(Step::Done(n)),
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						return Ok(Step::Pending(PollNeeded::new(fd, Interest::WRITABLE)))
					}
					Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
					Err(e) => return Err(normalize_write_error(e)),
				}
			},
			Some(tls) => loop {
				let buffered = tls.writer().write(src)?;
				if buffered > 0 {
					// Push as much ciphertext to the socket as it will take; anything left stays
					// queued inside rustls and drains on later calls.
					loop {
						if !tls.wants_write() {
							break;
						}
						match tls.write_tls(&mut self.sock) {
							Ok(_) => (),
							Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
							Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
							Err(e) => return Err(normalize_write_error(e)),
						}
					}
					return Ok(Step::Done(buffered));
				}
				// The session's outgoing buffer is full; it must drain (or, mid-handshake,
				// receive input) before plaintext is accepted.
				if tls.wants_write() {
					match tls.write_tls(&mut self.sock) {
						Ok(_) => continue,
						Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
							return Ok(Step::Pending(PollNeeded::new(fd, Interest::WRITABLE)))
						}
						Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
						Err(e) => return Err(normalize_write_error(e)),
					}
				}
				// The logical write is starved of handshake input: a *read* interest.
				match tls.read_tls(&mut self.sock) {
					Ok(0) => {
						return Err(Error::Closed(
							"connection closed while sending over tls".into(),
						))
					}
					Ok(_) => {
						tls.process_new_packets()?;
					}
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						return Ok(Step::Pending(PollNeeded::new(fd, Interest::READABLE)))
					}
					Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
					Err(e) => return Err(normalize_read_error(e)),
				}
			},
		}
	}

	/// Shuts the transport down. Errors are ignored; the peer may already be gone.
	pub fn shutdown(&mut self) {
		if let Some(tls) = &mut self.tls {
			tls.send_close_notify();
			// Best effort only.
			let _ = tls.write_tls(&mut self.sock);
		}
		let _ = self.sock.shutdown(Shutdown::Both);
	}
}

/// Normalizes a receive-side I/O error.
fn normalize_read_error(e: std::io::Error) -> Error {
	match e.kind() {
		std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
			Error::Closed("connection reset by peer".into())
		}
		_ => Error::Io(e),
	}
}

/// Normalizes a send-side I/O error.
fn normalize_write_error(e: std::io::Error) -> Error {
	match e.kind() {
		std::io::ErrorKind::BrokenPipe
		| std::io::ErrorKind::ConnectionReset
		| std::io::ErrorKind::ConnectionAborted => {
			Error::Closed("found closed when trying to write".into())
		}
		// EINVAL from send(2) means the route goes into a black hole, per ip(7).
		_ if e.raw_os_error() == Some(libc::EINVAL) => {
			Error::Closed("ip route goes into black hole".into())
		}
		_ => Error::Io(e),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::TcpListener;

	/// Tests that reading an idle socket suspends with a read interest and that data then flows.
	#[test]
	fn test_plain_read_suspends() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (mut server, _) = listener.accept().unwrap();

		let mut transport = Transport::plain(client).unwrap();
		let mut buf = [0u8; 16];
		match transport.try_read(&mut buf).unwrap() {
			Step::Pending(needed) => {
				assert_eq!(needed.fd(), transport.fd());
				assert!(needed.interest().is_readable());
			}
			Step::Done(n) => panic!("expected suspension, read {n} bytes"),
		}

		server.write_all(b"hello").unwrap();
		// The bytes are in flight; wait for them rather than racing the loopback.
		PollNeeded::new(transport.fd(), Interest::READABLE)
			.wait(Some(std::time::Duration::from_secs(5)))
			.unwrap();
		match transport.try_read(&mut buf).unwrap() {
			Step::Done(n) => assert_eq!(&buf[..n], b"hello"),
			Step::Pending(_) => panic!("expected data after readiness"),
		}
	}

	/// Tests that a peer close reads as a clean zero-byte EOF.
	#[test]
	fn test_plain_read_eof() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (server, _) = listener.accept().unwrap();
		drop(server);

		let mut transport = Transport::plain(client).unwrap();
		PollNeeded::new(transport.fd(), Interest::READABLE)
			.wait(Some(std::time::Duration::from_secs(5)))
			.unwrap();
		let mut buf = [0u8; 16];
		match transport.try_read(&mut buf).unwrap() {
			Step::Done(0) => (),
			other => panic!("expected clean EOF, got {other:?}"),
		}
	}

	/// Tests that writes are accepted and arrive at the peer.
	#[test]
	fn test_plain_write() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (mut server, _) = listener.accept().unwrap();

		let mut transport = Transport::plain(client).unwrap();
		match transport.try_write(b"ping").unwrap() {
			Step::Done(n) => assert_eq!(n, 4),
			Step::Pending(_) => panic!("fresh socket refused a small write"),
		}
		let mut buf = [0u8; 4];
		server.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"ping");
	}
}
