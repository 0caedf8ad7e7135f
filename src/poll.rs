//! The suspension protocol.
//!
//! Every cooperative step on a connection either completes with a value or surfaces a
//! [`PollNeeded`], a plain data value naming the transport's file descriptor and the readiness
//! direction it is waiting for. The engine never owns an event loop; the caller decides whether to
//! hand the value to its own reactor or to park on [`PollNeeded::wait`].

use crate::error::Error;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// A readiness interest mask with two bits: readable and writable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interest(u8);

impl Interest {
	/// Interest in the descriptor becoming readable.
	pub const READABLE: Interest = Interest(0b01);

	/// Interest in the descriptor becoming writable.
	pub const WRITABLE: Interest = Interest(0b10);

	/// Returns whether the readable bit is set.
	pub fn is_readable(self) -> bool {
		self.0 & Self::READABLE.0 != 0
	}

	/// Returns whether the writable bit is set.
	pub fn is_writable(self) -> bool {
		self.0 & Self::WRITABLE.0 != 0
	}

	/// Combines two masks.
	#[must_use]
	pub fn union(self, other: Interest) -> Interest {
		Interest(self.0 | other.0)
	}

	/// The `poll(2)` event bits corresponding to this mask.
	fn poll_events(self) -> libc::c_short {
		let mut events = 0;
		if self.is_readable() {
			events |= libc::POLLIN;
		}
		if self.is_writable() {
			events |= libc::POLLOUT;
		}
		events
	}
}

/// A blocking point, described as a file descriptor plus the readiness the transport needs before
/// the suspended step can make progress.
///
/// The mask reflects what the *transport* needs, not the logical operation: a TLS session may
/// demand a socket read in order to finish a logical write, and vice versa.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollNeeded {
	fd: RawFd,
	interest: Interest,
}

impl PollNeeded {
	pub(crate) fn new(fd: RawFd, interest: Interest) -> Self {
		Self { fd, interest }
	}

	/// The file descriptor to wait on.
	pub fn fd(self) -> RawFd {
		self.fd
	}

	/// The readiness direction(s) to wait for.
	pub fn interest(self) -> Interest {
		self.interest
	}

	/// Blocks the calling thread until the described readiness holds.
	///
	/// The wait is implemented with `poll(2)`, which does not suffer from the descriptor-number
	/// limit of `select(2)`. Interrupted waits are retried with the remaining time.
	///
	/// # Errors
	/// Returns [`Error::TimedOut`] if `timeout` elapses first, or the underlying `poll` failure.
	pub fn wait(self, timeout: Option<Duration>) -> Result<(), Error> {
		self.wait_deadline(timeout.map(|t| Instant::now() + t))
	}

	/// Like [`wait`](Self::wait), but against an absolute deadline shared by a whole operation.
	pub(crate) fn wait_deadline(self, deadline: Option<Instant>) -> Result<(), Error> {
		loop {
			let timeout_ms: libc::c_int = match deadline {
				None => -1,
				Some(d) => {
					let now = Instant::now();
					if d <= now {
						return Err(Error::TimedOut);
					}
					// Round up so a sub-millisecond remainder does not spin.
					let ms = d.duration_since(now).as_millis().max(1);
					ms.min(libc::c_int::MAX as u128) as libc::c_int
				}
			};
			let mut fds = [libc::pollfd {
				fd: self.fd,
				events: self.interest.poll_events(),
				revents: 0,
			}];
			let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
			if rc > 0 {
				// POLLERR/POLLHUP also count as readiness; the next I/O attempt reports the
				// real condition.
				return Ok(());
			}
			if rc == 0 {
				return Err(Error::TimedOut);
			}
			let err = std::io::Error::last_os_error();
			if err.kind() != std::io::ErrorKind::Interrupted {
				return Err(Error::Io(err));
			}
		}
	}
}

/// The outcome of one cooperative step: a final value, or a description of the readiness to wait
/// for before retrying the step.
#[derive(Debug)]
pub enum Step<T> {
	/// The step completed.
	Done(T),

	/// The step would block; retry once the described readiness holds.
	Pending(PollNeeded),
}

impl<T> Step<T> {
	/// Returns whether this is a [`Pending`](Step::Pending) value.
	pub fn is_pending(&self) -> bool {
		matches!(self, Step::Pending(_))
	}

	/// Extracts the final value, if the step completed.
	pub fn done(self) -> Option<T> {
		match self {
			Step::Done(v) => Some(v),
			Step::Pending(_) => None,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::{TcpListener, TcpStream};
	use std::os::fd::AsRawFd;

	/// Tests the interest mask bits and union.
	#[test]
	fn test_interest() {
		assert!(Interest::READABLE.is_readable());
		assert!(!Interest::READABLE.is_writable());
		assert!(Interest::WRITABLE.is_writable());
		let both = Interest::READABLE.union(Interest::WRITABLE);
		assert!(both.is_readable() && both.is_writable());
	}

	/// Tests that waiting for writability on a fresh connected socket returns promptly.
	#[test]
	fn test_wait_writable() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let sock = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let needed = PollNeeded::new(sock.as_raw_fd(), Interest::WRITABLE);
		needed.wait(Some(Duration::from_secs(5))).unwrap();
	}

	/// Tests that waiting for readability on an idle socket times out.
	#[test]
	fn test_wait_timeout() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let sock = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let _peer = listener.accept().unwrap();
		let needed = PollNeeded::new(sock.as_raw_fd(), Interest::READABLE);
		match needed.wait(Some(Duration::from_millis(30))) {
			Err(Error::TimedOut) => (),
			other => panic!("expected TimedOut, got {other:?}"),
		}
	}
}
