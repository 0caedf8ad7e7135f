//! The pipeline state machine.
//!
//! A [`Connection`] owns one transport, one receive buffer, and the FIFO of pending-response
//! records that ties the two sides together. The send cursor and the receive cursor advance
//! independently: requests can be pipelined back-to-back while earlier responses are still being
//! read, and a 100-continue rendezvous parks the send side until the receive side has consumed
//! the interim response.
//!
//! Every operation exists in two forms. The cooperative `try_*` methods perform exactly one step
//! and either complete or surface a [`PollNeeded`]; all resumable state lives inside the
//! connection, so a suspended step is re-issued by calling the same (or the documented follow-up)
//! method again. The blocking forms drive the same steps and park on readiness with the
//! configured timeout.
//!
//! The only supported thread split is one thread driving the send side while another drives the
//! receive side, expressed by the [`SendHalf`]/[`RecvHalf`] view objects returned by
//! [`Connection::split`]. Steps hold the internal lock only while stepping, never while waiting,
//! so the two sides interleave freely.

use crate::buffer::{OutBuf, ReadBuffer};
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::poll::{PollNeeded, Step};
use crate::request::{self, Body, Origin};
use crate::response::{self, Framing, Response};
use crate::transport::Transport;
use std::collections::VecDeque;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// The default bound on header blocks and protocol lines.
const DEFAULT_LIMIT: usize = 64 * 1024;

/// How much body to ask for per iteration of the whole-body conveniences.
const DRAIN_CHUNK: usize = 64 * 1024;

/// Connection configuration.
#[derive(Clone)]
pub struct Config {
	/// The server port. `None` selects 80, or 443 when TLS is configured.
	pub port: Option<u16>,

	/// A TLS context to wrap the socket in. Building the context (roots, versions, ALPN) is the
	/// application's business.
	pub tls: Option<Arc<rustls::ClientConfig>>,

	/// A plain-HTTP proxy as `(host, port)`. Requests are rewritten to absolute-form targets;
	/// there is no CONNECT tunnelling, so this mode cannot be combined with TLS.
	pub proxy: Option<(String, u16)>,

	/// The soft deadline applied to each blocking operation. Cooperative steps are not subject
	/// to it; whoever schedules them owns their pacing.
	pub timeout: Option<Duration>,

	/// The upper bound on any single protocol line (chunk sizes, trailer lines).
	pub max_line_size: usize,

	/// The upper bound on a response header block.
	pub max_header_size: usize,

	/// Whether to add a `Content-MD5` header to requests with inline bodies.
	pub content_md5: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			port: None,
			tls: None,
			proxy: None,
			timeout: None,
			max_line_size: DEFAULT_LIMIT,
			max_header_size: DEFAULT_LIMIT,
			content_md5: false,
		}
	}
}

/// One sent request awaiting its response.
struct Pending {
	method: String,
	target: String,
	expect100: bool,
	continue_seen: bool,
}

/// What the send side moves to once the staged wire image has drained.
#[derive(Clone, Copy)]
enum SendNext {
	Idle,
	Body(u64),
	AwaitContinue(u64),
}

/// The send-side cursor.
enum SendState {
	/// Nothing in flight; `send_request` is legal.
	Idle,

	/// The staged request line, headers, and any inline body are being pushed out.
	Sending {
		out: OutBuf,
		header_len: usize,
		record: Option<Pending>,
		then: SendNext,
	},

	/// Headers are out with `Expect: 100-continue`; body bytes are refused until the receive
	/// side consumes the interim response.
	AwaitingContinue { remaining: u64 },

	/// A `Body::Following` body is being streamed through `write`.
	Body { remaining: u64 },
}

/// Progress through a chunked response body.
#[derive(Clone, Copy)]
enum ChunkPhase {
	/// Expecting a chunk-size line.
	Size,

	/// Inside a chunk's data.
	Data { remaining: u64 },

	/// Expecting the CRLF that closes a chunk's data.
	DataEnd,

	/// Past the zero chunk, expecting the trailer block.
	Trailer,
}

/// The framing cursor for the response currently being read.
#[derive(Clone, Copy)]
enum BodyCursor {
	/// A bodiless response; the first `read` completes it.
	Empty,

	/// A `Content-Length` body.
	Fixed { remaining: u64 },

	/// A chunked body. `raw` flips once `read_raw` has been used, after which the engine stops
	/// decoding and the caller owns the framing.
	Chunked { phase: ChunkPhase, raw: bool },

	/// A close-delimited body.
	UntilClose,
}

/// The receive-side cursor.
#[derive(Clone, Copy)]
enum RecvState {
	/// No response is being parsed.
	Idle,

	/// Accumulating and parsing a status line and header block.
	Head,

	/// Reading a response body.
	Body(BodyCursor),
}

/// A condition that permanently invalidated the connection. Re-raised by every later operation
/// other than `disconnect`.
enum Fatal {
	Closed(String),
	Invalid(String),
}

impl Fatal {
	fn to_error(&self) -> Error {
		match self {
			Fatal::Closed(msg) => Error::Closed(msg.clone()),
			Fatal::Invalid(msg) => Error::InvalidResponse(msg.clone()),
		}
	}
}

/// The mutable state shared by the two sides.
struct Inner {
	hostname: String,
	config: Config,
	transport: Option<Transport>,
	rbuf: ReadBuffer,
	pending: VecDeque<Pending>,
	send: SendState,
	recv: RecvState,
	trailers: Option<HeaderMap>,
	fatal: Option<Fatal>,
}

impl Inner {
	fn check_fatal(&self) -> Result<(), Error> {
		match &self.fatal {
			Some(fatal) => Err(fatal.to_error()),
			None => Ok(()),
		}
	}

	fn effective_port(&self) -> u16 {
		self.config.port.unwrap_or(if self.config.tls.is_some() {
			HTTPS_PORT
		} else {
			HTTP_PORT
		})
	}

	fn origin(&self) -> Origin<'_> {
		Origin {
			hostname: &self.hostname,
			port: self.effective_port(),
			tls: self.config.tls.is_some(),
			proxy: self.config.proxy.is_some(),
			content_md5: self.config.content_md5,
		}
	}

	fn not_open() -> Error {
		Error::Closed("connection is not open".into())
	}

	/// Reads more bytes from the transport into the receive buffer.
	fn fill(&mut self) -> Result<Step<usize>, Error> {
		let transport = match self.transport.as_mut() {
			Some(transport) => transport,
			None => return Err(Self::not_open()),
		};
		let space = self.rbuf.space();
		debug_assert!(!space.is_empty());
		match transport.try_read(space)? {
			Step::Done(n) => {
				self.rbuf.commit(n);
				trace!("received {n} bytes");
				Ok(Step::Done(n))
			}
			Step::Pending(needed) => Ok(Step::Pending(needed)),
		}
	}

	/// Stages a request. The send side must be idle.
	fn stage_request(
		&mut self,
		method: &str,
		target: &str,
		headers: &HeaderMap,
		body: Body<'_>,
		expect100: bool,
	) -> Result<(), Error> {
		self.check_fatal()?;
		if self.transport.is_none() {
			return Err(Self::not_open());
		}
		if !matches!(self.send, SendState::Idle) {
			return Err(Error::State(
				"the previous request has not been sent completely",
			));
		}
		let encoded = request::encode(method, target, headers, body, expect100, &self.origin())?;
		debug!("sending {} request for {}", method, target);
		let then = match (encoded.following, expect100) {
			(Some(n), true) => SendNext::AwaitContinue(n),
			(Some(n), false) => SendNext::Body(n),
			(None, _) => SendNext::Idle,
		};
		self.send = SendState::Sending {
			out: OutBuf::new(encoded.wire),
			header_len: encoded.header_len,
			record: Some(Pending {
				method: method.to_owned(),
				target: target.to_owned(),
				expect100,
				continue_seen: false,
			}),
			then,
		};
		Ok(())
	}

	/// Pushes staged wire bytes into the transport until they drain or the transport blocks.
	///
	/// The pending record is enqueued the moment the cursor crosses the end of the header block;
	/// an inline body keeps streaming through the same staged image afterwards.
	fn pump_send(&mut self) -> Result<Step<()>, Error> {
		enum Outcome {
			Drained,
			Wrote(Option<Pending>),
			Would(PollNeeded),
			Failed(Error),
		}
		loop {
			let outcome = match &mut self.send {
				SendState::Sending {
					out,
					header_len,
					record,
					..
				} => {
					if out.is_empty() {
						Outcome::Drained
					} else {
						let transport = match self.transport.as_mut() {
							Some(transport) => transport,
							None => return Err(Self::not_open()),
						};
						match transport.try_write(out.remaining()) {
							Ok(Step::Done(n)) => {
								let before = out.written();
								out.advance(n);
								trace!("wrote {n} bytes");
								let crossed =
									before < *header_len && out.written() >= *header_len;
								Outcome::Wrote(if crossed { record.take() } else { None })
							}
							Ok(Step::Pending(needed)) => Outcome::Would(needed),
							Err(e) => Outcome::Failed(e),
						}
					}
				}
				_ => return Ok(Step::Done(())),
			};
			match outcome {
				Outcome::Drained => {
					let state = std::mem::replace(&mut self.send, SendState::Idle);
					if let SendState::Sending { then, .. } = state {
						self.send = match then {
							SendNext::Idle | SendNext::Body(0) => SendState::Idle,
							SendNext::Body(n) => SendState::Body { remaining: n },
							SendNext::AwaitContinue(n) => {
								SendState::AwaitingContinue { remaining: n }
							}
						};
					}
					return Ok(Step::Done(()));
				}
				Outcome::Wrote(Some(record)) => {
					trace!(
						"request for {} {} transmitted through the header block",
						record.method,
						record.target
					);
					self.pending.push_back(record);
				}
				Outcome::Wrote(None) => (),
				Outcome::Would(needed) => return Ok(Step::Pending(needed)),
				Outcome::Failed(e) => {
					// The staged bytes are lost. If the headers never made it out, the request
					// was never enqueued; either way the receive side stays alive so any early
					// response the server sent can still be read.
					self.send = SendState::Idle;
					return Err(e);
				}
			}
		}
	}

	/// One cooperative step of writing `Body::Following` bytes.
	fn step_write(&mut self, buf: &[u8]) -> Result<Step<usize>, Error> {
		self.check_fatal()?;
		if matches!(self.send, SendState::Sending { .. }) {
			// Finish pushing the staged headers before body bytes can flow.
			match self.pump_send()? {
				Step::Done(()) => (),
				Step::Pending(needed) => return Ok(Step::Pending(needed)),
			}
		}
		let remaining = match &self.send {
			SendState::Body { remaining } => *remaining,
			SendState::AwaitingContinue { .. } => {
				return Err(Error::State("cannot write while waiting for 100-continue"))
			}
			SendState::Idle | SendState::Sending { .. } => {
				return Err(Error::State("no request with pending body data"))
			}
		};
		if buf.len() as u64 > remaining {
			return Err(Error::ExcessBodyData {
				requested: buf.len() as u64,
				remaining,
			});
		}
		if buf.is_empty() {
			return Ok(Step::Done(0));
		}
		let transport = match self.transport.as_mut() {
			Some(transport) => transport,
			None => return Err(Self::not_open()),
		};
		match transport.try_write(buf) {
			Ok(Step::Done(n)) => {
				let left = remaining - n as u64;
				if left == 0 {
					trace!("request body sent fully");
					self.send = SendState::Idle;
				} else {
					self.send = SendState::Body { remaining: left };
				}
				Ok(Step::Done(n))
			}
			Ok(Step::Pending(needed)) => Ok(Step::Pending(needed)),
			Err(e) => {
				if matches!(e, Error::Closed(_)) {
					// Treat the body as sent: the record is already enqueued, and the caller
					// may still be able to read the error response the server sent before
					// closing.
					self.send = SendState::Idle;
				}
				Err(e)
			}
		}
	}

	/// One cooperative step of parsing the next response head.
	fn step_read_response(&mut self) -> Result<Step<Response>, Error> {
		self.check_fatal()?;
		match self.recv {
			RecvState::Body(_) => {
				return Err(Error::State(
					"the previous response has not been read completely",
				))
			}
			RecvState::Idle => {
				if self.pending.is_empty() {
					return Err(Error::State("no requests are awaiting a response"));
				}
				self.recv = RecvState::Head;
			}
			RecvState::Head => (),
		}
		loop {
			// The status line is the first non-empty line; skip stray CRLF pairs ahead of it.
			while self.rbuf.readable().starts_with(b"\r\n") {
				self.rbuf.consume(2);
			}
			let end = match self.rbuf.find(b"\r\n\r\n") {
				Some(end) => end,
				None => {
					if self.rbuf.is_full() {
						return Err(self.fail_invalid(format!(
							"response header block exceeds {} bytes",
							self.config.max_header_size
						)));
					}
					match self.fill()? {
						Step::Pending(needed) => return Ok(Step::Pending(needed)),
						Step::Done(0) => {
							return Err(self.fail_closed(
								"connection closed before a complete response arrived".into(),
							))
						}
						Step::Done(_) => continue,
					}
				}
			};
			let block_len = end + 4;
			let head = match response::parse_head(&self.rbuf.readable()[..block_len]) {
				Ok(head) => head,
				Err(e) => return Err(self.poison_if_invalid(e)),
			};
			let (method, target, expecting) = {
				let front = self
					.pending
					.front()
					.ok_or(Error::State("no requests are awaiting a response"))?;
				(
					front.method.clone(),
					front.target.clone(),
					front.expect100 && !front.continue_seen,
				)
			};
			debug!("got {:03} {}", head.status, head.reason);

			if (100..200).contains(&head.status) {
				self.rbuf.consume(block_len);
				if head.status == 100 && expecting {
					// The rendezvous: hand the interim response to the caller, release the
					// send side, and leave the record at the head of the queue.
					if let Some(front) = self.pending.front_mut() {
						front.continue_seen = true;
					}
					if let SendState::AwaitingContinue { remaining } = &self.send {
						let remaining = *remaining;
						self.send = if remaining == 0 {
							SendState::Idle
						} else {
							SendState::Body { remaining }
						};
					}
					self.recv = RecvState::Idle;
					return Ok(Step::Done(Response {
						method,
						target,
						status: head.status,
						reason: head.reason,
						headers: head.headers,
						framing: Framing::None,
					}));
				}
				debug!("discarding unsolicited interim response");
				continue;
			}

			let framing = match response::body_framing(&method, head.status, &head.headers) {
				Ok(framing) => framing,
				Err(e) => return Err(self.poison_if_invalid(e)),
			};
			self.rbuf.consume(block_len);
			if expecting {
				// A non-100 answer while the flag is set is a refusal: the body is never
				// sent, and the record runs its normal course.
				if let Some(front) = self.pending.front_mut() {
					front.continue_seen = true;
				}
				if matches!(self.send, SendState::AwaitingContinue { .. }) {
					debug!("server declined to continue; request body withheld");
					self.send = SendState::Idle;
				}
			}
			self.trailers = None;
			self.recv = RecvState::Body(match framing {
				Framing::None => BodyCursor::Empty,
				Framing::Fixed(n) => BodyCursor::Fixed { remaining: n },
				Framing::Chunked => BodyCursor::Chunked {
					phase: ChunkPhase::Size,
					raw: false,
				},
				Framing::UntilClose => BodyCursor::UntilClose,
			});
			return Ok(Step::Done(Response {
				method,
				target,
				status: head.status,
				reason: head.reason,
				headers: head.headers,
				framing,
			}));
		}
	}

	/// One cooperative step of reading body data. With `raw` set, chunked bodies are handed over
	/// without decoding.
	fn step_read(&mut self, max: usize, raw: bool) -> Result<Step<Vec<u8>>, Error> {
		self.check_fatal()?;
		if !matches!(self.recv, RecvState::Body(_)) {
			return Err(Error::State("no response body is being read"));
		}
		if max == 0 {
			return Ok(Step::Done(Vec::new()));
		}
		loop {
			match self.recv {
				RecvState::Body(BodyCursor::Empty) => {
					self.finish_response()?;
					return Ok(Step::Done(Vec::new()));
				}

				RecvState::Body(BodyCursor::Fixed { remaining }) => {
					if remaining == 0 {
						self.finish_response()?;
						return Ok(Step::Done(Vec::new()));
					}
					if self.rbuf.is_empty() {
						match self.fill()? {
							Step::Pending(needed) => return Ok(Step::Pending(needed)),
							Step::Done(0) => {
								return Err(self.fail_closed(format!(
									"connection closed with {remaining} body bytes outstanding"
								)))
							}
							Step::Done(_) => (),
						}
					}
					let take = remaining.min(max as u64).min(self.rbuf.len() as u64) as usize;
					let data = self.rbuf.readable()[..take].to_vec();
					self.rbuf.consume(take);
					self.recv = RecvState::Body(BodyCursor::Fixed {
						remaining: remaining - take as u64,
					});
					return Ok(Step::Done(data));
				}

				RecvState::Body(BodyCursor::Chunked {
					phase,
					raw: raw_already,
				}) => {
					if raw || raw_already {
						if !raw_already {
							self.recv = RecvState::Body(BodyCursor::Chunked { phase, raw: true });
						}
						return self.step_read_wire(max);
					}
					match phase {
						ChunkPhase::Size => match self.rbuf.find(b"\r\n") {
							Some(pos) => {
								if pos > self.config.max_line_size {
									return Err(
										self.fail_invalid("chunk size line too long".into())
									);
								}
								let size = match response::parse_chunk_size(
									&self.rbuf.readable()[..pos],
								) {
									Ok(size) => size,
									Err(e) => return Err(self.poison_if_invalid(e)),
								};
								self.rbuf.consume(pos + 2);
								if size == 0 {
									trace!("final chunk seen");
									self.recv = RecvState::Body(BodyCursor::Chunked {
										phase: ChunkPhase::Trailer,
										raw: false,
									});
								} else {
									trace!("starting {size} byte chunk");
									self.recv = RecvState::Body(BodyCursor::Chunked {
										phase: ChunkPhase::Data { remaining: size },
										raw: false,
									});
								}
							}
							None => {
								if self.rbuf.len() > self.config.max_line_size
									|| self.rbuf.is_full()
								{
									return Err(
										self.fail_invalid("chunk size line too long".into())
									);
								}
								match self.fill()? {
									Step::Pending(needed) => return Ok(Step::Pending(needed)),
									Step::Done(0) => {
										return Err(self.fail_closed(
											"connection closed before the final chunk".into(),
										))
									}
									Step::Done(_) => (),
								}
							}
						},

						ChunkPhase::Data { remaining } => {
							if self.rbuf.is_empty() {
								match self.fill()? {
									Step::Pending(needed) => return Ok(Step::Pending(needed)),
									Step::Done(0) => {
										return Err(self.fail_closed(format!(
											"connection closed inside a chunk ({remaining} bytes outstanding)"
										)))
									}
									Step::Done(_) => (),
								}
							}
							let take =
								remaining.min(max as u64).min(self.rbuf.len() as u64) as usize;
							let data = self.rbuf.readable()[..take].to_vec();
							self.rbuf.consume(take);
							let left = remaining - take as u64;
							self.recv = RecvState::Body(BodyCursor::Chunked {
								phase: if left == 0 {
									ChunkPhase::DataEnd
								} else {
									ChunkPhase::Data { remaining: left }
								},
								raw: false,
							});
							return Ok(Step::Done(data));
						}

						ChunkPhase::DataEnd => {
							if self.rbuf.len() < 2 {
								match self.fill()? {
									Step::Pending(needed) => return Ok(Step::Pending(needed)),
									Step::Done(0) => {
										return Err(self.fail_closed(
											"connection closed at a chunk boundary".into(),
										))
									}
									Step::Done(_) => (),
								}
								continue;
							}
							if &self.rbuf.readable()[..2] != b"\r\n" {
								return Err(self
									.fail_invalid("chunk data not terminated by CRLF".into()));
							}
							self.rbuf.consume(2);
							self.recv = RecvState::Body(BodyCursor::Chunked {
								phase: ChunkPhase::Size,
								raw: false,
							});
						}

						ChunkPhase::Trailer => {
							if self.rbuf.readable().starts_with(b"\r\n") {
								self.rbuf.consume(2);
								self.finish_response()?;
								return Ok(Step::Done(Vec::new()));
							}
							if let Some(pos) = self.rbuf.find(b"\r\n\r\n") {
								let block_len = pos + 4;
								let trailers = match response::parse_trailer(
									&self.rbuf.readable()[..block_len],
								) {
									Ok(trailers) => trailers,
									Err(e) => return Err(self.poison_if_invalid(e)),
								};
								self.rbuf.consume(block_len);
								debug!("{} trailer(s) received", trailers.len());
								self.trailers = Some(trailers);
								self.finish_response()?;
								return Ok(Step::Done(Vec::new()));
							}
							if self.rbuf.is_full() {
								return Err(self.fail_invalid("trailer block too large".into()));
							}
							match self.fill()? {
								Step::Pending(needed) => return Ok(Step::Pending(needed)),
								Step::Done(0) => {
									return Err(self.fail_closed(
										"connection closed inside the trailer block".into(),
									))
								}
								Step::Done(_) => (),
							}
						}
					}
				}

				RecvState::Body(BodyCursor::UntilClose) => {
					if self.rbuf.is_empty() {
						match self.fill()? {
							Step::Pending(needed) => return Ok(Step::Pending(needed)),
							Step::Done(0) => {
								// A clean EOF is this framing's terminator; afterwards the
								// connection is done for.
								debug!("close-delimited body complete");
								self.finish_response()?;
								self.fatal = Some(Fatal::Closed(
									"connection closed by the server after a close-delimited response"
										.into(),
								));
								return Ok(Step::Done(Vec::new()));
							}
							Step::Done(_) => (),
						}
					}
					let take = max.min(self.rbuf.len());
					let data = self.rbuf.readable()[..take].to_vec();
					self.rbuf.consume(take);
					return Ok(Step::Done(data));
				}

				RecvState::Idle | RecvState::Head => {
					return Err(Error::State("no response body is being read"))
				}
			}
		}
	}

	/// Serves raw wire bytes of the current response, for `read_raw` on a chunked body.
	fn step_read_wire(&mut self, max: usize) -> Result<Step<Vec<u8>>, Error> {
		if self.rbuf.is_empty() {
			match self.fill()? {
				Step::Pending(needed) => return Ok(Step::Pending(needed)),
				// In raw mode the caller owns the framing; EOF is simply the end.
				Step::Done(0) => return Ok(Step::Done(Vec::new())),
				Step::Done(_) => (),
			}
		}
		let take = max.min(self.rbuf.len());
		let data = self.rbuf.readable()[..take].to_vec();
		self.rbuf.consume(take);
		Ok(Step::Done(data))
	}

	/// Completes the current response: pops its record and resets the receive side.
	fn finish_response(&mut self) -> Result<(), Error> {
		trace!("response complete");
		self.pending.pop_front();
		self.recv = RecvState::Idle;
		if self.pending.is_empty() && !self.rbuf.is_empty() {
			return Err(
				self.fail_invalid("server sent data with no response outstanding".into())
			);
		}
		Ok(())
	}

	fn fail_closed(&mut self, msg: String) -> Error {
		self.fatal = Some(Fatal::Closed(msg.clone()));
		Error::Closed(msg)
	}

	fn fail_invalid(&mut self, msg: String) -> Error {
		self.fatal = Some(Fatal::Invalid(msg.clone()));
		Error::InvalidResponse(msg)
	}

	/// Marks the connection dead if `e` is a wire-malformedness failure, then passes it through.
	fn poison_if_invalid(&mut self, e: Error) -> Error {
		if let Error::InvalidResponse(msg) = &e {
			self.fatal = Some(Fatal::Invalid(msg.clone()));
		}
		e
	}
}

/// A single HTTP/1.1 connection with an explicitly pipelined request/response cycle.
///
/// See the [module documentation](self) for the shape of the API. All methods take `&self`; the
/// connection is internally synchronized so that the documented send-side/receive-side thread
/// split works, but no other concurrent use is supported.
pub struct Connection {
	inner: Mutex<Inner>,
}

impl Connection {
	/// Creates a connection to `hostname` with default configuration. No I/O happens until
	/// [`connect`](Self::connect).
	pub fn new(hostname: &str) -> Self {
		Self::with_config(hostname, Config::default())
	}

	/// Creates a connection with explicit configuration.
	pub fn with_config(hostname: &str, config: Config) -> Self {
		Self {
			inner: Mutex::new(Inner {
				hostname: hostname.to_owned(),
				rbuf: ReadBuffer::new(config.max_header_size),
				config,
				transport: None,
				pending: VecDeque::new(),
				send: SendState::Idle,
				recv: RecvState::Idle,
				trailers: None,
				fatal: None,
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn deadline(&self) -> Option<Instant> {
		self.lock().config.timeout.map(|t| Instant::now() + t)
	}

	/// Establishes the transport: TCP (directly or to the configured proxy), then the TLS
	/// handshake if a context was configured.
	///
	/// # Errors
	/// [`Error::State`] if already connected or if TLS is combined with the proxy mode;
	/// resolution and connection failures otherwise.
	pub fn connect(&self) -> Result<(), Error> {
		let mut inner = self.lock();
		if inner.transport.is_some() {
			return Err(Error::State("already connected"));
		}
		if inner.config.proxy.is_some() && inner.config.tls.is_some() {
			return Err(Error::State(
				"TLS through the plain-HTTP proxy mode is not supported",
			));
		}
		inner.fatal = None;
		inner.pending.clear();
		inner.send = SendState::Idle;
		inner.recv = RecvState::Idle;
		inner.trailers = None;
		inner.rbuf = ReadBuffer::new(inner.config.max_header_size);
		let deadline = inner.config.timeout.map(|t| Instant::now() + t);
		let port = inner.effective_port();
		let (connect_host, connect_port) = match &inner.config.proxy {
			Some((host, proxy_port)) => (host.clone(), *proxy_port),
			None => (inner.hostname.clone(), port),
		};
		debug!("connecting to {}:{}", connect_host, connect_port);
		let sock = connect_stream(&connect_host, connect_port, inner.config.timeout)?;
		let transport = match inner.config.tls.clone() {
			Some(tls_config) => Transport::tls(sock, tls_config, &inner.hostname, deadline)?,
			None => Transport::plain(sock)?,
		};
		inner.transport = Some(transport);
		Ok(())
	}

	/// Tears down the transport and discards all connection state. Idempotent; afterwards every
	/// operation other than [`connect`](Self::connect) reports a closed connection.
	pub fn disconnect(&self) {
		let mut inner = self.lock();
		if let Some(mut transport) = inner.transport.take() {
			debug!("disconnecting");
			transport.shutdown();
		}
		inner.pending.clear();
		inner.send = SendState::Idle;
		inner.recv = RecvState::Idle;
		inner.trailers = None;
		inner.fatal = None;
	}

	/// Sends a request, blocking until the staged part is on the wire.
	///
	/// With [`Body::Inline`] the body goes out here too; with [`Body::Following`] the call
	/// returns once the headers are out and the body is then streamed through
	/// [`write`](Self::write). With `expect100` the send side parks until
	/// [`read_response`](Self::read_response) has consumed the interim response.
	pub fn send_request(
		&self,
		method: &str,
		target: &str,
		headers: &HeaderMap,
		body: Body<'_>,
		expect100: bool,
	) -> Result<(), Error> {
		let deadline = self.deadline();
		self.lock().stage_request(method, target, headers, body, expect100)?;
		loop {
			match self.lock().pump_send()? {
				Step::Done(()) => return Ok(()),
				Step::Pending(needed) => needed.wait_deadline(deadline)?,
			}
		}
	}

	/// Sends a request and reads its response in one call. Not for pipelining or 100-continue;
	/// it is the plain round trip.
	pub fn request(
		&self,
		method: &str,
		target: &str,
		headers: &HeaderMap,
		body: Body<'_>,
	) -> Result<Response, Error> {
		self.send_request(method, target, headers, body, false)?;
		self.read_response()
	}

	/// Writes request body data for a [`Body::Following`] request.
	///
	/// With `partial` set the call may write less than `buf` and returns the count actually
	/// accepted; otherwise it blocks until all of `buf` is out.
	///
	/// # Errors
	/// [`Error::ExcessBodyData`] if `buf` is longer than the body bytes still announced; nothing
	/// is written in that case, so the wire never carries more than the declared length.
	/// [`Error::State`] if no body is being streamed or a 100-continue is still outstanding.
	pub fn write(&self, buf: &[u8], partial: bool) -> Result<usize, Error> {
		let deadline = self.deadline();
		let mut written = 0;
		let mut rest = buf;
		loop {
			match self.lock().step_write(rest)? {
				Step::Done(n) => {
					written += n;
					rest = &rest[n..];
					if partial || rest.is_empty() {
						return Ok(written);
					}
				}
				Step::Pending(needed) => needed.wait_deadline(deadline)?,
			}
		}
	}

	/// Reads the status line and headers of the next pending response, blocking as needed.
	///
	/// Interim 1xx responses are consumed transparently, except for an expected `100 Continue`,
	/// which is returned to the caller so it knows to start writing the body.
	pub fn read_response(&self) -> Result<Response, Error> {
		let deadline = self.deadline();
		loop {
			match self.lock().step_read_response()? {
				Step::Done(response) => return Ok(response),
				Step::Pending(needed) => needed.wait_deadline(deadline)?,
			}
		}
	}

	/// Reads up to `max` bytes of the current response body. An empty result means the body is
	/// complete; reading past that point is a state error.
	pub fn read(&self, max: usize) -> Result<Vec<u8>, Error> {
		let deadline = self.deadline();
		loop {
			match self.lock().step_read(max, false)? {
				Step::Done(data) => return Ok(data),
				Step::Pending(needed) => needed.wait_deadline(deadline)?,
			}
		}
	}

	/// Like [`read`](Self::read), but without chunked decoding: the caller receives on-wire
	/// bytes and owns the framing from then on. Mixing with `read` within one response is not
	/// supported.
	pub fn read_raw(&self, max: usize) -> Result<Vec<u8>, Error> {
		let deadline = self.deadline();
		loop {
			match self.lock().step_read(max, true)? {
				Step::Done(data) => return Ok(data),
				Step::Pending(needed) => needed.wait_deadline(deadline)?,
			}
		}
	}

	/// Reads the current response body to completion.
	pub fn readall(&self) -> Result<Vec<u8>, Error> {
		let mut out = Vec::new();
		loop {
			let chunk = self.read(DRAIN_CHUNK)?;
			if chunk.is_empty() {
				return Ok(out);
			}
			out.extend_from_slice(&chunk);
		}
	}

	/// Reads and discards the rest of the current response body.
	pub fn discard(&self) -> Result<(), Error> {
		loop {
			if self.read(DRAIN_CHUNK)?.is_empty() {
				return Ok(());
			}
		}
	}

	/// Returns whether any sent requests are still awaiting (fully read) responses.
	pub fn response_pending(&self) -> bool {
		!self.lock().pending.is_empty()
	}

	/// Returns the trailer block of the most recently completed chunked response, if it had one.
	pub fn trailers(&self) -> Option<HeaderMap> {
		self.lock().trailers.clone()
	}

	/// Returns the transport's file descriptor, for callers that want to fold the connection into
	/// their own readiness polling.
	///
	/// Because of internal buffering, response data may be available for reading even when the
	/// descriptor itself is not readable.
	pub fn fileno(&self) -> Option<RawFd> {
		self.lock().transport.as_ref().map(Transport::fd)
	}

	/// Returns the server's end-entity certificate in DER form, if this is a TLS connection.
	pub fn peer_certificate(&self) -> Option<Vec<u8>> {
		self.lock()
			.transport
			.as_ref()
			.and_then(|t| t.peer_certificate().map(<[u8]>::to_vec))
	}

	/// Returns the per-operation timeout.
	pub fn timeout(&self) -> Option<Duration> {
		self.lock().config.timeout
	}

	/// Changes the per-operation timeout.
	pub fn set_timeout(&self, timeout: Option<Duration>) {
		self.lock().config.timeout = timeout;
	}

	/// Splits the connection into its send-side and receive-side views, for the supported
	/// two-thread driving pattern.
	pub fn split(&self) -> (SendHalf<'_>, RecvHalf<'_>) {
		(SendHalf { conn: self }, RecvHalf { conn: self })
	}

	/// Cooperative form of [`send_request`](Self::send_request): stages the request and pushes
	/// once. On `Pending`, resume with [`try_flush`](Self::try_flush).
	pub fn try_send_request(
		&self,
		method: &str,
		target: &str,
		headers: &HeaderMap,
		body: Body<'_>,
		expect100: bool,
	) -> Result<Step<()>, Error> {
		let mut inner = self.lock();
		inner.stage_request(method, target, headers, body, expect100)?;
		inner.pump_send()
	}

	/// Resumes pushing staged request bytes. A no-op `Done` when nothing is staged.
	pub fn try_flush(&self) -> Result<Step<()>, Error> {
		self.lock().pump_send()
	}

	/// Cooperative form of [`write`](Self::write); partial counts are normal.
	pub fn try_write(&self, buf: &[u8]) -> Result<Step<usize>, Error> {
		self.lock().step_write(buf)
	}

	/// Cooperative form of [`read_response`](Self::read_response); argument-free, so a suspended
	/// call is resumed by calling it again.
	pub fn try_read_response(&self) -> Result<Step<Response>, Error> {
		self.lock().step_read_response()
	}

	/// Cooperative form of [`read`](Self::read).
	pub fn try_read(&self, max: usize) -> Result<Step<Vec<u8>>, Error> {
		self.lock().step_read(max, false)
	}

	/// Cooperative form of [`read_raw`](Self::read_raw).
	pub fn try_read_raw(&self, max: usize) -> Result<Step<Vec<u8>>, Error> {
		self.lock().step_read(max, true)
	}
}

/// The send-side view of a split connection: request staging and body writes only.
pub struct SendHalf<'conn> {
	conn: &'conn Connection,
}

impl SendHalf<'_> {
	/// See [`Connection::send_request`].
	pub fn send_request(
		&self,
		method: &str,
		target: &str,
		headers: &HeaderMap,
		body: Body<'_>,
		expect100: bool,
	) -> Result<(), Error> {
		self.conn.send_request(method, target, headers, body, expect100)
	}

	/// See [`Connection::write`].
	pub fn write(&self, buf: &[u8], partial: bool) -> Result<usize, Error> {
		self.conn.write(buf, partial)
	}

	/// See [`Connection::try_send_request`].
	pub fn try_send_request(
		&self,
		method: &str,
		target: &str,
		headers: &HeaderMap,
		body: Body<'_>,
		expect100: bool,
	) -> Result<Step<()>, Error> {
		self.conn.try_send_request(method, target, headers, body, expect100)
	}

	/// See [`Connection::try_flush`].
	pub fn try_flush(&self) -> Result<Step<()>, Error> {
		self.conn.try_flush()
	}

	/// See [`Connection::try_write`].
	pub fn try_write(&self, buf: &[u8]) -> Result<Step<usize>, Error> {
		self.conn.try_write(buf)
	}
}

/// The receive-side view of a split connection: response parsing and body reads only.
pub struct RecvHalf<'conn> {
	conn: &'conn Connection,
}

impl RecvHalf<'_> {
	/// See [`Connection::read_response`].
	pub fn read_response(&self) -> Result<Response, Error> {
		self.conn.read_response()
	}

	/// See [`Connection::read`].
	pub fn read(&self, max: usize) -> Result<Vec<u8>, Error> {
		self.conn.read(max)
	}

	/// See [`Connection::read_raw`].
	pub fn read_raw(&self, max: usize) -> Result<Vec<u8>, Error> {
		self.conn.read_raw(max)
	}

	/// See [`Connection::readall`].
	pub fn readall(&self) -> Result<Vec<u8>, Error> {
		self.conn.readall()
	}

	/// See [`Connection::discard`].
	pub fn discard(&self) -> Result<(), Error> {
		self.conn.discard()
	}

	/// See [`Connection::response_pending`].
	pub fn response_pending(&self) -> bool {
		self.conn.response_pending()
	}

	/// See [`Connection::trailers`].
	pub fn trailers(&self) -> Option<HeaderMap> {
		self.conn.trailers()
	}

	/// See [`Connection::try_read_response`].
	pub fn try_read_response(&self) -> Result<Step<Response>, Error> {
		self.conn.try_read_response()
	}

	/// See [`Connection::try_read`].
	pub fn try_read(&self, max: usize) -> Result<Step<Vec<u8>>, Error> {
		self.conn.try_read(max)
	}

	/// See [`Connection::try_read_raw`].
	pub fn try_read_raw(&self, max: usize) -> Result<Step<Vec<u8>>, Error> {
		self.conn.try_read_raw(max)
	}
}

/// Resolves `host` and connects to the first address that accepts.
fn connect_stream(
	host: &str,
	port: u16,
	timeout: Option<Duration>,
) -> Result<TcpStream, Error> {
	let addrs: Vec<_> = (host, port)
		.to_socket_addrs()
		.map_err(|_| Error::HostnameNotResolvable {
			hostname: host.to_owned(),
		})?
		.collect();
	if addrs.is_empty() {
		return Err(Error::HostnameNotResolvable {
			hostname: host.to_owned(),
		});
	}
	let mut last = None;
	for addr in addrs {
		let attempt = match timeout {
			Some(t) => TcpStream::connect_timeout(&addr, t),
			None => TcpStream::connect(addr),
		};
		match attempt {
			Ok(sock) => return Ok(sock),
			Err(e) => last = Some(e),
		}
	}
	match last {
		Some(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(Error::TimedOut),
		Some(e) => Err(Error::Io(e)),
		None => Err(Error::HostnameNotResolvable {
			hostname: host.to_owned(),
		}),
	}
}
