//! Pipelining HTTP/1.1 client engine.
//!
//! This crate is a single-connection HTTP/1.1 client for REST-style and bulk-transfer workloads
//! that need explicit pipelining, `Expect: 100-continue` negotiation, and deterministic failure
//! on truncated responses. The send side and the receive side of a [`Connection`] advance
//! independently over one non-blocking socket (optionally TLS-wrapped): requests can be queued
//! back-to-back, and responses come back strictly in send order through a FIFO of
//! pending-response records.
//!
//! The engine never owns an event loop. Every operation exists as a cooperative step (`try_*`)
//! that either completes or returns [`Step::Pending`] with a [`PollNeeded`] value — the socket's
//! file descriptor plus the readiness direction the transport is waiting for — and as a blocking
//! convenience that parks on that readiness with the configured timeout. A caller with its own
//! reactor schedules the steps itself; a straight-line caller just uses the blocking forms.
//!
//! # Example
//! ```no_run
//! use h1pipe::{Body, Connection, HeaderMap};
//!
//! let conn = Connection::new("example.com");
//! conn.connect()?;
//!
//! let mut headers = HeaderMap::new();
//! headers.set("User-Agent", "h1pipe");
//!
//! // Pipeline two requests, then read both responses in order.
//! conn.send_request("GET", "/a", &headers, Body::None, false)?;
//! conn.send_request("GET", "/b", &headers, Body::None, false)?;
//! for _ in 0..2 {
//!     let resp = conn.read_response()?;
//!     println!("{} {} -> {}", resp.method, resp.target, resp.status);
//!     let body = conn.readall()?;
//!     println!("{} body bytes", body.len());
//! }
//! conn.disconnect();
//! # Ok::<(), h1pipe::Error>(())
//! ```

mod buffer;
mod connection;
mod error;
mod headers;
mod md5;
mod poll;
mod request;
mod response;
mod transport;

pub use connection::{Config, Connection, RecvHalf, SendHalf};
pub use error::{is_temp_network_error, Error};
pub use headers::HeaderMap;
pub use poll::{Interest, PollNeeded, Step};
pub use request::Body;
pub use response::{Framing, Response};
