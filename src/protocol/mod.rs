//! Client-server request/response networking.
//!
//! This module holds everything both ends of a framewire connection need: the
//! framing codec, the worker pool behind the parallel server, the server itself
//! and the client-side session.
//!
//! # Wire Format
//!
//! Both directions carry one message per exchange, written as raw chunks of at
//! most [`CHUNK_SIZE`] bytes followed by the two-byte [`TERMINATOR`]:
//!
//! ```text
//! chunk-1 chunk-2 ... chunk-N "\n\n"
//! ```
//!
//! The receiver accumulates bytes until the first `"\n\n"` and treats what came
//! before it as the message. There is no escaping, so a payload containing
//! `"\n\n"` (or ending with `'\n'`) is cut short on the receiving side.
//!
//! # Key Components
//!
//! - [`ProtocolTransport`]: framed reads and writes over any `Read + Write` stream.
//! - [`ThreadPool`]: fixed worker set with a FIFO queue and draining stop.
//! - [`Server`]: sequential (readiness loop) or parallel (worker per connection) serving.
//! - [`Session`]: a single outbound connection doing `send` / `receive`.
//!
//! # Example
//! ```rust,no_run
//! use framewire::config::ServerConfig;
//! use framewire::protocol::{RunMode, Server, Session};
//!
//! let mut server = Server::bind(&ServerConfig::new("127.0.0.1", 7000)).unwrap();
//! server.set_handler(|request| request.to_ascii_uppercase());
//! let handle = server.handle();
//! std::thread::spawn(move || server.run(RunMode::Parallel { workers: 4 }));
//!
//! let mut session = Session::connect("127.0.0.1", 7000).unwrap();
//! assert_eq!(session.request(b"hi").unwrap(), b"HI");
//! session.close();
//! handle.stop();
//! ```
mod endpoint;
mod server;
mod session;
mod thread;
mod transport;

pub use endpoint::EndpointInfo;
pub use server::{Handler, RunMode, Server, ServerError, ServerHandle, ServerState, StopOutcome};
pub use session::{Session, SessionError, SessionInterrupter};
pub use thread::{PoolError, PoolMonitor, TaskHandle, ThreadPool};
pub use transport::{
    CHUNK_SIZE, ProtocolTransport, TERMINATOR, TransportError, encode, read_message,
    write_message,
};
