//! Callback-driven non-blocking I/O event loop.
//!
//! Evio couples a single-threaded cooperative [`EventLoop`] with a family
//! of handles (TCP client/server, UDP client/server, timers, files and
//! directories) that all share one lifecycle, cancellation and
//! backpressure contract. User code allocates handles against a loop,
//! registers callbacks and calls [`EventLoop::run`]; the loop processes
//! events until no handle is active and nothing is queued.
//!
//! # Guarantees
//!
//! * Per handle, callbacks fire in the order the underlying events
//!   occurred: connect before data, data chunks in arrival order, close
//!   after all received data was delivered. Send completions fire in
//!   send-issue order.
//! * A handle is never destroyed while one of its callbacks is on the
//!   stack; [`Handle::schedule_removal`] defers destruction until the
//!   handle's protocol work and external buffer references drain.
//! * All handle operations must run on the loop thread. The single
//!   cross-thread entry point is [`LoopSender::execute_on_loop_thread`].
//!
//! # Examples
//!
//! A TCP echo server:
//!
//! ```no_run
//! use evio::{Endpoint, EventLoop, TcpServer};
//!
//! let mut lp = EventLoop::new().unwrap();
//! let server = TcpServer::new(&mut lp);
//! server
//!     .listen(
//!         &mut lp,
//!         Endpoint::new("127.0.0.1", 31540),
//!         |_lp, _client, error| assert!(error.is_ok()),
//!         |lp, client, chunk, _error| {
//!             client.send_data(lp, chunk.as_slice());
//!         },
//!         |_lp, _client, _error| {},
//!     )
//!     .unwrap();
//! lp.run().unwrap();
//! ```

#![cfg(unix)]
#![deny(missing_debug_implementations)]

mod buf;
mod codec;
mod error;
mod event_loop;
mod handle;
mod sys;
mod thread_pool;
mod timer;
mod token;

pub mod fs;
pub mod net;

pub use crate::buf::{DataChunk, SharedBuf};
pub use crate::codec::VariableLengthSize;
pub use crate::error::{Error, StatusCode};
pub use crate::event_loop::{EventLoop, EventLoopConfig, LoopSender};
pub use crate::fs::{Dir, File};
pub use crate::handle::{Handle, HandleId, RefCountedHandle};
pub use crate::net::{
    Endpoint, EndpointType, TcpClient, TcpConnectedClient, TcpServer, UdpClient, UdpPeer,
    UdpServer,
};
pub use crate::timer::Timer;
pub use crate::token::Token;
