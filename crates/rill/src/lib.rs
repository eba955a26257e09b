//! Event-driven TCP and UNIX stream runtime.
//!
//! A [`Reactor`] multiplexes many connections on one thread over mio
//! readiness. Inbound bytes arrive as [`Event::Data`] slices carved from
//! a shared pool, outbound writes queue with backpressure and drain on
//! writable readiness, and idle timeouts are grouped per timeout value
//! onto intrusive lists so a thousand sockets with one timeout cost one
//! timer.
//!
//! Drive all I/O by calling [`Reactor::poll_with`] in a loop; every
//! lifecycle transition (`Listening`, `Connection`, `Connect`, `Data`,
//! `End`, `Drain`, `Timeout`, `Error`, `Close`) is delivered to the
//! handler, addressed by [`Token`].

mod error;
mod event;
mod idle;
mod pool;
mod reactor;
mod resolve;
mod server;
mod stream;

pub use mio::Token;

pub use error::Error;
pub use event::{Encoding, Event, Payload, ReadyState, Transport};
pub use reactor::Reactor;
