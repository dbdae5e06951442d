//! Server-side WebSockets endpoint for Tokio stack.
//!
//! This library drives a single websocket session over a TCP connection that
//! an outer server already accepted: it performs the HTTP upgrade handshake
//! of the [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455),
//! then hands back a [`Session`] that parses masked client frames
//! incrementally (whatever chunking TCP delivers), reassembles fragmented
//! messages, answers pings, and emits unmasked server frames.
//!
//! The session is deliberately single-owner: one task calls
//! [`Session::process`] in a loop, messages arrive through assignable
//! callbacks, and all failures fold into the session's close state instead
//! of bubbling as errors.
//!
//! [`Session`]: session::Session
//! [`Session::process`]: session::Session::process

pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod request;
pub mod session;
pub mod sink;
mod utils;
