//! Transport-agnostic connection hub.
//!
//! `hub` knows nothing about WebSockets, TCP, or any other transport: it only
//! knows how to route typed [`Msg`]s between [`Conn`]s on a single task via its
//! [`Router`] chain, and correlate request/reply pairs by token. A transport
//! adapter (not part of this crate) is expected to bridge real sockets to
//! [`ChanConn`]s and pump bytes through [`Msg::read`]/[`Msg::to_wire`].

pub mod conn;
pub mod error;
pub mod filter;
pub mod hub;
pub mod msg;
pub mod tokmap;

pub use conn::{next_id, send, ChanConn, Conn};
pub use error::{Error, Result};
pub use filter::{match_filter, prefix_filter, regexp_filter, Router, RouterFunc, Routers};
pub use hub::{fanout, run, Hub, SIGNOFF, SIGNON};
pub use msg::Msg;
pub use tokmap::TokMap;
