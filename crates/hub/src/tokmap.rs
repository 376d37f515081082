use std::collections::HashMap;
use std::sync::Arc;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::msg::Msg;

/// Rewrites `(connection, token)` pairs across a proxied hop, so a reply that
/// comes back addressed to a hex id this map minted can be routed to whichever
/// original caller is waiting on its own, unrelated token.
///
/// Used by a satellite forwarding requests upstream: the upstream reply only
/// knows the rewritten token, not the original caller. Confined to whichever
/// single task owns the satellite loop; no internal locking.
#[derive(Default)]
pub struct TokMap {
    next: u64,
    entries: HashMap<u64, (Arc<dyn Conn>, String)>,
}

impl TokMap {
    pub fn new() -> Self {
        TokMap { next: 0, entries: HashMap::new() }
    }

    /// Stashes `(msg.from, msg.tok)` under a fresh hex id and returns that id as
    /// the token to use when forwarding `msg` onward.
    pub fn add(&mut self, msg: &Msg) -> Result<String> {
        let from = msg
            .from
            .clone()
            .ok_or_else(|| Error::Transport("message has no originating connection".into()))?;
        self.next += 1;
        let id = self.next;
        self.entries.insert(id, (from, msg.tok.clone()));
        Ok(format!("{id:x}"))
    }

    /// Restores the original `(connection, token)` for `reply` in place and
    /// returns the connection it should now be sent on, consuming the entry.
    pub fn respond(&mut self, reply: &mut Msg) -> Result<Arc<dyn Conn>> {
        let id = u64::from_str_radix(&reply.tok, 16)
            .map_err(|_| Error::BadTokenEncoding(reply.tok.clone()))?;
        let (conn, tok) = self
            .entries
            .remove(&id)
            .ok_or_else(|| Error::UnknownToken(reply.tok.clone()))?;
        reply.tok = tok;
        Ok(conn)
    }
}
