use regex::Regex;

use crate::conn::Conn;
use crate::msg::Msg;

/// A router inspects an inbound message and decides what to do with it.
///
/// Routers are tried in order; the first one that returns `true` stops the chain.
/// Returning `false` lets the hub fall through to the next router, and if none
/// match, the hub logs and drops the message.
pub trait Router: Send + Sync {
    fn route(&self, from: &dyn Conn, msg: &Msg) -> bool;
}

/// A chain of routers tried in registration order.
#[derive(Default)]
pub struct Routers {
    routers: Vec<Box<dyn Router>>,
}

impl Routers {
    pub fn new() -> Self {
        Routers { routers: Vec::new() }
    }

    pub fn add(&mut self, r: Box<dyn Router>) {
        self.routers.push(r);
    }

    /// Runs the chain, returning whether some router claimed the message.
    pub fn route(&self, from: &dyn Conn, msg: &Msg) -> bool {
        self.routers.iter().any(|r| r.route(from, msg))
    }
}

/// Adapts a plain closure into a [`Router`].
pub struct RouterFunc<F>(pub F)
where
    F: Fn(&dyn Conn, &Msg) -> bool + Send + Sync;

impl<F> Router for RouterFunc<F>
where
    F: Fn(&dyn Conn, &Msg) -> bool + Send + Sync,
{
    fn route(&self, from: &dyn Conn, msg: &Msg) -> bool {
        (self.0)(from, msg)
    }
}

/// Matches a message's subject against an exact string.
pub fn match_filter(subj: &str) -> impl Fn(&Msg) -> bool + '_ {
    move |m: &Msg| m.subj == subj
}

/// Matches a message's subject by prefix.
pub fn prefix_filter(prefix: &str) -> impl Fn(&Msg) -> bool + '_ {
    move |m: &Msg| m.subj.starts_with(prefix)
}

/// Matches a message's subject against a compiled regular expression.
pub fn regexp_filter(re: Regex) -> impl Fn(&Msg) -> bool {
    move |m: &Msg| re.is_match(&m.subj)
}
