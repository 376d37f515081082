use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{truncate_to_millis, Event, Rev, Trans};

/// How a topic's primary key is rendered as a string.
///
/// Integer kinds render as decimal; string kinds use the raw string. Any other
/// kind is an [`crate::error::Error::UnsupportedKey`] at apply time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Int,
    Str,
}

/// One topic's schema-relevant shape: its name, primary key field and
/// encoding, and whether it carries a `rev` field the ledger should stamp.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub topic: String,
    pub key_field: String,
    pub key_kind: KeyKind,
    pub has_rev: bool,
}

impl ModelSchema {
    pub fn new(topic: impl Into<String>, key_field: impl Into<String>, key_kind: KeyKind) -> Self {
        ModelSchema { topic: topic.into(), key_field: key_field.into(), key_kind, has_rev: false }
    }

    pub fn with_rev(mut self) -> Self {
        self.has_rev = true;
        self
    }
}

/// A read-only view of the project schema a ledger was built against: which
/// topics exist and how each one's primary key is encoded. Everything else a
/// schema might describe (field types, validation, relations) is an excluded
/// collaborator — the ledger only needs enough to key and apply deltas.
#[derive(Debug, Clone, Default)]
pub struct Project {
    models: Vec<ModelSchema>,
}

impl Project {
    pub fn new(models: Vec<ModelSchema>) -> Self {
        Project { models }
    }

    pub fn model(&self, topic: &str) -> Option<&ModelSchema> {
        self.models.iter().find(|m| m.topic == topic)
    }

    pub fn key_kind(&self, topic: &str) -> Option<KeyKind> {
        self.model(topic).map(|m| m.key_kind)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.topic.as_str())
    }
}

/// Computes the next revision to assign: the current wall clock truncated to
/// milliseconds, or one millisecond past the current revision, whichever is
/// later. Guarantees two publishes observing the same wall-clock millisecond
/// still receive distinct revisions.
pub fn next_rev(cur: Option<Rev>, now: DateTime<Utc>) -> Rev {
    let now_ms = truncate_to_millis(now);
    match cur {
        Some(cur) => std::cmp::max(now_ms, cur + chrono::Duration::milliseconds(1)),
        None => now_ms,
    }
}

/// The core append-only event log. Thread-unsafe by design: every implementation
/// is meant to be confined to one task (the Controller's), so it carries no
/// internal synchronization of its own.
pub trait Ledger: Send {
    /// The latest committed revision, or `None` for an empty ledger.
    fn rev(&self) -> Option<Rev>;

    fn project(&self) -> &Project;

    /// All events with `rev` after `since`, restricted to `topics` (all topics
    /// if empty), in id order.
    fn events(&self, since: Option<Rev>, topics: &[String]) -> Vec<Event>;

    /// Validates, applies, and commits a transaction, returning the revision it
    /// was assigned and the events it produced.
    fn publish(&mut self, tx: Trans) -> Result<(Rev, Vec<Event>)>;
}

/// Optional capability for a follower ledger: accept events already committed
/// elsewhere without re-running conflict detection.
pub trait Replicator: Ledger {
    fn replicate(&mut self, events: Vec<Event>) -> Result<()>;
}

/// Optional capability for a satellite with offline authority over some model
/// subset: publish while disconnected, and recall what was published that way
/// so it can be replayed to the authoritative server on reconnect.
pub trait LocalPublisher: Ledger {
    fn publish_local(&mut self, tx: Trans) -> Result<(Rev, Vec<Event>)>;
    fn locals(&self) -> Vec<Trans>;
    /// Drops every recorded local transaction, once a satellite has confirmed
    /// they were accepted upstream via `evt.sat`.
    fn clear_locals(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_rev_with_no_current_uses_truncated_now() {
        let now = DateTime::<Utc>::from_timestamp(10, 750_000_000).unwrap();
        let rev = next_rev(None, now);
        assert_eq!(rev.timestamp_subsec_millis(), 750);
    }

    #[test]
    fn next_rev_advances_past_current_within_same_millisecond() {
        let now = DateTime::<Utc>::from_timestamp(10, 0).unwrap();
        let cur = now;
        let rev = next_rev(Some(cur), now);
        assert_eq!(rev, cur + chrono::Duration::milliseconds(1));
    }

    #[test]
    fn next_rev_uses_now_when_clock_has_moved_past_current() {
        let cur = DateTime::<Utc>::from_timestamp(10, 0).unwrap();
        let now = DateTime::<Utc>::from_timestamp(20, 0).unwrap();
        assert_eq!(next_rev(Some(cur), now), now);
    }
}
