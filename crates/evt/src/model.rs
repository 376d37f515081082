use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::Delta;

/// A server-chosen timestamp, millisecond-truncated, that totally orders events.
pub type Rev = DateTime<Utc>;

/// Truncates `t` to millisecond precision, the unit revisions are compared at.
pub fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    let millis = t.timestamp_millis();
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(t)
}

/// The Go zero-value `time.Time`, represented here as the Unix epoch so
/// revision comparisons can use a plain `Rev` instead of `Option<Rev>`
/// everywhere. A client that has "observed nothing" reports this value (or
/// omits `base` entirely, which decodes to the same thing).
pub fn rev_zero() -> Rev {
    DateTime::<Utc>::from_timestamp(0, 0).unwrap()
}

/// Identifies the logical row an action or event concerns: a topic (qualified
/// model name) and the primary-key value rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sig {
    #[serde(rename = "top")]
    pub topic: String,
    pub key: String,
}

impl Sig {
    pub fn new(topic: impl Into<String>, key: impl Into<String>) -> Self {
        Sig { topic: topic.into(), key: key.into() }
    }
}

/// One of the three mutation kinds an action may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmd {
    New,
    Mod,
    Del,
}

/// One logical mutation against one row: create, update, or delete, identified
/// by [`Sig`]. `arg` carries the full value for `New`, additive deltas for `Mod`,
/// and is ignored for `Del`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub sig: Sig,
    pub cmd: Cmd,
    #[serde(default)]
    pub arg: Delta,
}

/// An action that has been committed to the log, annotated with its log id
/// and assigned revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub rev: Rev,
    #[serde(flatten)]
    pub action: Action,
}

/// Who published a transaction and when, for bookkeeping rather than
/// authorization (authentication is out of scope; `user` arrives pre-verified).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Audit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<Rev>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrived: Option<Rev>,
    #[serde(default)]
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// An atomic group of actions published together against a base revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trans {
    #[serde(default)]
    pub id: i64,
    /// The revision the client last observed. `None` stands for the Go
    /// zero-value timestamp: "I haven't observed anything yet".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Rev>,
    #[serde(flatten)]
    pub audit: Audit,
    pub acts: Vec<Action>,
}

/// `{topic, keys}`: the shape of interest a monitor registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watch {
    #[serde(rename = "top")]
    pub topic: String,
    pub keys: Vec<String>,
}

/// The wire form of one fired monitor: which monitor, and which `(topic,key)`
/// pairs (grouped by topic, first-seen order) triggered it this cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub mon: i64,
    pub watch: Vec<Watch>,
}

/// The coalesced per-subscriber payload pushed as `evt.update`, or returned
/// directly as the result of `evt.pub`/`evt.sub`/`evt.sat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    pub rev: Option<Rev>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evs: Vec<Event>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<Note>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.evs.is_empty() && self.note.is_empty()
    }
}

/// Satellite-only: current replication state, reported by `evt.stat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    pub rev: Option<Rev>,
    #[serde(rename = "mig", default)]
    pub migration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<Rev>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub off: Option<Rev>,
}
