use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::ledger::{next_rev, KeyKind, Ledger, LocalPublisher, ModelSchema, Project, Replicator};
use crate::model::{rev_zero, Action, Cmd, Event, Rev, Sig, Trans};

type Row = Map<String, Value>;

/// A reversal step recorded while applying a transaction, so a failure partway
/// through can be undone exactly. Represented as an explicit sum type rather
/// than a boxed closure, keeping ledger state inspectable (and testable) after
/// a rollback — there's nothing here a debugger or a unit test can't print.
#[derive(Debug, Clone)]
enum Revert {
    TruncateList { topic: String },
    RestoreSnapshot { topic: String, index: usize, snapshot: Row },
    ReinsertAt { topic: String, index: usize, row: Row },
}

/// The in-memory reference ledger: a `Project` schema plus one row list per
/// topic, entirely resident in the owning task's memory. Persistence to disk
/// is an explicit non-goal; a durable ledger would implement the same traits
/// over a backing store instead of `HashMap<String, Vec<Row>>`.
pub struct MemLedger {
    project: Project,
    data: HashMap<String, Vec<Row>>,
    log: Vec<Event>,
    next_id: i64,
    committed_rev: Option<Rev>,
    locals: Vec<Trans>,
}

impl MemLedger {
    pub fn new(project: Project) -> Self {
        MemLedger {
            project,
            data: HashMap::new(),
            log: Vec::new(),
            next_id: 0,
            committed_rev: None,
            locals: Vec::new(),
        }
    }

    /// Snapshot of every topic's rows, for asserting atomicity around a failed publish.
    #[cfg(test)]
    fn snapshot(&self) -> HashMap<String, Vec<Row>> {
        self.data.clone()
    }

    fn check_conflicts(&self, base: Rev, cur: Rev, acts: &[Action]) -> Result<(), Error> {
        let sigs: HashSet<&Sig> =
            acts.iter().filter(|a| a.cmd != Cmd::New).map(|a| &a.sig).collect();
        if sigs.is_empty() {
            return Ok(());
        }
        for ev in &self.log {
            if ev.rev > base && ev.rev <= cur && sigs.contains(&ev.action.sig) {
                return Err(Error::WriteConflict(ev.action.sig.clone()));
            }
        }
        Ok(())
    }

    fn do_publish(&mut self, mut tx: Trans) -> Result<(Rev, Vec<Event>), Error> {
        let cur = self.committed_rev.unwrap_or_else(rev_zero);
        let base = tx.base.unwrap_or(cur);
        tx.base = Some(base);
        if base > cur {
            return Err(Error::InvalidBase { base: base.timestamp_millis(), cur: cur.timestamp_millis() });
        }
        if tx.acts.is_empty() {
            return Err(Error::EmptyTransaction);
        }

        let now = Utc::now();
        if tx.audit.created.is_none() {
            tx.audit.created = Some(now);
        }
        if tx.audit.arrived.is_none() {
            tx.audit.arrived = Some(now);
        }
        let nrev = next_rev(self.committed_rev, now);

        if cur > base {
            self.check_conflicts(base, cur, &tx.acts)?;
        }

        let mut reverts = Vec::with_capacity(tx.acts.len());
        for act in &tx.acts {
            match self.apply_action(act, nrev) {
                Ok(revert) => reverts.push(revert),
                Err(err) => {
                    self.unwind(reverts);
                    return Err(err);
                }
            }
        }

        let events: Vec<Event> = tx
            .acts
            .into_iter()
            .map(|action| {
                self.next_id += 1;
                Event { id: self.next_id, rev: nrev, action }
            })
            .collect();
        self.log.extend(events.iter().cloned());
        self.committed_rev = Some(nrev);
        Ok((nrev, events))
    }

    fn apply_action(&mut self, act: &Action, rev: Rev) -> Result<Revert, Error> {
        let topic = act.sig.topic.clone();
        let schema = self
            .project
            .model(&topic)
            .cloned()
            .ok_or_else(|| Error::UnknownTopic(topic.clone()))?;
        let rows = self.data.entry(topic.clone()).or_default();

        match act.cmd {
            Cmd::New => {
                let mut row = Row::new();
                let key_val = key_to_value(&act.sig.key, schema.key_kind)
                    .ok_or_else(|| Error::UnsupportedKey(topic.clone()))?;
                row.insert(schema.key_field.clone(), key_val);
                act.arg
                    .apply(&mut row)
                    .map_err(|e| Error::ApplyFailure(act.sig.clone(), e.to_string()))?;
                if schema.has_rev {
                    row.insert("rev".into(), serde_json::to_value(rev).unwrap());
                }
                rows.push(row);
                Ok(Revert::TruncateList { topic })
            }
            Cmd::Mod => {
                let idx = index_key(rows, &schema, &act.sig.key)
                    .ok_or_else(|| Error::ApplyFailure(act.sig.clone(), "row not found".into()))?;
                let snapshot = rows[idx].clone();
                act.arg
                    .apply(&mut rows[idx])
                    .map_err(|e| Error::ApplyFailure(act.sig.clone(), e.to_string()))?;
                if schema.has_rev {
                    rows[idx].insert("rev".into(), serde_json::to_value(rev).unwrap());
                }
                Ok(Revert::RestoreSnapshot { topic, index: idx, snapshot })
            }
            Cmd::Del => {
                let idx = index_key(rows, &schema, &act.sig.key)
                    .ok_or_else(|| Error::ApplyFailure(act.sig.clone(), "row not found".into()))?;
                let row = rows.remove(idx);
                Ok(Revert::ReinsertAt { topic, index: idx, row })
            }
        }
    }

    /// Undoes `reverts` in reverse order. A step that cannot be undone (list
    /// emptied out from under a truncate, index out of range) is a programming
    /// invariant violation, not a recoverable error — the process aborts rather
    /// than continue with a ledger it can no longer trust.
    fn unwind(&mut self, reverts: Vec<Revert>) {
        for r in reverts.into_iter().rev() {
            match r {
                Revert::TruncateList { topic } => {
                    self.data
                        .get_mut(&topic)
                        .and_then(|rows| rows.pop())
                        .expect("revert failure: truncate on an empty topic list");
                }
                Revert::RestoreSnapshot { topic, index, snapshot } => {
                    let rows = self.data.get_mut(&topic).expect("revert failure: unknown topic");
                    *rows.get_mut(index).expect("revert failure: index out of range") = snapshot;
                }
                Revert::ReinsertAt { topic, index, row } => {
                    let rows = self.data.get_mut(&topic).expect("revert failure: unknown topic");
                    if index > rows.len() {
                        panic!("revert failure: reinsert index out of range");
                    }
                    rows.insert(index, row);
                }
            }
        }
    }
}

fn key_to_value(key: &str, kind: KeyKind) -> Option<Value> {
    match kind {
        KeyKind::Int => key.parse::<i64>().ok().map(Value::from),
        KeyKind::Str => Some(Value::String(key.to_string())),
    }
}

fn value_to_key(v: &Value, kind: KeyKind) -> Option<String> {
    match kind {
        KeyKind::Int => v.as_i64().map(|n| n.to_string()),
        KeyKind::Str => v.as_str().map(|s| s.to_string()),
    }
}

fn index_key(rows: &[Row], schema: &ModelSchema, key: &str) -> Option<usize> {
    rows.iter().position(|row| {
        row.get(&schema.key_field)
            .and_then(|v| value_to_key(v, schema.key_kind))
            .as_deref()
            == Some(key)
    })
}

impl Ledger for MemLedger {
    fn rev(&self) -> Option<Rev> {
        self.committed_rev
    }

    fn project(&self) -> &Project {
        &self.project
    }

    fn events(&self, since: Option<Rev>, topics: &[String]) -> Vec<Event> {
        let since = since.unwrap_or_else(rev_zero);
        self.log
            .iter()
            .filter(|ev| ev.rev > since)
            .filter(|ev| topics.is_empty() || topics.iter().any(|t| t == &ev.action.sig.topic))
            .cloned()
            .collect()
    }

    fn publish(&mut self, tx: Trans) -> Result<(Rev, Vec<Event>), crate::error::Error> {
        self.do_publish(tx)
    }
}

impl Replicator for MemLedger {
    fn replicate(&mut self, events: Vec<Event>) -> Result<(), crate::error::Error> {
        for ev in events {
            self.apply_action(&ev.action, ev.rev)?;
            self.next_id = self.next_id.max(ev.id);
            self.committed_rev = Some(self.committed_rev.map_or(ev.rev, |r| r.max(ev.rev)));
            self.log.push(ev);
        }
        Ok(())
    }
}

impl LocalPublisher for MemLedger {
    fn publish_local(&mut self, tx: Trans) -> Result<(Rev, Vec<Event>), crate::error::Error> {
        let result = self.do_publish(tx.clone())?;
        self.locals.push(tx);
        Ok(result)
    }

    fn locals(&self) -> Vec<Trans> {
        self.locals.clone()
    }

    fn clear_locals(&mut self) {
        self.locals.clear();
    }
}
