use std::collections::HashMap;
use std::sync::Arc;

use hub::Conn;

use crate::model::{Event, Note, Rev, Sig, Update, Watch};

/// A narrower interest than a topic subscription: fires on specific `(topic,key)`
/// pairs rather than every event under a topic.
pub struct Monitor {
    pub id: i64,
    pub watch: Vec<Watch>,
    buf: Vec<Sig>,
}

impl Monitor {
    fn watches(&self, sig: &Sig) -> bool {
        self.watch.iter().any(|w| w.topic == sig.topic && w.keys.iter().any(|k| k == &sig.key))
    }
}

/// A connection-scoped record of subscribed topics, monitors, and buffered
/// pending updates. Created lazily on first `sub`/`mon`, destroyed once both
/// `subs` and `monitors` are empty (or on signoff).
pub struct Subscriber {
    pub conn: Arc<dyn Conn>,
    pub rev: Rev,
    pub subs: Vec<String>,
    pub monitors: Vec<Monitor>,
    buf: Vec<Event>,
    note: bool,
    next_mon_id: i64,
}

impl Subscriber {
    fn new(conn: Arc<dyn Conn>, rev: Rev) -> Self {
        Subscriber { conn, rev, subs: Vec::new(), monitors: Vec::new(), buf: Vec::new(), note: false, next_mon_id: 0 }
    }

    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.monitors.is_empty()
    }

    /// Builds this subscriber's coalesced [`Update`] for revision `rev`, advancing
    /// its watermark and clearing every buffer. Returns `None` if there is
    /// nothing to report and the watermark didn't move.
    fn take_update(&mut self, rev: Rev) -> Option<Update> {
        let advanced = rev > self.rev;
        if advanced {
            self.rev = rev;
        }
        if self.buf.is_empty() && !self.note && !advanced {
            return None;
        }

        let note = self
            .monitors
            .iter_mut()
            .filter(|m| !m.buf.is_empty())
            .map(|m| Note { mon: m.id, watch: watches_from_sigs(&std::mem::take(&mut m.buf)) })
            .collect();

        let update = Update { rev: Some(self.rev), evs: std::mem::take(&mut self.buf), note };
        self.note = false;
        Some(update)
    }
}

/// Groups a sig list by topic, preserving first-seen order of both topics and
/// keys, the wire shape monitors report their hits in.
fn watches_from_sigs(sigs: &[Sig]) -> Vec<Watch> {
    let mut watches: Vec<Watch> = Vec::new();
    for sig in sigs {
        if let Some(w) = watches.iter_mut().find(|w: &&mut Watch| w.topic == sig.topic) {
            if !w.keys.contains(&sig.key) {
                w.keys.push(sig.key.clone());
            }
        } else {
            watches.push(Watch { topic: sig.topic.clone(), keys: vec![sig.key.clone()] });
        }
    }
    watches
}

/// The subscription engine: per-connection subscribers, indexed both by topic
/// (for broad interest) and by `(topic,key)` signature (for monitors).
#[derive(Default)]
pub struct Subscribers {
    by_conn: HashMap<i64, Subscriber>,
    by_topic: HashMap<String, Vec<i64>>,
    by_monitor_sig: HashMap<Sig, Vec<(i64, i64)>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Subscribers::default()
    }

    fn subscriber_mut(&mut self, conn: &Arc<dyn Conn>, rev: Rev) -> &mut Subscriber {
        self.by_conn.entry(conn.id()).or_insert_with(|| Subscriber::new(conn.clone(), rev))
    }

    /// Subscribes `conn` to `topics` (creating its subscriber on first use) and
    /// returns the subset that's newly added — the caller fetches missed events
    /// for exactly those topics. Idempotent per-topic.
    pub fn sub(&mut self, conn: &Arc<dyn Conn>, rev: Rev, topics: &[String]) -> Vec<String> {
        let id = conn.id();
        self.subscriber_mut(conn, rev);
        let mut added = Vec::new();
        for topic in topics {
            let sub = self.by_conn.get_mut(&id).unwrap();
            if !sub.subs.contains(topic) {
                sub.subs.push(topic.clone());
                self.by_topic.entry(topic.clone()).or_default().push(id);
                added.push(topic.clone());
            }
        }
        added
    }

    /// Unsubscribes `conn` from `topics`, or from everything if `topics` is `None`
    /// (monitors are left intact). Drops the subscriber once it's entirely empty.
    pub fn unsub(&mut self, conn_id: i64, topics: Option<&[String]>) -> bool {
        let Some(sub) = self.by_conn.get_mut(&conn_id) else { return false };
        let removed: Vec<String> = match topics {
            Some(ts) => {
                sub.subs.retain(|t| !ts.contains(t));
                ts.to_vec()
            }
            None => std::mem::take(&mut sub.subs),
        };
        for topic in &removed {
            if let Some(ids) = self.by_topic.get_mut(topic) {
                ids.retain(|&id| id != conn_id);
            }
        }
        if let Some(sub) = self.by_conn.get_mut(&conn_id) {
            let removed_set = removed;
            sub.buf.retain(|ev| !removed_set.contains(&ev.action.sig.topic));
        }
        self.drop_if_empty(conn_id);
        true
    }

    /// Registers a monitor on `conn` for each `(topic,key)` pair in `watch` and
    /// returns its per-subscriber id (starting at 1).
    pub fn mon(&mut self, conn: &Arc<dyn Conn>, rev: Rev, watch: Vec<Watch>) -> i64 {
        let id = conn.id();
        let sub = self.subscriber_mut(conn, rev);
        sub.next_mon_id += 1;
        let mon_id = sub.next_mon_id;
        sub.monitors.push(Monitor { id: mon_id, watch: watch.clone(), buf: Vec::new() });
        for w in &watch {
            for key in &w.keys {
                let sig = Sig::new(w.topic.clone(), key.clone());
                self.by_monitor_sig.entry(sig).or_default().push((id, mon_id));
            }
        }
        mon_id
    }

    pub fn unmon(&mut self, conn_id: i64, mon_id: i64) -> bool {
        let Some(sub) = self.by_conn.get_mut(&conn_id) else { return false };
        let before = sub.monitors.len();
        sub.monitors.retain(|m| m.id != mon_id);
        if sub.monitors.len() == before {
            return false;
        }
        for entries in self.by_monitor_sig.values_mut() {
            entries.retain(|&(id, m)| !(id == conn_id && m == mon_id));
        }
        self.by_monitor_sig.retain(|_, v| !v.is_empty());
        self.drop_if_empty(conn_id);
        true
    }

    fn drop_if_empty(&mut self, conn_id: i64) {
        if self.by_conn.get(&conn_id).is_some_and(Subscriber::is_empty) {
            self.by_conn.remove(&conn_id);
        }
    }

    /// Fans committed `events` out to interested subscribers and monitors.
    /// `from` never receives its own events back (sender exclusion). Returns the
    /// sender's own subscriber (created as a one-shot if it has none) and
    /// whether any other subscriber was affected, the signal the caller uses to
    /// decide whether to trigger a broadcast.
    pub fn show(&mut self, from: &Arc<dyn Conn>, events: &[Event]) -> (Update, bool) {
        let mut others_affected = false;

        for ev in events {
            let sig = &ev.action.sig;
            if let Some(ids) = self.by_topic.get(&sig.topic).cloned() {
                for id in ids {
                    if id == from.id() {
                        continue;
                    }
                    if let Some(sub) = self.by_conn.get_mut(&id) {
                        sub.buf.push(ev.clone());
                        others_affected = true;
                    }
                }
            }

            if let Some(entries) = self.by_monitor_sig.get(sig).cloned() {
                for (id, mon_id) in entries {
                    if let Some(sub) = self.by_conn.get_mut(&id) {
                        if let Some(m) = sub.monitors.iter_mut().find(|m| m.id == mon_id) {
                            m.buf.push(sig.clone());
                            sub.note = true;
                            if id != from.id() {
                                others_affected = true;
                            }
                        }
                    }
                }
            }

            // A `new` event always fires every monitor on the topic regardless of key,
            // since a freshly created row couldn't have been registered by key before now.
            if ev.action.cmd == crate::model::Cmd::New {
                for sub in self.by_conn.values_mut() {
                    for m in &mut sub.monitors {
                        if m.watch.iter().any(|w| w.topic == sig.topic) && !m.watches(sig) {
                            m.buf.push(sig.clone());
                            sub.note = true;
                            if sub.conn.id() != from.id() {
                                others_affected = true;
                            }
                        }
                    }
                }
            }
        }

        let sender_rev = self.by_conn.get(&from.id()).map(|s| s.rev).unwrap_or_else(crate::model::rev_zero);
        let sender_update = self
            .by_conn
            .get_mut(&from.id())
            .and_then(|s| s.take_update(s.rev.max(sender_rev)))
            .unwrap_or_default();

        (sender_update, others_affected)
    }

    /// Builds and flushes every subscriber's pending [`Update`] for `rev`.
    /// Returns the `(conn, update)` pairs so the caller can push `evt.update`.
    pub fn bcast(&mut self, rev: Rev) -> Vec<(Arc<dyn Conn>, Update)> {
        let mut out = Vec::new();
        for sub in self.by_conn.values_mut() {
            if let Some(update) = sub.take_update(rev) {
                out.push((sub.conn.clone(), update));
            }
        }
        out
    }

    pub fn has_subscriber(&self, conn_id: i64) -> bool {
        self.by_conn.contains_key(&conn_id)
    }

    /// Every connection with an active subscriber record, for broadcasts that
    /// aren't scoped to a particular topic (e.g. a satellite's `evt.stat`).
    pub fn all_conns(&self) -> impl Iterator<Item = &Arc<dyn Conn>> {
        self.by_conn.values().map(|s| &s.conn)
    }

    /// Flushes whatever `conn_id`'s subscriber currently has buffered, without
    /// requiring its watermark to have advanced. Used to hand a sender its own
    /// pre-existing buffered updates separately from a reply it's about to get.
    pub fn flush_pending(&mut self, conn_id: i64) -> Option<Update> {
        let rev = self.by_conn.get(&conn_id)?.rev;
        self.by_conn.get_mut(&conn_id)?.take_update(rev)
    }

    /// Inserts freshly fetched `events` at the front of `conn_id`'s buffer (the
    /// caller already knows they predate anything buffered since) and restores
    /// rev ordering.
    pub fn prepend_events(&mut self, conn_id: i64, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if let Some(sub) = self.by_conn.get_mut(&conn_id) {
            let mut merged = events;
            merged.append(&mut sub.buf);
            merged.sort_by_key(|ev| ev.rev);
            sub.buf = merged;
        }
    }

    /// Removes every monitor belonging to `conn_id`, unlike [`Self::unmon`] which
    /// removes exactly one. Used on signoff, alongside `unsub(conn_id, None)`.
    pub fn unmon_all(&mut self, conn_id: i64) {
        let Some(sub) = self.by_conn.get_mut(&conn_id) else { return };
        sub.monitors.clear();
        for entries in self.by_monitor_sig.values_mut() {
            entries.retain(|&(id, _)| id != conn_id);
        }
        self.by_monitor_sig.retain(|_, v| !v.is_empty());
        self.drop_if_empty(conn_id);
    }
}
