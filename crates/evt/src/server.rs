use std::sync::Arc;

use hub::Conn;
use serde::{Deserialize, Serialize};

use crate::ctrl::Ctrl;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::model::{rev_zero, Rev, Trans, Update, Watch};

pub const PUB: &str = "evt.pub";
pub const SUB: &str = "evt.sub";
pub const SAT: &str = "evt.sat";
pub const UNSUB: &str = "evt.unsub";
pub const MON: &str = "evt.mon";
pub const UNMON: &str = "evt.unmon";
pub const STAT: &str = "evt.stat";
pub const UPDATE: &str = "evt.update";

/// `evt.pub` request. A publish is simply a transaction; the wire shape is
/// `Trans` itself (`{id,base,created,arrived,user,extra,acts}`).
pub type PubReq = Trans;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubReq {
    #[serde(default)]
    pub rev: Option<Rev>,
    #[serde(default, rename = "tops")]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatReq {
    #[serde(default)]
    pub rev: Option<Rev>,
    pub trans: Vec<Trans>,
    #[serde(default, rename = "tops")]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubReq {
    #[serde(default, rename = "tops")]
    pub topics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonReq {
    #[serde(default)]
    pub rev: Option<Rev>,
    pub watch: Vec<Watch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmonReq {
    #[serde(rename = "mon")]
    pub mon_id: i64,
}

/// The authoritative-publisher service methods, implemented directly on
/// [`Ctrl`] since they're the only code that ever touches its ledger and
/// subscription state: both are confined to whichever task owns the
/// controller, so there is nothing for a separate `Server` handle to hold.
impl<L: Ledger> Ctrl<L> {
    /// Stamps `req`'s audit fields, publishes it, fans the new events out to
    /// every other interested subscriber, and flushes whatever the sender
    /// itself had buffered — both from concurrent activity before this call
    /// and from this very publish (e.g. a monitor the sender itself owns on
    /// the key it just touched) — as a separate `evt.update` push. The reply
    /// this returns always carries only the freshly committed `rev`/`evs`,
    /// never a `note`.
    pub async fn handle_pub(&mut self, from: &Arc<dyn Conn>, mut req: PubReq) -> Result<Update> {
        if req.audit.user.is_empty() {
            req.audit.user = from.user().to_string();
        }
        if req.audit.arrived.is_none() {
            req.audit.arrived = Some(chrono::Utc::now());
        }

        if let Some(pending) = self.subs.flush_pending(from.id()) {
            hub::send(from.as_ref(), crate::ctrl::update_msg(&pending));
        }

        let (rev, events) = self.ledger.publish(req)?;
        let (sender_update, others_affected) = self.subs.show(from, &events);
        if others_affected {
            self.btrig();
        }
        if !sender_update.is_empty() {
            hub::send(from.as_ref(), crate::ctrl::update_msg(&sender_update));
        }
        Ok(Update { rev: Some(rev), evs: events, note: Vec::new() })
    }

    /// Accepts a batch of offline transactions from a reconnecting satellite,
    /// publishes each with server-assigned revisions, then folds the tail of
    /// the request into an ordinary subscribe and returns its initial Update.
    pub async fn handle_sat(&mut self, from: &Arc<dyn Conn>, req: SatReq) -> Result<Update> {
        let mut any_others_affected = false;
        for tx in req.trans {
            let (_rev, events) = self.ledger.publish(tx)?;
            let (_, others_affected) = self.subs.show(from, &events);
            any_others_affected |= others_affected;
        }
        if any_others_affected {
            self.btrig();
        }
        self.handle_sub(from, SubReq { rev: req.rev, topics: req.topics }).await
    }

    /// Subscribes to `req.topics`, backfills whatever the subscriber missed
    /// since `req.rev` for the newly added ones, and returns the initial Update.
    pub async fn handle_sub(&mut self, from: &Arc<dyn Conn>, req: SubReq) -> Result<Update> {
        let rev = req.rev.unwrap_or_else(rev_zero);
        let added = self.subs.sub(from, rev, &req.topics);
        let missed = self.ledger.events(Some(rev), &added);
        self.subs.prepend_events(from.id(), missed);
        Ok(self.subs.flush_pending(from.id()).unwrap_or_default())
    }

    pub fn handle_unsub(&mut self, conn_id: i64, req: UnsubReq) -> bool {
        self.subs.unsub(conn_id, req.topics.as_deref())
    }

    pub fn handle_mon(&mut self, from: &Arc<dyn Conn>, req: MonReq) -> i64 {
        self.subs.mon(from, req.rev.unwrap_or_else(rev_zero), req.watch)
    }

    pub fn handle_unmon(&mut self, conn_id: i64, req: UnmonReq) -> bool {
        self.subs.unmon(conn_id, req.mon_id)
    }

    /// JSON-framing wrapper around [`Self::handle_pub`], the shape [`crate::ctrl::Ctrl::dispatch`]
    /// calls for the `evt.pub` subject. Decodes `msg.raw` and replies `{res}`/`{err}`
    /// on the sender's own channel, running against `&mut self` rather than a
    /// stateless handler since it needs mutable access to the ledger and
    /// subscription state.
    pub(crate) async fn serve_pub(&mut self, msg: Msg) {
        let Some(from) = msg.from.clone() else { return };
        let reply = match msg.unmarshal::<PubReq>() {
            Ok(req) => match self.handle_pub(&from, req).await {
                Ok(update) => msg.reply_res(&update),
                Err(err) => Ok(msg.reply_err(&err.to_string())),
            },
            Err(err) => Ok(msg.reply_err(&err.to_string())),
        };
        if let Ok(reply) = reply {
            hub::send(from.as_ref(), reply);
        }
    }

    pub(crate) async fn serve_sat(&mut self, msg: Msg) {
        let Some(from) = msg.from.clone() else { return };
        let reply = match msg.unmarshal::<SatReq>() {
            Ok(req) => match self.handle_sat(&from, req).await {
                Ok(update) => msg.reply_res(&update),
                Err(err) => Ok(msg.reply_err(&err.to_string())),
            },
            Err(err) => Ok(msg.reply_err(&err.to_string())),
        };
        if let Ok(reply) = reply {
            hub::send(from.as_ref(), reply);
        }
    }

    pub(crate) async fn serve_sub(&mut self, msg: Msg) {
        let Some(from) = msg.from.clone() else { return };
        let reply = match msg.unmarshal::<SubReq>() {
            Ok(req) => match self.handle_sub(&from, req).await {
                Ok(update) => msg.reply_res(&update),
                Err(err) => Ok(msg.reply_err(&err.to_string())),
            },
            Err(err) => Ok(msg.reply_err(&err.to_string())),
        };
        if let Ok(reply) = reply {
            hub::send(from.as_ref(), reply);
        }
    }

    pub(crate) fn serve_unsub(&mut self, msg: Msg) {
        let Some(from) = msg.from.clone() else { return };
        let reply = match msg.unmarshal::<UnsubReq>() {
            Ok(req) => msg.reply_res(&self.handle_unsub(from.id(), req)),
            Err(err) => Ok(msg.reply_err(&err.to_string())),
        };
        if let Ok(reply) = reply {
            hub::send(from.as_ref(), reply);
        }
    }

    pub(crate) fn serve_mon(&mut self, msg: Msg) {
        let Some(from) = msg.from.clone() else { return };
        let reply = match msg.unmarshal::<MonReq>() {
            Ok(req) => msg.reply_res(&self.handle_mon(&from, req)),
            Err(err) => Ok(msg.reply_err(&err.to_string())),
        };
        if let Ok(reply) = reply {
            hub::send(from.as_ref(), reply);
        }
    }

    pub(crate) fn serve_unmon(&mut self, msg: Msg) {
        let Some(from) = msg.from.clone() else { return };
        let reply = match msg.unmarshal::<UnmonReq>() {
            Ok(req) => msg.reply_res(&self.handle_unmon(from.id(), req)),
            Err(err) => Ok(msg.reply_err(&err.to_string())),
        };
        if let Ok(reply) = reply {
            hub::send(from.as_ref(), reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;
    use crate::ledger::{KeyKind, ModelSchema, Project};
    use crate::mem_ledger::MemLedger;
    use crate::model::{Action, Audit, Cmd, Sig};
    use hub::ChanConn;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn ctrl() -> Ctrl<MemLedger> {
        let project = Project::new(vec![ModelSchema::new("prod.cat", "id", KeyKind::Int)]);
        let (tx, _rx) = mpsc::channel(16);
        Ctrl::new(MemLedger::new(project), tx)
    }

    fn conn(id: i64, user: &str) -> (Arc<dyn Conn>, mpsc::Receiver<Option<hub::Msg>>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(ChanConn::new(CancellationToken::new(), id, user, tx)), rx)
    }

    fn new_trans(key: &str, name: &str) -> PubReq {
        let mut arg = Delta::new();
        arg.0.insert("name".into(), json!(name));
        Trans {
            id: 0,
            base: None,
            audit: Audit::default(),
            acts: vec![Action { sig: Sig::new("prod.cat", key), cmd: Cmd::New, arg }],
        }
    }

    #[tokio::test]
    async fn scenario_c_subscriber_receives_others_publish_but_not_its_own() {
        let mut ctrl = ctrl();
        let (a, _a_rx) = conn(1, "alice");
        let (b, _b_rx) = conn(2, "bob");

        ctrl.handle_sub(&a, SubReq { rev: None, topics: vec!["prod.cat".into()] }).await.unwrap();

        let reply_b = ctrl.handle_pub(&b, new_trans("1", "a")).await.unwrap();
        assert_eq!(reply_b.evs.len(), 1);

        let flushed_a = ctrl.subs.flush_pending(1).unwrap();
        assert_eq!(flushed_a.evs.len(), 1);
        assert_eq!(flushed_a.evs[0].action.sig.key, "1");
    }

    #[tokio::test]
    async fn scenario_d_monitor_notes_without_subscribing() {
        let mut ctrl = ctrl();
        let (a, _a_rx) = conn(1, "alice");
        let (b, _b_rx) = conn(2, "bob");

        ctrl.handle_pub(&a, new_trans("1", "a")).await.unwrap();
        ctrl.handle_mon(
            &a,
            MonReq { rev: None, watch: vec![Watch { topic: "prod.cat".into(), keys: vec!["1".into()] }] },
        );

        let mut modify = Delta::new();
        modify.0.insert("name".into(), json!("b"));
        let tx = Trans {
            id: 0,
            base: None,
            audit: Audit::default(),
            acts: vec![Action { sig: Sig::new("prod.cat", "1"), cmd: Cmd::Mod, arg: modify }],
        };
        ctrl.handle_pub(&b, tx).await.unwrap();

        let flushed = ctrl.subs.flush_pending(1).unwrap();
        assert!(flushed.evs.is_empty());
        assert_eq!(flushed.note.len(), 1);
        assert_eq!(flushed.note[0].mon, 1);
    }

    #[tokio::test]
    async fn publishing_to_a_self_monitored_key_pushes_the_note_instead_of_bundling_it_in_the_reply() {
        let mut ctrl = ctrl();
        let (a, mut a_rx) = conn(1, "alice");

        ctrl.handle_pub(&a, new_trans("1", "a")).await.unwrap();
        let mon_id = ctrl.handle_mon(
            &a,
            MonReq { rev: None, watch: vec![Watch { topic: "prod.cat".into(), keys: vec!["1".into()] }] },
        );
        assert_eq!(mon_id, 1);

        let mut modify = Delta::new();
        modify.0.insert("name".into(), json!("b"));
        let tx = Trans {
            id: 0,
            base: None,
            audit: Audit::default(),
            acts: vec![Action { sig: Sig::new("prod.cat", "1"), cmd: Cmd::Mod, arg: modify }],
        };
        let reply = ctrl.handle_pub(&a, tx).await.unwrap();
        assert!(reply.note.is_empty());
        assert_eq!(reply.evs.len(), 1);

        let pushed = a_rx.try_recv().unwrap().unwrap();
        assert_eq!(pushed.subj, "evt.update");
        let pushed_update: Update = pushed.unmarshal().unwrap();
        assert!(pushed_update.evs.is_empty());
        assert_eq!(pushed_update.note.len(), 1);
        assert_eq!(pushed_update.note[0].mon, mon_id);
    }

    #[tokio::test]
    async fn unsub_and_unmon_roundtrip() {
        let mut ctrl = ctrl();
        let (a, _a_rx) = conn(1, "alice");
        ctrl.handle_sub(&a, SubReq { rev: None, topics: vec!["prod.cat".into()] }).await.unwrap();
        let mon_id = ctrl.handle_mon(
            &a,
            MonReq { rev: None, watch: vec![Watch { topic: "prod.cat".into(), keys: vec!["1".into()] }] },
        );
        assert!(ctrl.handle_unsub(1, UnsubReq { topics: None }));
        assert!(ctrl.handle_unmon(1, UnmonReq { mon_id }));
        assert!(!ctrl.subs.has_subscriber(1));
    }
}
