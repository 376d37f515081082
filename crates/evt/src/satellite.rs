use std::collections::HashSet;
use std::sync::Arc;

use hub::{Conn, Msg, TokMap};
use tokio::sync::mpsc;

use crate::ctrl::Ctrl;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LocalPublisher, Replicator};
use crate::model::{Status, Update};
use crate::server::{self, PubReq, SatReq};

/// Optional capability pair a satellite's backing ledger must carry: apply
/// events committed elsewhere without re-running conflict detection, and
/// accept publishes while disconnected from the authoritative server.
pub trait SatelliteLedger: Replicator + LocalPublisher {}
impl<T: Replicator + LocalPublisher> SatelliteLedger for T {}

/// A satellite's connectivity to its upstream authoritative server.
///
/// ```text
///             cli.signon                  cli.signoff
///     Offline ──────────► Connecting ────► Offline
///                              │
///                   initial evt.sat ok
///                              ▼
///                          Online
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Offline,
    Connecting,
    Online,
}

/// Bidirectional adapter between a remote authoritative server and a local
/// [`SatelliteLedger`]. Reuses [`Ctrl`] verbatim for local ledger ownership,
/// subscription fanout, and broadcast throttling — a satellite's downstream
/// clients subscribe and publish exactly as they would against a `Server`.
/// What it adds is upstream reconciliation: replaying locally authoritative
/// transactions on reconnect, proxying everything else through a [`TokMap`],
/// and replicating whatever the upstream pushes back down.
pub struct Satellite<L> {
    pub ctrl: Ctrl<L>,
    upstream: Arc<dyn Conn>,
    toks: TokMap,
    local_topics: HashSet<String>,
    status: Status,
    state: State,
}

impl<L: SatelliteLedger> Satellite<L> {
    pub fn new(
        ledger: L,
        tx: mpsc::Sender<Option<Msg>>,
        upstream: Arc<dyn Conn>,
        local_topics: HashSet<String>,
    ) -> Self {
        Satellite {
            ctrl: Ctrl::new(ledger, tx),
            upstream,
            toks: TokMap::new(),
            local_topics,
            status: Status::default(),
            state: State::Offline,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Option<Msg>> {
        self.ctrl.sender()
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn current_status(&self) -> Status {
        Status {
            rev: self.ctrl.ledger.rev(),
            migration: self.status.migration,
            on: self.status.on,
            off: self.status.off,
        }
    }

    /// Pushes the current [`Status`] to every local subscriber as `evt.stat`.
    fn broadcast_status(&mut self) {
        let raw = serde_json::to_vec(&self.current_status()).expect("Status always encodes");
        let conns: Vec<Arc<dyn Conn>> = self.ctrl.subs.all_conns().cloned().collect();
        for conn in conns {
            let msg = Msg { from: None, subj: server::STAT.into(), tok: String::new(), raw: Some(raw.clone()), data: None };
            hub::send(conn.as_ref(), msg);
        }
    }

    /// Reports the current replication status, serving `evt.stat`.
    pub fn handle_stat(&self) -> Status {
        self.current_status()
    }

    /// Called when the upstream client link comes up. Moves to `Connecting`,
    /// replays unreplicated local transactions via `evt.sat`, and broadcasts
    /// the status change locally. `Online` is only reached once the `evt.sat`
    /// reply arrives (see [`Self::handle_upstream`]).
    pub fn on_remote_signon(&mut self) {
        self.state = State::Connecting;
        self.status.on = Some(chrono::Utc::now());
        self.status.off = None;

        let req = SatReq {
            rev: self.ctrl.ledger.rev(),
            trans: self.ctrl.ledger.locals(),
            topics: self.ctrl.ledger.project().topics().map(String::from).collect(),
        };
        let mut msg = Msg::new(server::SAT);
        msg.raw = Some(serde_json::to_vec(&req).expect("SatReq always encodes"));
        hub::send(self.upstream.as_ref(), msg);

        self.broadcast_status();
    }

    /// Called when the upstream client link drops. Moves to `Offline` and
    /// broadcasts the status change locally.
    pub fn on_remote_signoff(&mut self) {
        self.state = State::Offline;
        self.status.off = Some(chrono::Utc::now());
        self.broadcast_status();
    }

    /// True if every action in `req` targets a topic this satellite has
    /// offline authority over.
    fn has_local_authority(&self, req: &PubReq) -> bool {
        req.acts.iter().all(|a| self.local_topics.contains(&a.sig.topic))
    }

    /// Handles an `evt.pub` from a local downstream caller. Routing depends on
    /// authority and connectivity:
    ///
    /// - no authority over the targeted topics, or online: forward upstream
    ///   through the [`TokMap`]; the reply arrives later via
    ///   [`Self::handle_upstream`] (`Ok(None)`).
    /// - authority and offline: publish locally now; replayed via `evt.sat` on
    ///   reconnect.
    /// - authority and online: publish locally for the immediate reply *and*
    ///   forward upstream so the authoritative log includes it too, rebuilt
    ///   with `base` set to the satellite's own pre-publish revision and
    ///   `acts` set to what was actually committed, so the authoritative
    ///   server's conflict check runs against the satellite's true prior
    ///   state rather than whatever `base` the downstream caller happened to
    ///   send. The remote acknowledgement does not block the caller.
    /// - no authority and offline: nothing can service this request.
    pub async fn handle_local_pub(&mut self, from: Arc<dyn Conn>, mut msg: Msg) -> Result<Option<Update>> {
        let req: PubReq = msg.unmarshal()?;
        let authority = self.has_local_authority(&req);

        if authority {
            let oldrev = self.ctrl.ledger.rev();
            let update = self.ctrl.handle_pub(&from, req.clone()).await?;
            if self.state == State::Online {
                let forwarded = PubReq {
                    id: req.id,
                    base: oldrev,
                    audit: req.audit,
                    acts: update.evs.iter().map(|ev| ev.action.clone()).collect(),
                };
                msg.from = Some(from);
                msg.raw = Some(serde_json::to_vec(&forwarded)?);
                self.forward_upstream(msg)?;
            }
            return Ok(Some(update));
        }

        if self.state != State::Online {
            return Err(Error::Hub(hub::Error::Transport(
                "satellite is offline and has no local authority over this transaction".into(),
            )));
        }

        msg.from = Some(from);
        self.forward_upstream(msg)?;
        Ok(None)
    }

    /// Rewrites `msg`'s token through the [`TokMap`] and sends it upstream.
    fn forward_upstream(&mut self, mut msg: Msg) -> Result<()> {
        let newtok = self.toks.add(&msg)?;
        msg.tok = newtok;
        msg.from = None;
        hub::send(self.upstream.as_ref(), msg);
        Ok(())
    }

    /// Handles a message arriving from the upstream connection: an `evt.sat`
    /// or `evt.pub` reply, or an unsolicited `evt.update` push. Replicates
    /// whatever events it carries into the local ledger and, for a proxied
    /// `evt.pub` reply, routes it back to the original requester.
    pub fn handle_upstream(&mut self, mut msg: Msg) -> Result<()> {
        match msg.subj.as_str() {
            s if s == server::SAT => {
                let update: Update = msg.parse_reply()?;
                self.ctrl.ledger.replicate(update.evs)?;
                self.ctrl.ledger.clear_locals();
                self.state = State::Online;
                self.ctrl.btrig();
            }
            s if s == server::PUB => {
                let update: Update = msg.parse_reply()?;
                self.ctrl.ledger.replicate(update.evs.clone())?;
                if let Ok(conn) = self.toks.respond(&mut msg) {
                    hub::send(conn.as_ref(), msg);
                }
                self.ctrl.btrig();
            }
            s if s == server::UPDATE => {
                let update: Update = msg.unmarshal()?;
                self.ctrl.ledger.replicate(update.evs)?;
                self.ctrl.btrig();
            }
            other => {
                tracing::warn!(subj = %other, "satellite ignoring unrecognized upstream subject");
            }
        }
        Ok(())
    }
}
