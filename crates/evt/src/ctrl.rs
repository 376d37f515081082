use std::time::{Duration, Instant};

use hub::Msg;
use tokio::sync::mpsc;

use crate::ledger::Ledger;
use crate::model::{Rev, Update};
use crate::subs::Subscribers;

/// Internal subject asking the controller to (re)arm its broadcast throttle.
pub const BTRIG: &str = "_btrig";
/// Internal subject carrying an actual broadcast flush, enqueued by the
/// throttle timer rather than invoked directly from it, so the flush still
/// runs on the controller's own task.
pub const BCAST: &str = "_bcast";
/// Broadcasts occur at most this often under continuous load, and within this
/// bound of the triggering event under light load.
pub const BROADCAST_WINDOW: Duration = Duration::from_millis(200);

/// Builds the `evt.update` push message for a flushed subscriber update.
pub fn update_msg(update: &Update) -> Msg {
    Msg {
        from: None,
        subj: "evt.update".into(),
        tok: String::new(),
        raw: Some(serde_json::to_vec(update).expect("Update always encodes")),
        data: None,
    }
}

/// Owns the ledger and subscription state exclusively; every mutation happens
/// on whichever single task drives [`Ctrl::run`]. Business-logic handlers for
/// `evt.pub`/`evt.sat`/`evt.sub`/`evt.unsub`/`evt.mon`/`evt.unmon` are defined
/// as further methods on this type in `server.rs`.
pub struct Ctrl<L> {
    pub ledger: L,
    pub subs: Subscribers,
    tx: mpsc::Sender<Option<Msg>>,
    btrig_at: Option<Instant>,
    bcast_rev: Option<Rev>,
}

impl<L: Ledger> Ctrl<L> {
    pub fn new(ledger: L, tx: mpsc::Sender<Option<Msg>>) -> Self {
        Ctrl { ledger, subs: Subscribers::new(), tx, btrig_at: None, bcast_rev: None }
    }

    /// A sender into this controller's own input channel, for connections to
    /// forward their messages and for the controller to requeue internal work.
    pub fn sender(&self) -> mpsc::Sender<Option<Msg>> {
        self.tx.clone()
    }

    /// Requests a broadcast soon. If one is already pending within the
    /// throttle window, this is a no-op: the pending timer will pick up
    /// whatever the ledger's revision has advanced to by the time it fires.
    pub fn btrig(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.btrig_at {
            if now.duration_since(last) < BROADCAST_WINDOW {
                return;
            }
        }
        self.btrig_at = Some(now);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BROADCAST_WINDOW).await;
            let _ = tx.send(Some(Msg::new(BCAST))).await;
        });
    }

    /// Flushes every subscriber's pending update for the ledger's current
    /// revision, provided it has advanced since the last flush.
    pub fn bcast(&mut self) {
        let Some(rev) = self.ledger.rev() else { return };
        if self.bcast_rev.is_some_and(|b| rev <= b) {
            return;
        }
        self.bcast_rev = Some(rev);
        for (conn, update) in self.subs.bcast(rev) {
            hub::send(conn.as_ref(), update_msg(&update));
        }
    }

    /// Tears down every topic subscription and monitor belonging to `conn_id`.
    pub fn unsub_all(&mut self, conn_id: i64) {
        self.subs.unsub(conn_id, None);
        self.subs.unmon_all(conn_id);
    }

    /// Drains this controller's input channel on the calling task until it
    /// closes or receives the `None` shutdown sentinel. Every message is
    /// handled inline — service subjects dispatch to their handler and reply,
    /// `_signoff` tears down the originator's subscriptions, `_btrig`/`_bcast`
    /// drive the broadcast throttle, anything else is logged and dropped.
    /// Matches §4.3: the single goroutine that owns the ledger and
    /// subscription state for the lifetime of this server.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Option<Msg>>) {
        while let Some(item) = rx.recv().await {
            let Some(msg) = item else {
                tracing::info!("controller received shutdown sentinel");
                break;
            };
            self.dispatch(msg).await;
        }
    }

    async fn dispatch(&mut self, msg: Msg) {
        match msg.subj.as_str() {
            hub::SIGNOFF => {
                if let Some(from) = &msg.from {
                    self.unsub_all(from.id());
                }
            }
            BTRIG => self.btrig(),
            BCAST => self.bcast(),
            crate::server::PUB => self.serve_pub(msg).await,
            crate::server::SUB => self.serve_sub(msg).await,
            crate::server::SAT => self.serve_sat(msg).await,
            crate::server::UNSUB => self.serve_unsub(msg),
            crate::server::MON => self.serve_mon(msg),
            crate::server::UNMON => self.serve_unmon(msg),
            other => tracing::warn!(subj = %other, "controller has no handler for subject"),
        }
    }
}
