use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::conn::Conn;
use crate::filter::Routers;
use crate::msg::Msg;

/// Sent by a connection's owning task the moment it joins the hub, carrying no body.
/// The connection registers itself by virtue of `msg.from` being set.
pub const SIGNON: &str = "_signon";
/// Sent when a connection's owning task is about to exit, so the hub can drop it
/// from its registry and let any other participant holding a reference find out.
pub const SIGNOFF: &str = "_signoff";

/// A handle callers use to submit messages into a running hub.
///
/// The hub's registry of connections is never exposed outside [`run`]: it is a
/// plain local `HashMap`, not a struct field, so there is nothing to lock — every
/// read and write happens on the single task driving the loop.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<Option<Msg>>,
}

impl Hub {
    /// Creates a hub's inbound channel. Callers get a [`Hub`] handle to submit
    /// messages and a receiver to drive with [`run`].
    pub fn channel(buffer: usize) -> (Hub, mpsc::Receiver<Option<Msg>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Hub { tx }, rx)
    }

    pub fn sender(&self) -> mpsc::Sender<Option<Msg>> {
        self.tx.clone()
    }

    /// Submits `msg` for routing. Returns whether it was accepted; a full inbound
    /// channel is a backlog, not a reason to block the caller (see `send`).
    pub fn submit(&self, msg: Msg) -> bool {
        self.tx.try_send(Some(msg)).is_ok()
    }

    /// Tells a running [`run`] loop to stop after draining what's already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(None).await;
    }
}

/// Drives a hub's inbound channel to completion: registers/deregisters connections
/// on `_signon`/`_signoff`, tries the router chain, logging and dropping anything
/// nobody claims.
///
/// Runs entirely on the calling task; the connection registry it builds up is a
/// plain local variable that nothing outside this function ever touches.
pub async fn run(mut rx: mpsc::Receiver<Option<Msg>>, routers: Routers) {
    let mut conns: HashMap<i64, Arc<dyn Conn>> = HashMap::new();

    while let Some(item) = rx.recv().await {
        let Some(msg) = item else {
            tracing::info!("hub received shutdown sentinel");
            break;
        };

        match msg.subj.as_str() {
            SIGNON => {
                if let Some(conn) = &msg.from {
                    tracing::debug!(conn_id = conn.id(), user = conn.user(), "connection signed on");
                    conns.insert(conn.id(), conn.clone());
                }
                continue;
            }
            SIGNOFF => {
                if let Some(conn) = &msg.from {
                    tracing::debug!(conn_id = conn.id(), "connection signed off");
                    if let Some(c) = conns.remove(&conn.id()) {
                        let _ = c.chan().try_send(None);
                    }
                }
                continue;
            }
            _ => {}
        }

        if msg.is_private() {
            if let Some(from) = &msg.from {
                if from.id() > 0 {
                    tracing::warn!(conn_id = from.id(), subj = %msg.subj, "rejected private subject from remote connection");
                    crate::conn::send(from.as_ref(), msg.reply_err("private subject from remote connection"));
                    continue;
                }
            }
        }

        if routers.route(msg.from.as_deref().unwrap_or(&NullConn), &msg) {
            continue;
        }

        tracing::warn!(subj = %msg.subj, "no router claimed message");
        if let Some(from) = &msg.from {
            crate::conn::send(from.as_ref(), msg.reply_err("unknown subject"));
        }
    }
}

/// Stand-in origin for server-internal messages with no real connection behind them.
struct NullConn;

impl Conn for NullConn {
    fn ctx(&self) -> &tokio_util::sync::CancellationToken {
        static TOKEN: std::sync::OnceLock<tokio_util::sync::CancellationToken> = std::sync::OnceLock::new();
        TOKEN.get_or_init(tokio_util::sync::CancellationToken::new)
    }
    fn id(&self) -> i64 {
        0
    }
    fn user(&self) -> &str {
        "hub"
    }
    fn chan(&self) -> &mpsc::Sender<Option<Msg>> {
        static CHAN: std::sync::OnceLock<mpsc::Sender<Option<Msg>>> = std::sync::OnceLock::new();
        CHAN.get_or_init(|| mpsc::channel(1).0)
    }
}

/// Delivers `build(id)` to every registered connection matching `filter`, skipping
/// connections the filter rejects. Used for subscription fanout in `evt`.
pub fn fanout(
    conns: &HashMap<i64, Arc<dyn Conn>>,
    mut filter: impl FnMut(i64, &dyn Conn) -> bool,
    mut build: impl FnMut(i64, &dyn Conn) -> Msg,
) {
    for (id, conn) in conns {
        if filter(*id, conn.as_ref()) {
            crate::conn::send(conn.as_ref(), build(*id, conn.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ChanConn;
    use crate::filter::RouterFunc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn signon_then_message_reaches_router_and_replies_to_sender() {
        let (hub, rx) = Hub::channel(8);
        let mut routers = Routers::new();
        routers.add(Box::new(RouterFunc(|from: &dyn Conn, msg: &Msg| {
            if msg.subj != "echo" {
                return false;
            }
            let req: String = msg.unmarshal().unwrap();
            crate::conn::send(from, msg.reply_res(&req).unwrap());
            true
        })));
        let run_task = tokio::spawn(run(rx, routers));

        let (out_tx, mut out_rx) = mpsc::channel(4);
        let conn: Arc<dyn Conn> =
            Arc::new(ChanConn::new(CancellationToken::new(), 1, "alice", out_tx));

        let mut signon = Msg::new(SIGNON);
        signon.from = Some(conn.clone());
        hub.submit(signon);

        let mut echo = Msg::new("echo");
        echo.from = Some(conn.clone());
        echo.raw = Some(br#""hi""#.to_vec());
        hub.submit(echo);

        let reply = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(reply.raw.as_deref(), Some(&br#""hi""#[..]));

        hub.shutdown().await;
        run_task.await.unwrap();
    }

    #[tokio::test]
    async fn private_subject_from_remote_connection_is_rejected() {
        let (hub, rx) = Hub::channel(8);
        let run_task = tokio::spawn(run(rx, Routers::new()));

        let (out_tx, mut out_rx) = mpsc::channel(4);
        let conn: Arc<dyn Conn> =
            Arc::new(ChanConn::new(CancellationToken::new(), 1, "alice", out_tx));

        let mut msg = Msg::new("_internal");
        msg.from = Some(conn);
        hub.submit(msg);

        let reply = out_rx.recv().await.unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&reply.raw.unwrap()).unwrap();
        assert!(v.get("err").is_some());

        hub.shutdown().await;
        run_task.await.unwrap();
    }

    #[tokio::test]
    async fn signoff_removes_connection_and_closes_its_channel() {
        let (hub, rx) = Hub::channel(8);
        let run_task = tokio::spawn(run(rx, Routers::new()));

        let (out_tx, mut out_rx) = mpsc::channel(4);
        let conn: Arc<dyn Conn> =
            Arc::new(ChanConn::new(CancellationToken::new(), 2, "bob", out_tx));

        let mut signon = Msg::new(SIGNON);
        signon.from = Some(conn.clone());
        hub.submit(signon);

        let mut signoff = Msg::new(SIGNOFF);
        signoff.from = Some(conn);
        hub.submit(signoff);

        assert!(out_rx.recv().await.unwrap().is_none());

        hub.shutdown().await;
        run_task.await.unwrap();
    }
}
