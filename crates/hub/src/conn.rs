use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::msg::Msg;

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Returns a new, process-unique, monotonically increasing connection id.
pub fn next_id() -> i64 {
    LAST_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// A connection abstraction providing an id, a user field, and a channel to send messages.
///
/// Connections can represent connected clients of any kind or the hub itself.
/// The hub has id `0`, normal connections positive ids.
pub trait Conn: Send + Sync {
    /// The connection's cancellation scope. Dropped/cancelled when the connection's
    /// owning transport goes away.
    fn ctx(&self) -> &CancellationToken;
    fn id(&self) -> i64;
    fn user(&self) -> &str;
    /// An unchanging sender half. `None` is sent after a `_signoff` message from
    /// this connection was routed, so a writer task can drain and close.
    fn chan(&self) -> &mpsc::Sender<Option<Msg>>;
}

/// A channel-based connection used for simple in-process hub participants:
/// the reference `ChanConn` used by tests, one-shot requests, and satellites.
pub struct ChanConn {
    ctx: CancellationToken,
    id: i64,
    user: String,
    tx: mpsc::Sender<Option<Msg>>,
}

impl ChanConn {
    pub fn new(
        ctx: CancellationToken,
        id: i64,
        user: impl Into<String>,
        tx: mpsc::Sender<Option<Msg>>,
    ) -> Self {
        ChanConn {
            ctx,
            id,
            user: user.into(),
            tx,
        }
    }
}

impl Conn for ChanConn {
    fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }
    fn id(&self) -> i64 {
        self.id
    }
    fn user(&self) -> &str {
        &self.user
    }
    fn chan(&self) -> &mpsc::Sender<Option<Msg>> {
        &self.tx
    }
}

/// Sends `msg` to a connection that might have signed off and returns whether it was
/// accepted. Never blocks: a full outbound channel is treated as a slow consumer and
/// the delivery is dropped rather than stalling the caller (see `ChannelBacklog` in
/// the error taxonomy).
pub fn send(c: &dyn Conn, msg: Msg) -> bool {
    match c.chan().try_send(Some(msg)) {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!(conn_id = c.id(), "outbound channel backlog, dropping delivery");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_is_monotonic_and_positive() {
        let a = next_id();
        let b = next_id();
        assert!(b > a);
        assert!(a > 0);
    }

    #[tokio::test]
    async fn send_drops_on_full_channel_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ChanConn::new(CancellationToken::new(), 7, "alice", tx);
        assert!(send(&conn, Msg::new("evt.pub")));
        // second send fills the bounded channel past capacity; must not block.
        assert!(!send(&conn, Msg::new("evt.pub")));
        assert!(rx.recv().await.is_some());
    }
}
