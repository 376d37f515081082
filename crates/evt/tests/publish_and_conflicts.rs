//! End-to-end publish scenarios, driven through the real controller dispatch
//! loop and wire-level JSON framing rather than calling `handle_*` directly.

use std::sync::Arc;
use std::time::Duration;

use evt::{Ctrl, KeyKind, MemLedger, ModelSchema, Project};
use hub::{ChanConn, Conn, Msg};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn spawn_ctrl() -> mpsc::Sender<Option<Msg>> {
    let project = Project::new(vec![ModelSchema::new("prod.cat", "id", KeyKind::Int)]);
    let (tx, rx) = mpsc::channel(32);
    let ctrl = Ctrl::new(MemLedger::new(project), tx.clone());
    tokio::spawn(ctrl.run(rx));
    tx
}

fn client(id: i64, user: &str) -> (Arc<dyn Conn>, mpsc::Receiver<Option<Msg>>) {
    let (out_tx, out_rx) = mpsc::channel(16);
    (Arc::new(ChanConn::new(CancellationToken::new(), id, user, out_tx)), out_rx)
}

fn pub_msg(from: &Arc<dyn Conn>, key: &str, name: &str) -> Msg {
    let body = json!({
        "acts": [{"top": "prod.cat", "key": key, "cmd": "new", "arg": {"name": name}}]
    });
    Msg {
        from: Some(from.clone()),
        subj: "evt.pub".into(),
        tok: String::new(),
        raw: Some(serde_json::to_vec(&body).unwrap()),
        data: None,
    }
}

async fn recv_reply(rx: &mut mpsc::Receiver<Option<Msg>>) -> Msg {
    tokio::time::timeout(Duration::from_millis(250), rx.recv())
        .await
        .expect("reply within timeout")
        .expect("channel open")
        .expect("not a shutdown sentinel")
}

#[tokio::test]
async fn scenario_a_first_publish_assigns_rev_and_id_one() {
    let ctrl_tx = spawn_ctrl();
    let (alice, mut alice_rx) = client(1, "alice");

    ctrl_tx.send(Some(pub_msg(&alice, "1", "a"))).await.unwrap();

    let reply = recv_reply(&mut alice_rx).await;
    let update: evt::Update = reply.parse_reply().unwrap();
    assert!(update.rev.is_some());
    assert_eq!(update.evs.len(), 1);
    assert_eq!(update.evs[0].id, 1);
    assert_eq!(update.evs[0].action.sig.key, "1");
}

#[tokio::test]
async fn scenario_b_conflict_free_sequence_gets_distinct_ordered_revisions() {
    let ctrl_tx = spawn_ctrl();
    let (alice, mut alice_rx) = client(1, "alice");

    ctrl_tx.send(Some(pub_msg(&alice, "1", "a"))).await.unwrap();
    let first: evt::Update = recv_reply(&mut alice_rx).await.parse_reply().unwrap();

    ctrl_tx.send(Some(pub_msg(&alice, "2", "b"))).await.unwrap();
    let second: evt::Update = recv_reply(&mut alice_rx).await.parse_reply().unwrap();

    assert_eq!(second.evs[0].id, 2);
    assert!(second.rev.unwrap() > first.rev.unwrap());
}

#[tokio::test]
async fn scenario_e_unknown_topic_is_rejected_without_committing() {
    let ctrl_tx = spawn_ctrl();
    let (alice, mut alice_rx) = client(1, "alice");

    let body = json!({
        "acts": [{"top": "does.not.exist", "key": "1", "cmd": "new", "arg": {}}]
    });
    let msg = Msg {
        from: Some(alice.clone()),
        subj: "evt.pub".into(),
        tok: String::new(),
        raw: Some(serde_json::to_vec(&body).unwrap()),
        data: None,
    };
    ctrl_tx.send(Some(msg)).await.unwrap();

    let reply = recv_reply(&mut alice_rx).await;
    let err = reply.parse_reply::<evt::Update>().unwrap_err();
    assert!(err.to_string().contains("unknown topic"));
}
