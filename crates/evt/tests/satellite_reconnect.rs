//! End-to-end satellite reconnect scenario: two locally published
//! transactions accumulate while offline, `evt.sat` replays them on
//! reconnect, and the satellite's ledger catches up to the server's revision.

use std::collections::HashSet;
use std::sync::Arc;

use evt::{
    Action, Audit, Cmd, Delta, Event, KeyKind, Ledger, LocalPublisher, MemLedger, ModelSchema,
    Project, Sig, State, Trans, Update,
};
use evt::Satellite;
use hub::{ChanConn, Conn, Msg};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn conn(id: i64, user: &str) -> (Arc<dyn Conn>, mpsc::Receiver<Option<Msg>>) {
    let (tx, rx) = mpsc::channel(16);
    (Arc::new(ChanConn::new(CancellationToken::new(), id, user, tx)), rx)
}

fn new_trans(key: &str, name: &str) -> Trans {
    let mut arg = Delta::new();
    arg.0.insert("name".into(), json!(name));
    Trans {
        id: 0,
        base: None,
        audit: Audit::default(),
        acts: vec![Action { sig: Sig::new("prod.cat", key), cmd: Cmd::New, arg }],
    }
}

fn pub_msg(trans: &Trans) -> Msg {
    let mut m = Msg::new(evt::server::PUB);
    m.raw = Some(serde_json::to_vec(trans).unwrap());
    m
}

#[tokio::test]
async fn scenario_f_offline_transactions_replay_and_rev_catches_up_on_reconnect() {
    let project = Project::new(vec![ModelSchema::new("prod.cat", "id", KeyKind::Int)]);
    let (tx, _rx) = mpsc::channel(16);
    let (upstream, mut upstream_rx) = conn(0, "upstream");

    let mut local_topics = HashSet::new();
    local_topics.insert("prod.cat".to_string());
    let mut sat = Satellite::new(MemLedger::new(project), tx, upstream, local_topics);

    let (alice, _alice_rx) = conn(1, "alice");
    sat.handle_local_pub(alice.clone(), pub_msg(&new_trans("1", "a"))).await.unwrap();
    sat.handle_local_pub(alice, pub_msg(&new_trans("2", "b"))).await.unwrap();
    assert_eq!(sat.ctrl.ledger.locals().len(), 2);
    let local_rev_before = sat.ctrl.ledger.rev();

    sat.on_remote_signon();
    assert_eq!(sat.state(), State::Connecting);

    let sat_req_msg = upstream_rx.recv().await.unwrap().unwrap();
    assert_eq!(sat_req_msg.subj, evt::server::SAT);
    let sat_req: evt::server::SatReq = sat_req_msg.unmarshal().unwrap();
    assert_eq!(sat_req.trans.len(), 2);
    assert_eq!(sat_req.rev, local_rev_before);
    assert_eq!(sat_req.topics, vec!["prod.cat".to_string()]);

    // Server assigns fresh revisions well past anything the satellite has seen.
    let server_rev = chrono::Utc::now() + chrono::Duration::seconds(120);
    let events = vec![
        Event { id: 201, rev: server_rev, action: sat_req.trans[0].acts[0].clone() },
        Event { id: 202, rev: server_rev, action: sat_req.trans[1].acts[0].clone() },
    ];
    let update = Update { rev: Some(server_rev), evs: events, note: Vec::new() };
    let mut reply = Msg::new(evt::server::SAT);
    reply.tok = sat_req_msg.tok.clone();
    reply.raw = Some(serde_json::to_vec(&json!({ "res": update })).unwrap());

    sat.handle_upstream(reply).unwrap();

    assert_eq!(sat.state(), State::Online);
    assert_eq!(sat.ctrl.ledger.rev(), Some(server_rev));
    assert!(sat.ctrl.ledger.locals().is_empty());
}
