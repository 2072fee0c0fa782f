//! Scheduler broker over real TCP: a capsule registers and reports, a gtrace
//! client subscribes and reads.

mod common;

use common::{Recorder, Scheduler, WAIT, eventually};
use gwatch_codec::payload::{KvSubscribe, KvWrite, PingPong, SqlRead};
use gwatch_codec::{CapsuleEnvelope, GtraceEnvelope, GtracePayload};
use serde_json::json;

#[test]
fn capsule_registration_records_topology_and_launches_profiler() {
    let scheduler = Scheduler::start();
    let capsule = scheduler.capsule();
    capsule.connect().unwrap();
    capsule.wait_connected(WAIT).unwrap();

    let sql = &scheduler.broker.stores().sql;
    eventually("mgnt_capsule row", || {
        sql.table("mgnt_capsule").map(|t| t.rows.len() == 1).unwrap_or(false)
    });
    assert!(scheduler.broker.capsule_by_global_id(capsule.global_id()).is_some());
    assert_eq!(sql.table("mgnt_cpu").unwrap().rows.len(), 1);
    assert_eq!(scheduler.launcher.launched(), [scheduler.addr.ip()]);

    capsule.shutdown();
    eventually("capsule disconnect", || {
        let counts = scheduler.broker.session_counts();
        counts.capsules == 0 && counts.disconnected_capsules == 1
    });
    assert!(scheduler.broker.active_ips().is_empty());
    assert!(scheduler.broker.capsule_by_global_id(capsule.global_id()).is_none());
}

#[test]
fn subscriber_sees_capsule_writes() {
    let scheduler = Scheduler::start();
    let (gtrace, _stop) = Recorder::connect(&scheduler);
    gtrace.send(GtraceEnvelope::new("sub-1", KvSubscribe::new("/jobs/")));
    eventually("subscribe reply", || !gtrace.with_ref("sub-1").is_empty());

    let capsule = scheduler.capsule();
    capsule.connect().unwrap();
    capsule.wait_connected(WAIT).unwrap();
    capsule
        .send_to_scheduler(&CapsuleEnvelope::new(
            "w",
            KvWrite {
                uri: "/jobs/7".into(),
                write_payload: json!({"state": "done"}),
            },
        ))
        .unwrap();

    eventually("kv stream", || gtrace.with_ref("sub-1").len() >= 2);
    let stream = gtrace.with_ref("sub-1").pop().unwrap();
    match stream.payload {
        GtracePayload::KvStream(stream) => {
            assert_eq!(stream.uri, "/jobs/7");
            assert_eq!(stream.read_payload, json!({"state": "done"}));
        }
        other => panic!("expected KvStream, got {other:?}"),
    }
}

#[test]
fn ping_and_sql_reads_are_answered() {
    let scheduler = Scheduler::start();
    let (gtrace, _stop) = Recorder::connect(&scheduler);
    gtrace.send(GtraceEnvelope::new("p", PingPong {}));
    gtrace.send(GtraceEnvelope::new(
        "q",
        SqlRead {
            query: "SELECT name FROM sqlite_master WHERE name = 'mgnt_gpu'".into(),
            ..SqlRead::default()
        },
    ));
    eventually("replies", || {
        !gtrace.with_ref("p").is_empty() && !gtrace.with_ref("q").is_empty()
    });
    match &gtrace.with_ref("q")[0].payload {
        GtracePayload::SqlRead(read) => {
            assert!(read.success);
            assert_eq!(read.query_result.rows, [vec!["mgnt_gpu".to_string()]]);
        }
        other => panic!("expected SqlRead, got {other:?}"),
    }
}

#[test]
fn disconnect_releases_subscriptions() {
    let scheduler = Scheduler::start();
    let (gtrace, stop) = Recorder::connect(&scheduler);
    gtrace.send(GtraceEnvelope::new("s", KvSubscribe::new("/x")));
    eventually("subscribe reply", || !gtrace.with_ref("s").is_empty());
    assert_eq!(scheduler.broker.session_counts().gtraces, 1);
    let conn_id = gtrace.conn.lock().as_ref().unwrap().id();

    stop.send(true).unwrap();
    eventually("gtrace released", || scheduler.broker.session_counts().gtraces == 0);
    assert_eq!(scheduler.broker.stores().kv.release(conn_id), 0);
    scheduler.broker.stores().kv.insert("/x/1", json!(1)).unwrap();
}
