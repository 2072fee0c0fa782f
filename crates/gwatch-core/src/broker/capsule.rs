//! Capsule channel handlers.

use super::{Broker, reply, topology};
use crate::Result;
use crate::connection::ConnectionInstance;
use crate::store::TsSample;
use gwatch_codec::capsule::CapsuleRegister;
use gwatch_codec::payload::{SqlCreateTable, SqlDropTable};
use gwatch_codec::{CapsuleEnvelope, CapsulePayload};
use std::sync::Arc;

pub(crate) fn route(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &CapsuleEnvelope,
) -> Result<()> {
    let stores = broker.stores();
    match &envelope.payload {
        CapsulePayload::PingPong(ping) => reply(conn, envelope, ping.clone()),
        CapsulePayload::Heartbeat(_) => {
            tracing::trace!(conn_id = conn.id(), "capsule heartbeat");
            Ok(())
        }
        CapsulePayload::KvWrite(write) => stores.kv.insert(&write.uri, write.write_payload.clone()),
        CapsulePayload::TsWrite(write) => stores.ts.append(
            &write.uri,
            TsSample {
                index: write.index,
                timestamp: write.timestamp,
                end_timestamp: write.end_timestamp,
                payload: write.payload.clone(),
            },
        ),
        CapsulePayload::SqlWrite(write) => {
            stores.sql.insert_row(&write.table_name, &write.insert_data)
        }
        CapsulePayload::SqlCreateTable(create) => {
            let result = stores.sql.create_table(&create.table_name, &create.schema);
            reply(
                conn,
                envelope,
                SqlCreateTable {
                    success: result.is_ok(),
                    ..create.clone()
                },
            )?;
            result
        }
        CapsulePayload::SqlDropTable(request) => {
            let result = stores.sql.drop_table(&request.table_name);
            reply(
                conn,
                envelope,
                SqlDropTable {
                    success: result.is_ok(),
                    ..request.clone()
                },
            )?;
            result
        }
        CapsulePayload::CapsuleRegister(register) => on_register(broker, conn, register),
    }
}

/// The capsule's answer to the REGISTER request sent on connect.
fn on_register(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    register: &CapsuleRegister,
) -> Result<()> {
    if !register.success {
        tracing::warn!(conn_id = conn.id(), "capsule reported a failed registration");
        return Ok(());
    }
    let global_id = &register.capsule_info.global_id;
    if broker.capsule_by_global_id(global_id).is_some() {
        tracing::warn!(capsule = %global_id, "capsule registered twice");
    }
    broker.index_capsule(global_id, conn);
    topology::record(&broker.stores().sql, register)
}

#[cfg(test)]
mod tests {
    use crate::broker::Broker;
    use crate::broker::testing::broker;
    use crate::connection::{ConnectionInstance, Role};
    use crate::connection::testing::{connected, sent};
    use crate::transport::ConnectionEvents;
    use gwatch_codec::capsule::{CapsuleInfo, CapsuleRegister};
    use gwatch_codec::payload::{KvWrite, SqlCreateTable, SqlWrite, TsWrite};
    use gwatch_codec::CapsuleEnvelope;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn send(broker: &Broker, conn: &Arc<ConnectionInstance>, envelope: CapsuleEnvelope) {
        broker.on_message(conn, envelope.encode().unwrap().into_bytes());
    }

    #[test]
    fn register_reply_indexes_capsule_and_records_rows() {
        let (broker, _) = broker();
        let conn = connected(Role::Capsule);
        broker.on_connect(&conn);
        let request: Value = serde_json::from_str(&sent(&conn)[0]).unwrap();
        let ref_id = request["ref_id"].as_str().unwrap().to_string();

        let failed = CapsuleRegister::default();
        send(&broker, &conn, CapsuleEnvelope::new(ref_id.clone(), failed));
        assert!(broker.stores().sql.table("mgnt_capsule").unwrap().is_empty());

        let register = CapsuleRegister {
            success: true,
            capsule_info: CapsuleInfo {
                global_id: "capsule-a".into(),
                cpu_global_id: "cpu-a".into(),
                ..CapsuleInfo::default()
            },
            ..CapsuleRegister::default()
        };
        send(&broker, &conn, CapsuleEnvelope::new(ref_id, register));
        assert_eq!(broker.stores().sql.table("mgnt_capsule").unwrap().rows.len(), 1);
        assert_eq!(broker.capsule_by_global_id("capsule-a").unwrap().id(), conn.id());
    }

    #[test]
    fn writes_land_in_stores() {
        let (broker, _) = broker();
        let conn = connected(Role::Capsule);
        broker.on_connect(&conn);
        sent(&conn);

        let write = KvWrite {
            uri: "/k".into(),
            write_payload: json!(7),
        };
        send(&broker, &conn, CapsuleEnvelope::new("1", write));
        send(
            &broker,
            &conn,
            CapsuleEnvelope::new(
                "2",
                TsWrite {
                    uri: "/capsule/c/cpuevent".into(),
                    index: 4,
                    timestamp: 10,
                    end_timestamp: 20,
                    payload: json!({"name": "step"}),
                },
            ),
        );
        send(
            &broker,
            &conn,
            CapsuleEnvelope::new(
                "3",
                SqlCreateTable {
                    table_name: "results".into(),
                    schema: "(name TEXT)".into(),
                    success: false,
                },
            ),
        );
        let mut insert_data = std::collections::BTreeMap::new();
        insert_data.insert("name".to_string(), json!("run-1"));
        let write = SqlWrite {
            table_name: "results".into(),
            insert_data,
        };
        send(&broker, &conn, CapsuleEnvelope::new("4", write));

        assert_eq!(broker.stores().kv.query("/k"), json!(7));
        let samples = broker.stores().ts.query("/capsule/c/cpuevent").unwrap();
        assert_eq!((samples[0].index, samples[0].end_timestamp), (4, 20));
        assert_eq!(broker.stores().sql.table("results").unwrap().rows, [vec!["run-1".to_string()]]);

        let replies = sent(&conn);
        assert_eq!(replies.len(), 1);
        let create: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(create["ref_id"], "3");
        assert_eq!(create["payload"]["success"], true);
    }
}
