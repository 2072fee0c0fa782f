//! Profiler channel handlers.

use super::{Broker, reply};
use crate::Result;
use crate::connection::ConnectionInstance;
use gwatch_codec::{ProfilerEnvelope, ProfilerPayload};
use std::sync::Arc;

/// KV uri holding the last metric results of a device.
#[must_use]
pub fn metrics_uri(device_id: i32) -> String {
    format!("/profiler/{device_id}/metrics")
}

pub(crate) fn route(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &ProfilerEnvelope,
) -> Result<()> {
    match &envelope.payload {
        ProfilerPayload::PingPong(ping) => reply(conn, envelope, ping.clone()),
        ProfilerPayload::Heartbeat(_) => Ok(()),
        ProfilerPayload::ProfilerSetMetrics(set) => {
            tracing::debug!(
                conn_id = conn.id(),
                sign = set.sign,
                metrics = set.metric_names.len(),
                success = set.success,
                "profiler set-metrics reply"
            );
            Ok(())
        }
        ProfilerPayload::ProfilerBegin(begin) => {
            tracing::debug!(
                conn_id = conn.id(),
                device_id = begin.device_id,
                success = begin.success,
                "profiler begin reply"
            );
            Ok(())
        }
        ProfilerPayload::ProfilerEnd(end) => {
            if !end.success {
                tracing::warn!(
                    conn_id = conn.id(),
                    device_id = end.device_id,
                    "profiling session failed"
                );
                return Ok(());
            }
            let results = serde_json::to_value(&end.map_metric_results)?;
            broker.stores().kv.insert(&metrics_uri(end.device_id), results)
        }
    }
}
