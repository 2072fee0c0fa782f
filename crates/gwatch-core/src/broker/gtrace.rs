//! gTrace channel handlers: reads, subscriptions and the agent lifecycle.
//!
//! Every subscribe request is answered with the subscribe payload itself,
//! `success` filled in. The current state is pushed as stream messages
//! before that reply, and later writes follow as further stream messages
//! carrying the subscription's `ref_id`.

use super::{Broker, reply};
use crate::connection::ConnectionInstance;
use crate::store::{SubscriptionContext, TsSample};
use crate::{Error, Result};
use gwatch_codec::gtrace::{
    AgentCreateContent, AgentCreateContext, AgentCreateTask, AgentDestroyContext, AgentDestroyTask,
    AgentStream,
};
use gwatch_codec::payload::{
    KvRead, KvStream, KvSubscribe, KvUnsubscribe, SqlQueryResult, SqlRead, SqlStream, SqlSubscribe,
    SqlUnsubscribe, TsRead, TsStream, TsSubscribe, TsUnsubscribe,
};
use gwatch_codec::{GtraceEnvelope, GtracePayload};
use serde_json::Value;
use std::sync::Arc;

pub(crate) fn route(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &GtraceEnvelope,
) -> Result<()> {
    let stores = broker.stores();
    match &envelope.payload {
        GtracePayload::PingPong(ping) => reply(conn, envelope, ping.clone()),
        GtracePayload::Heartbeat(_) => Ok(()),
        GtracePayload::KvWrite(write) => stores.kv.insert(&write.uri, write.write_payload.clone()),
        GtracePayload::KvRead(read) => reply(
            conn,
            envelope,
            KvRead {
                uri: read.uri.clone(),
                read_payload: stores.kv.query(&read.uri),
                success: true,
            },
        ),
        GtracePayload::TsRead(read) => {
            let samples = stores.ts.query(&read.uri);
            let success = samples.is_ok();
            let read_payload = match samples {
                Ok(samples) => serde_json::to_value(samples)?,
                Err(_) => Value::Array(Vec::new()),
            };
            reply(
                conn,
                envelope,
                TsRead {
                    uri: read.uri.clone(),
                    read_payload,
                    success,
                    ..TsRead::default()
                },
            )
        }
        GtracePayload::SqlRead(read) => {
            let result = stores.sql.query(&read.query);
            let success = result.is_ok();
            reply(
                conn,
                envelope,
                SqlRead {
                    query: read.query.clone(),
                    query_result: result.as_ref().cloned().unwrap_or_default(),
                    success,
                },
            )?;
            result.map(drop)
        }
        GtracePayload::KvSubscribe(request) => {
            let result = subscribe_kv(broker, conn, envelope, &request.uri);
            reply(
                conn,
                envelope,
                KvSubscribe {
                    uri: request.uri.clone(),
                    success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::TsSubscribe(request) => {
            let result = subscribe_ts(broker, conn, envelope, &request.uri);
            reply(
                conn,
                envelope,
                TsSubscribe {
                    uri: request.uri.clone(),
                    success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::SqlSubscribe(request) => {
            let result = subscribe_sql(broker, conn, envelope, &request.uri);
            reply(
                conn,
                envelope,
                SqlSubscribe {
                    uri: request.uri.clone(),
                    success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::KvUnsubscribe(request) => {
            let result = stores.kv.unsubscribe(conn.id(), &envelope.ref_id, &request.uri);
            reply(
                conn,
                envelope,
                KvUnsubscribe {
                    uri: request.uri.clone(),
                    success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::TsUnsubscribe(request) => {
            let result = stores.ts.unsubscribe(conn.id(), &envelope.ref_id, &request.uri);
            reply(
                conn,
                envelope,
                TsUnsubscribe {
                    uri: request.uri.clone(),
                    success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::SqlUnsubscribe(request) => {
            let result = stores.sql.unsubscribe(conn.id(), &envelope.ref_id, &request.uri);
            reply(
                conn,
                envelope,
                SqlUnsubscribe {
                    uri: request.uri.clone(),
                    success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::AgentCreateContext(request) => {
            let context_global_id = broker.agents().create_context(request.user_config.clone());
            reply(
                conn,
                envelope,
                AgentCreateContext {
                    context_global_id,
                    user_config: request.user_config.clone(),
                    is_success: true,
                },
            )
        }
        GtracePayload::AgentDestroyContext(request) => {
            let result = broker.agents().destroy_context(&request.context_global_id);
            reply(
                conn,
                envelope,
                AgentDestroyContext {
                    context_global_id: request.context_global_id.clone(),
                    is_success: result.is_ok(),
                },
            )?;
            result
        }
        GtracePayload::AgentCreateTask(request) => {
            let result = broker
                .agents()
                .create_task(&request.context_global_id, &request.list_parent_task_global_idx);
            reply(
                conn,
                envelope,
                AgentCreateTask {
                    task_global_id: result.as_ref().cloned().unwrap_or_default(),
                    is_success: result.is_ok(),
                    ..request.clone()
                },
            )?;
            result.map(drop)
        }
        GtracePayload::AgentDestroyTask(request) => {
            let result = broker
                .agents()
                .destroy_task(&request.context_global_id, &request.task_global_id);
            reply(
                conn,
                envelope,
                AgentDestroyTask {
                    is_success: result.is_ok(),
                    ..request.clone()
                },
            )?;
            result
        }
        GtracePayload::AgentCreateContent(request) => {
            create_content(broker, conn, envelope, request)
        }
        GtracePayload::KvStream(_)
        | GtracePayload::TsStream(_)
        | GtracePayload::SqlStream(_)
        | GtracePayload::AgentStream(_) => Err(Error::invalid_input(format!(
            "{} is only sent by the scheduler",
            envelope.payload_name()
        ))),
    }
}

fn push<P: Into<GtracePayload>>(ctx: &SubscriptionContext, payload: P) -> Result<()> {
    ctx.conn.send_envelope(&GtraceEnvelope::new(ctx.sub_id.clone(), payload))
}

fn kv_stream(ctx: &SubscriptionContext, value: &Value) -> Result<()> {
    push(
        ctx,
        KvStream {
            uri: ctx.uri.clone(),
            read_payload: value.clone(),
            success: true,
        },
    )
}

fn ts_stream(ctx: &SubscriptionContext, sample: &TsSample) -> Result<()> {
    push(
        ctx,
        TsStream {
            uri: ctx.uri.clone(),
            index: sample.index,
            timestamp: sample.timestamp,
            read_payload: sample.payload.clone(),
            success: true,
        },
    )
}

fn sql_stream(ctx: &SubscriptionContext, result: &SqlQueryResult) -> Result<()> {
    push(
        ctx,
        SqlStream {
            query: ctx.uri.clone(),
            query_result: result.clone(),
            success: true,
        },
    )
}

fn context(
    conn: &Arc<ConnectionInstance>,
    envelope: &GtraceEnvelope,
    uri: &str,
) -> SubscriptionContext {
    SubscriptionContext::new(Arc::clone(conn), envelope.ref_id.clone(), uri)
}

fn subscribe_kv(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &GtraceEnvelope,
    uri: &str,
) -> Result<()> {
    broker.stores().kv.subscribe(
        context(conn, envelope, uri),
        |ctx: &SubscriptionContext, new: &Value, _old: Option<&Value>| kv_stream(ctx, new),
        |ctx, current| match current {
            Value::String(text) if text.is_empty() => Ok(()),
            current => kv_stream(ctx, current),
        },
    )
}

fn subscribe_ts(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &GtraceEnvelope,
    uri: &str,
) -> Result<()> {
    broker.stores().ts.subscribe(
        context(conn, envelope, uri),
        |ctx: &SubscriptionContext, sample: &TsSample, _old: Option<&TsSample>| {
            ts_stream(ctx, sample)
        },
        |ctx, history| history.iter().try_for_each(|sample| ts_stream(ctx, sample)),
    )
}

fn subscribe_sql(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &GtraceEnvelope,
    uri: &str,
) -> Result<()> {
    broker.stores().sql.subscribe(
        context(conn, envelope, uri),
        |ctx: &SubscriptionContext, table: &SqlQueryResult, _old: Option<&SqlQueryResult>| {
            sql_stream(ctx, table)
        },
        |ctx, table| {
            if table.is_empty() {
                Ok(())
            } else {
                sql_stream(ctx, table)
            }
        },
    )
}

/// Record the content. Executing a prompt needs a model service, so a
/// `do_execute` request is closed right away with an unsuccessful final
/// stream message.
fn create_content(
    broker: &Broker,
    conn: &Arc<ConnectionInstance>,
    envelope: &GtraceEnvelope,
    request: &AgentCreateContent,
) -> Result<()> {
    let result = broker.agents().create_content(
        &request.context_global_id,
        &request.task_global_id,
        request.content_typeid,
        &request.body,
        &request.list_github_bodies,
    );
    let content_global_id = result.as_ref().cloned().unwrap_or_default();
    reply(
        conn,
        envelope,
        AgentCreateContent {
            content_global_id: content_global_id.clone(),
            is_success: result.is_ok(),
            ..request.clone()
        },
    )?;
    result?;
    if request.do_execute {
        tracing::info!(content = %content_global_id, "prompt execution is not available");
        reply(
            conn,
            envelope,
            AgentStream {
                content_global_id,
                is_success: false,
                is_end: true,
                ..AgentStream::default()
            },
        )?;
    }
    Ok(())
}
