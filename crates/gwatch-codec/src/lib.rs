//! Encode and decode the messages of the gwatch protocol.
//!
//! Two layers live here:
//!
//! - [`frame`]: chunked framing. A logical message is split into chunks of at
//!   most [`frame::CHUNK_SIZE`] bytes, each tagged with its position in the
//!   message and a leb128 length.
//! - Envelopes: the text form of one logical message,
//!   `{"type_id": <u32>, "ref_id": "<string>", "payload": {...}}`.
//!
//! Each connection role speaks its own channel, and each channel has a
//! closed registry of payload kinds declared with `channel!`. The registry
//! maps a numeric `type_id` to exactly one payload struct, so an unknown
//! `type_id` is a decode error rather than an unrepresentable state.
//!
//! `type_id` namespaces: 10-19 utility, 20-29 KV, 30-39 time-series,
//! 40-49 SQL, 100+ channel-specific.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("type_id {type_id} is not registered on the {channel} channel")]
    UnknownTypeId { channel: &'static str, type_id: u32 },

    #[error("payload is {actual}, expected {expected}")]
    PayloadMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown frame flags {0:#04x}")]
    BadFlags(u8),

    #[error("leb128: {0}")]
    Leb128(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A closed set of payload kinds for one channel.
pub trait ChannelPayload: Sized + Clone {
    /// Channel label used in logs and metrics.
    const CHANNEL: &'static str;

    fn type_id(&self) -> u32;

    fn payload_name(&self) -> &'static str;

    fn to_value(&self) -> Result<Value, CodecError>;

    /// Resolve `type_id` against the registry and parse the payload body.
    fn from_value(type_id: u32, value: Value) -> Result<Self, CodecError>;

    /// Every registered `type_id`, in declaration order.
    fn type_ids() -> &'static [u32];
}

/// A concrete payload struct registered on channel `P`.
pub trait PayloadKind<P>: Sized {
    const TYPE_ID: u32;
    const NAME: &'static str;

    fn from_payload(payload: &P) -> Option<&Self>;

    fn from_payload_mut(payload: &mut P) -> Option<&mut Self>;

    fn into_payload(self) -> P;
}

/// Declares a channel registry: a closed enum with one variant per payload
/// struct, each bound to its channel-scoped `type_id`.
macro_rules! channel {
    (
        $(#[$meta:meta])*
        $channel:ident = $label:literal {
            $($name:ident: $type_id:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $channel {
            $($name($name),)*
        }

        impl $crate::ChannelPayload for $channel {
            const CHANNEL: &'static str = $label;

            fn type_id(&self) -> u32 {
                match self {
                    $(Self::$name(_) => $type_id,)*
                }
            }

            fn payload_name(&self) -> &'static str {
                match self {
                    $(Self::$name(_) => stringify!($name),)*
                }
            }

            fn to_value(&self) -> Result<serde_json::Value, $crate::CodecError> {
                match self {
                    $(Self::$name(p) => serde_json::to_value(p).map_err(Into::into),)*
                }
            }

            fn from_value(
                type_id: u32,
                value: serde_json::Value,
            ) -> Result<Self, $crate::CodecError> {
                match type_id {
                    $($type_id => Ok(Self::$name(serde_json::from_value(value)?)),)*
                    _ => Err($crate::CodecError::UnknownTypeId {
                        channel: $label,
                        type_id,
                    }),
                }
            }

            fn type_ids() -> &'static [u32] {
                &[$($type_id),*]
            }
        }

        $(
            impl $crate::PayloadKind<$channel> for $name {
                const TYPE_ID: u32 = $type_id;
                const NAME: &'static str = stringify!($name);

                fn from_payload(payload: &$channel) -> Option<&Self> {
                    match payload {
                        $channel::$name(p) => Some(p),
                        _ => None,
                    }
                }

                fn from_payload_mut(payload: &mut $channel) -> Option<&mut Self> {
                    match payload {
                        $channel::$name(p) => Some(p),
                        _ => None,
                    }
                }

                fn into_payload(self) -> $channel {
                    $channel::$name(self)
                }
            }

            impl From<$name> for $channel {
                fn from(p: $name) -> Self {
                    $channel::$name(p)
                }
            }
        )*
    };
}

pub mod capsule;
pub mod frame;
pub mod gtrace;
pub mod payload;
pub mod profiler;

pub use capsule::{CapsuleEnvelope, CapsulePayload};
pub use gtrace::{GtraceEnvelope, GtracePayload};
pub use profiler::{ProfilerEnvelope, ProfilerPayload};

#[derive(Serialize)]
struct WireOut<'a> {
    type_id: u32,
    ref_id: &'a str,
    payload: Value,
}

#[derive(Deserialize)]
struct WireIn {
    type_id: u32,
    #[serde(default)]
    ref_id: String,
    #[serde(default)]
    payload: Value,
}

/// One logical message: a correlation id and exactly one payload.
///
/// `ref_id` matches replies to requests and doubles as the subscription id
/// for subscribe requests.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<P> {
    pub ref_id: String,
    pub payload: P,
}

impl<P: ChannelPayload> Envelope<P> {
    pub fn new(ref_id: impl Into<String>, payload: impl Into<P>) -> Self {
        Self {
            ref_id: ref_id.into(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn type_id(&self) -> u32 {
        self.payload.type_id()
    }

    #[must_use]
    pub fn payload_name(&self) -> &'static str {
        self.payload.payload_name()
    }

    /// Build a reply that carries this envelope's `ref_id`.
    pub fn reply(&self, payload: impl Into<P>) -> Self {
        Self::new(self.ref_id.clone(), payload)
    }

    /// Serialize to the wire text form.
    pub fn encode(&self) -> Result<String, CodecError> {
        let text = serde_json::to_string(&WireOut {
            type_id: self.type_id(),
            ref_id: &self.ref_id,
            payload: self.payload.to_value()?,
        })?;
        tracing::trace!(
            channel = P::CHANNEL,
            payload = self.payload_name(),
            size = text.len(),
            "encode envelope"
        );
        metrics::histogram!(
            "envelope.encode.size",
            "channel" => P::CHANNEL,
            "payload" => self.payload_name()
        )
        .record(text.len() as f64);
        Ok(text)
    }

    /// Parse wire text. A `type_id` outside this channel's registry is an
    /// error; the caller drops the message.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let wire: WireIn = serde_json::from_str(text)
            .map_err(|err| CodecError::InvalidEnvelope(err.to_string()))?;
        let body = match wire.payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            body @ Value::Object(_) => body,
            other => {
                return Err(CodecError::InvalidEnvelope(format!(
                    "payload must be an object, got {other}"
                )));
            }
        };
        let payload = P::from_value(wire.type_id, body)?;
        metrics::histogram!(
            "envelope.decode.size",
            "channel" => P::CHANNEL,
            "payload" => payload.payload_name()
        )
        .record(text.len() as f64);
        Ok(Self {
            ref_id: wire.ref_id,
            payload,
        })
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| CodecError::InvalidEnvelope(err.to_string()))?;
        Self::decode(text)
    }

    /// Typed access to the active payload.
    pub fn payload_as<T: PayloadKind<P>>(&self) -> Result<&T, CodecError> {
        T::from_payload(&self.payload).ok_or(CodecError::PayloadMismatch {
            expected: T::NAME,
            actual: self.payload_name(),
        })
    }

    pub fn payload_as_mut<T: PayloadKind<P>>(&mut self) -> Result<&mut T, CodecError> {
        let actual = self.payload_name();
        T::from_payload_mut(&mut self.payload).ok_or(CodecError::PayloadMismatch {
            expected: T::NAME,
            actual,
        })
    }

    /// Deep-copy `src` into `self`, reusing existing allocations where
    /// possible.
    pub fn copy_from(&mut self, src: &Self) {
        self.ref_id.clone_from(&src.ref_id);
        self.payload.clone_from(&src.payload);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::payload::*;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn test_envelope_shape() {
        let envelope = CapsuleEnvelope::new(
            "42",
            TsWrite {
                uri: "/capsule/c/cpuevent".into(),
                index: 3,
                timestamp: 99,
                end_timestamp: 0,
                payload: json!({"name": "kernel"}),
            },
        );
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type_id": 30,
                "ref_id": "42",
                "payload": {
                    "uri": "/capsule/c/cpuevent",
                    "index": 3,
                    "timestamp": 99,
                    "end_timestamp": 0,
                    "payload": {"name": "kernel"}
                }
            })
        );
    }

    #[test]
    fn test_bogus_type_id() {
        let err = GtraceEnvelope::decode(r#"{"type_id": 999, "ref_id": "", "payload": {}}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnknownTypeId {
                channel: "gtrace",
                type_id: 999
            }
        ));
    }

    #[test]
    fn malformed_text_is_an_error() {
        for text in [
            "",
            "not json",
            "[]",
            r#"{"ref_id": "x"}"#,
            r#"{"type_id": -1}"#,
            r#"{"type_id": 10, "payload": 5}"#,
        ] {
            assert!(CapsuleEnvelope::decode(text).is_err(), "{text}");
        }
    }

    #[test]
    fn missing_payload_is_empty_object() {
        let envelope = CapsuleEnvelope::decode(r#"{"type_id": 10}"#).unwrap();
        assert_eq!(envelope.payload, CapsulePayload::PingPong(PingPong {}));
        assert_eq!(envelope.ref_id, "");
    }

    #[test]
    fn typed_access_reports_mismatch() {
        let mut envelope = GtraceEnvelope::new("a", KvRead::default());
        assert!(envelope.payload_as::<KvRead>().is_ok());
        match envelope.payload_as::<SqlRead>() {
            Err(CodecError::PayloadMismatch { expected, actual }) => {
                assert_eq!(expected, "SqlRead");
                assert_eq!(actual, "KvRead");
            }
            other => panic!("unexpected {other:?}"),
        }
        envelope.payload_as_mut::<KvRead>().unwrap().success = true;
        assert!(envelope.payload_as::<KvRead>().unwrap().success);
    }

    #[test]
    fn copy_from_is_deep() {
        let src = GtraceEnvelope::new(
            "src",
            SqlRead {
                query: "SELECT 1".into(),
                ..SqlRead::default()
            },
        );
        let mut dst = GtraceEnvelope::new("dst", PingPong {});
        dst.copy_from(&src);
        drop(src);
        assert_eq!(dst.ref_id, "src");
        assert_eq!(dst.payload_as::<SqlRead>().unwrap().query, "SELECT 1");
    }

    #[test]
    fn reply_keeps_ref_id() {
        let request = CapsuleEnvelope::new("reg-1", capsule::CapsuleRegister::default());
        let reply = request.reply(PingPong {});
        assert_eq!(reply.ref_id, "reg-1");
        assert_eq!(reply.type_id(), 10);
    }

    fn arb_text() -> impl Strategy<Value = String> {
        "[a-z/_0-9]{0,12}"
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
            vec(any::<u32>(), 0..4).prop_map(|items| json!(items)),
            (arb_text(), any::<i32>()).prop_map(|(key, value)| {
                Value::Object(serde_json::Map::from_iter([(key, Value::from(value))]))
            }),
        ]
    }

    /// Quarter steps survive the JSON text form exactly.
    fn arb_f64() -> impl Strategy<Value = f64> {
        (0u32..4_000_000).prop_map(|n| f64::from(n) / 4.0)
    }

    fn arb_sql_result() -> impl Strategy<Value = SqlQueryResult> {
        (1usize..4)
            .prop_flat_map(|width| {
                (vec(arb_text(), width), vec(vec(arb_text(), width), 0..4))
            })
            .prop_map(|(columns, rows)| SqlQueryResult { columns, rows })
    }

    fn arb_register() -> impl Strategy<Value = capsule::CapsuleRegister> {
        let info = (arb_text(), arb_text(), any::<u64>(), arb_text(), any::<u32>()).prop_map(
            |(global_id, cpu_global_id, start_tsc, state, pid)| capsule::CapsuleInfo {
                global_id,
                cpu_global_id,
                start_time: "2026-01-01T00:00:00Z".into(),
                start_tsc,
                end_time: String::new(),
                state,
                kernel_version: "6.8.0".into(),
                os_distribution: "Ubuntu 24.04".into(),
                pid,
                ip_addr: "10.0.0.1".into(),
            },
        );
        let cpu = (arb_text(), arb_f64(), any::<u64>(), any::<u8>(), any::<u64>()).prop_map(
            |(cpu_name, tsc_freq, num_cpu_cores, num_numa_nodes, dram_size)| capsule::CpuInfo {
                global_id: "cpu-10.0.0.1".into(),
                cpu_name,
                ip_addr: "10.0.0.1".into(),
                tsc_freq,
                num_cpu_cores,
                num_numa_nodes,
                dram_size,
            },
        );
        let gpu = (arb_text(), any::<i32>(), any::<u16>(), any::<u16>(), any::<u64>()).prop_map(
            |(global_id, local_id, macro_arch, micro_arch, num_sms)| capsule::GpuInfo {
                global_id,
                cpu_global_id: "cpu-10.0.0.1".into(),
                local_id,
                pcie_bus_id: "0000:01:00.0".into(),
                chip_name: "ga100".into(),
                macro_arch,
                micro_arch,
                num_sms,
                hbm_size: 80 << 30,
            },
        );
        (any::<bool>(), info, cpu, vec(gpu, 0..3)).prop_map(
            |(success, capsule_info, cpu_info, list_gpu_info)| capsule::CapsuleRegister {
                success,
                capsule_info,
                cpu_info,
                list_gpu_info,
            },
        )
    }

    fn arb_capsule_payload() -> impl Strategy<Value = CapsulePayload> {
        prop_oneof![
            Just(CapsulePayload::PingPong(PingPong {})),
            Just(CapsulePayload::Heartbeat(Heartbeat {})),
            (arb_text(), arb_json()).prop_map(|(uri, write_payload)| {
                CapsulePayload::KvWrite(KvWrite { uri, write_payload })
            }),
            (arb_text(), any::<u64>(), any::<u64>(), any::<u64>(), arb_json()).prop_map(
                |(uri, index, timestamp, end_timestamp, payload)| {
                    CapsulePayload::TsWrite(TsWrite {
                        uri,
                        index,
                        timestamp,
                        end_timestamp,
                        payload,
                    })
                }
            ),
            (arb_text(), btree_map(arb_text(), arb_json(), 0..4)).prop_map(
                |(table_name, insert_data)| {
                    CapsulePayload::SqlWrite(SqlWrite {
                        table_name,
                        insert_data,
                    })
                }
            ),
            (arb_text(), arb_text(), any::<bool>()).prop_map(|(table_name, schema, success)| {
                CapsulePayload::SqlCreateTable(SqlCreateTable {
                    table_name,
                    schema,
                    success,
                })
            }),
            (arb_text(), any::<bool>()).prop_map(|(table_name, success)| {
                CapsulePayload::SqlDropTable(SqlDropTable {
                    table_name,
                    success,
                })
            }),
            arb_register().prop_map(CapsulePayload::CapsuleRegister),
        ]
    }

    fn arb_gtrace_kv() -> impl Strategy<Value = GtracePayload> {
        prop_oneof![
            Just(GtracePayload::PingPong(PingPong {})),
            Just(GtracePayload::Heartbeat(Heartbeat {})),
            (arb_text(), arb_json()).prop_map(|(uri, write_payload)| {
                GtracePayload::KvWrite(KvWrite { uri, write_payload })
            }),
            (arb_text(), arb_json(), any::<bool>()).prop_map(|(uri, read_payload, success)| {
                GtracePayload::KvRead(KvRead {
                    uri,
                    read_payload,
                    success,
                })
            }),
            (arb_text(), arb_json(), any::<bool>()).prop_map(|(uri, read_payload, success)| {
                GtracePayload::KvStream(KvStream {
                    uri,
                    read_payload,
                    success,
                })
            }),
            (arb_text(), any::<bool>()).prop_map(|(uri, success)| {
                GtracePayload::KvSubscribe(KvSubscribe { uri, success })
            }),
            (arb_text(), any::<bool>()).prop_map(|(uri, success)| {
                GtracePayload::KvUnsubscribe(KvUnsubscribe { uri, success })
            }),
        ]
    }

    fn arb_ts_fields() -> impl Strategy<Value = (String, u64, u64, Value, bool)> {
        (arb_text(), any::<u64>(), any::<u64>(), arb_json(), any::<bool>())
    }

    fn arb_gtrace_ts_sql() -> impl Strategy<Value = GtracePayload> {
        prop_oneof![
            arb_ts_fields().prop_map(|(uri, index, timestamp, read_payload, success)| {
                GtracePayload::TsRead(TsRead {
                    uri,
                    index,
                    timestamp,
                    read_payload,
                    success,
                })
            }),
            arb_ts_fields().prop_map(|(uri, index, timestamp, read_payload, success)| {
                GtracePayload::TsStream(TsStream {
                    uri,
                    index,
                    timestamp,
                    read_payload,
                    success,
                })
            }),
            (arb_text(), any::<bool>()).prop_map(|(uri, success)| {
                GtracePayload::TsSubscribe(TsSubscribe { uri, success })
            }),
            (arb_text(), any::<bool>()).prop_map(|(uri, success)| {
                GtracePayload::TsUnsubscribe(TsUnsubscribe { uri, success })
            }),
            (arb_text(), arb_sql_result(), any::<bool>()).prop_map(
                |(query, query_result, success)| {
                    GtracePayload::SqlRead(SqlRead {
                        query,
                        query_result,
                        success,
                    })
                }
            ),
            (arb_text(), arb_sql_result(), any::<bool>()).prop_map(
                |(query, query_result, success)| {
                    GtracePayload::SqlStream(SqlStream {
                        query,
                        query_result,
                        success,
                    })
                }
            ),
            (arb_text(), any::<bool>()).prop_map(|(uri, success)| {
                GtracePayload::SqlSubscribe(SqlSubscribe { uri, success })
            }),
            (arb_text(), any::<bool>()).prop_map(|(uri, success)| {
                GtracePayload::SqlUnsubscribe(SqlUnsubscribe { uri, success })
            }),
        ]
    }

    fn arb_gtrace_agent() -> impl Strategy<Value = GtracePayload> {
        use gtrace::*;
        prop_oneof![
            (arb_text(), arb_text(), arb_text(), ".{0,16}", any::<bool>()).prop_map(
                |(context_global_id, url, model, token, is_success)| {
                    GtracePayload::AgentCreateContext(AgentCreateContext {
                        context_global_id,
                        user_config: AgentUserConfig {
                            api_service_url: url,
                            api_service_model_name: model,
                            api_service_token: token,
                        },
                        is_success,
                    })
                }
            ),
            (arb_text(), any::<bool>()).prop_map(|(context_global_id, is_success)| {
                GtracePayload::AgentDestroyContext(AgentDestroyContext {
                    context_global_id,
                    is_success,
                })
            }),
            (arb_text(), vec(arb_text(), 0..3), arb_text(), any::<bool>()).prop_map(
                |(context_global_id, parents, task_global_id, is_success)| {
                    GtracePayload::AgentCreateTask(AgentCreateTask {
                        context_global_id,
                        list_parent_task_global_idx: parents,
                        task_global_id,
                        is_success,
                    })
                }
            ),
            (arb_text(), arb_text(), any::<bool>()).prop_map(
                |(context_global_id, task_global_id, is_success)| {
                    GtracePayload::AgentDestroyTask(AgentDestroyTask {
                        context_global_id,
                        task_global_id,
                        is_success,
                    })
                }
            ),
            (
                (arb_text(), arb_text(), arb_text()),
                (0u32..3, any::<bool>(), any::<bool>()),
                ".{0,24}",
                vec(arb_text(), 0..3),
            )
                .prop_map(|(ids, flags, body, list_github_bodies)| {
                    let (context_global_id, task_global_id, content_global_id) = ids;
                    let (content_typeid, do_execute, is_success) = flags;
                    GtracePayload::AgentCreateContent(AgentCreateContent {
                        context_global_id,
                        task_global_id,
                        content_global_id,
                        content_typeid,
                        do_execute,
                        is_success,
                        body,
                        list_github_bodies,
                    })
                }),
            (
                arb_text(),
                btree_map(any::<u32>(), ".{0,16}", 0..3),
                btree_map(any::<u32>(), ".{0,16}", 0..3),
                any::<bool>(),
                any::<bool>(),
            )
                .prop_map(|(content_global_id, reasoning, output, is_success, is_end)| {
                    GtracePayload::AgentStream(AgentStream {
                        content_global_id,
                        map_reasoning_output: reasoning,
                        map_non_reasoning_output: output,
                        is_success,
                        is_end,
                    })
                }),
        ]
    }

    fn arb_gtrace_payload() -> impl Strategy<Value = GtracePayload> {
        prop_oneof![arb_gtrace_kv(), arb_gtrace_ts_sql(), arb_gtrace_agent()]
    }

    fn arb_profiler_payload() -> impl Strategy<Value = ProfilerPayload> {
        use profiler::*;
        let begin = (
            (any::<i32>(), any::<u64>(), any::<i32>(), any::<i32>()),
            (0u8..2, 0u8..2),
            (any::<i32>(), any::<i32>(), any::<i32>()),
            any::<bool>(),
        )
            .prop_map(|(session, modes, nesting, success)| {
                let (device_id, sign, max_launches_per_pass, max_ranges_per_pass) = session;
                ProfilerBegin {
                    device_id,
                    sign,
                    max_launches_per_pass,
                    max_ranges_per_pass,
                    cupti_profile_range_mode: modes.0,
                    cupti_profile_reply_mode: modes.1,
                    cupti_profile_min_nesting_level: nesting.0,
                    cupti_profile_num_nesting_levels: nesting.1,
                    cupti_profile_target_nesting_levels: nesting.2,
                    success,
                }
            });
        prop_oneof![
            Just(ProfilerPayload::PingPong(PingPong {})),
            Just(ProfilerPayload::Heartbeat(Heartbeat {})),
            (vec(arb_text(), 0..4), any::<u64>(), any::<bool>()).prop_map(
                |(metric_names, sign, success)| {
                    ProfilerPayload::ProfilerSetMetrics(ProfilerSetMetrics {
                        metric_names,
                        sign,
                        success,
                    })
                }
            ),
            begin.prop_map(ProfilerPayload::ProfilerBegin),
            (any::<i32>(), btree_map(arb_text(), arb_f64(), 0..4), any::<bool>()).prop_map(
                |(device_id, map_metric_results, success)| {
                    ProfilerPayload::ProfilerEnd(ProfilerEnd {
                        device_id,
                        map_metric_results,
                        success,
                    })
                }
            ),
        ]
    }

    /// Encode, check the wire `type_id`, decode, compare.
    fn round_trip<P>(ref_id: String, payload: P) -> Result<(), TestCaseError>
    where
        P: ChannelPayload + PartialEq + std::fmt::Debug,
    {
        let envelope = Envelope { ref_id, payload };
        let text = envelope.encode().unwrap();
        let wire: Value = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(&wire["type_id"], &json!(envelope.type_id()));
        let decoded = Envelope::<P>::decode(&text).unwrap();
        prop_assert_eq!(decoded.type_id(), envelope.type_id());
        prop_assert_eq!(decoded, envelope);
        Ok(())
    }

    fn type_ids_drawn<P>(strategy: impl Strategy<Value = P>) -> BTreeSet<u32>
    where
        P: ChannelPayload + std::fmt::Debug,
    {
        let mut runner = TestRunner::deterministic();
        (0..2000)
            .map(|_| strategy.new_tree(&mut runner).unwrap().current().type_id())
            .collect()
    }

    #[test]
    fn strategies_cover_every_payload_kind() {
        let registry = |ids: &[u32]| ids.iter().copied().collect::<BTreeSet<_>>();
        assert_eq!(
            type_ids_drawn(arb_capsule_payload()),
            registry(CapsulePayload::type_ids())
        );
        assert_eq!(
            type_ids_drawn(arb_gtrace_payload()),
            registry(GtracePayload::type_ids())
        );
        assert_eq!(
            type_ids_drawn(arb_profiler_payload()),
            registry(ProfilerPayload::type_ids())
        );
    }

    proptest! {
        #[test]
        fn capsule_envelope_round_trip(ref_id in arb_text(), payload in arb_capsule_payload()) {
            round_trip(ref_id, payload)?;
        }

        #[test]
        fn gtrace_envelope_round_trip(ref_id in arb_text(), payload in arb_gtrace_payload()) {
            round_trip(ref_id, payload)?;
        }

        #[test]
        fn profiler_envelope_round_trip(ref_id in arb_text(), payload in arb_profiler_payload()) {
            round_trip(ref_id, payload)?;
        }

        #[test]
        fn decode_never_panics(text in ".{0,64}") {
            let _ = CapsuleEnvelope::decode(&text);
            let _ = GtraceEnvelope::decode(&text);
            let _ = ProfilerEnvelope::decode(&text);
        }
    }
}
