//! gTrace channel (`/gtrace/main`): dashboards and other consumers reading
//! and subscribing to stored telemetry, plus the agent lifecycle.

use crate::payload::{
    Heartbeat, KvRead, KvStream, KvSubscribe, KvUnsubscribe, KvWrite, PingPong, SqlRead,
    SqlStream, SqlSubscribe, SqlUnsubscribe, TsRead, TsStream, TsSubscribe, TsUnsubscribe,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content kind tag on `AgentCreateContent`.
pub const CONTENT_TYPE_UNKNOWN: u32 = 0;
pub const CONTENT_TYPE_PROMPT: u32 = 1;
pub const CONTENT_TYPE_RESPONSE: u32 = 2;

/// Model-service settings attached to an agent context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentUserConfig {
    pub api_service_url: String,
    pub api_service_model_name: String,
    pub api_service_token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCreateContext {
    pub context_global_id: String,
    pub user_config: AgentUserConfig,
    pub is_success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDestroyContext {
    pub context_global_id: String,
    pub is_success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCreateTask {
    pub context_global_id: String,
    pub list_parent_task_global_idx: Vec<String>,
    pub task_global_id: String,
    pub is_success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDestroyTask {
    pub context_global_id: String,
    pub task_global_id: String,
    pub is_success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCreateContent {
    pub context_global_id: String,
    pub task_global_id: String,
    pub content_global_id: String,
    pub content_typeid: u32,
    pub do_execute: bool,
    pub is_success: bool,
    pub body: String,
    pub list_github_bodies: Vec<String>,
}

/// Incremental output of an executed content, keyed by output sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStream {
    pub content_global_id: String,
    pub map_reasoning_output: BTreeMap<u32, String>,
    pub map_non_reasoning_output: BTreeMap<u32, String>,
    pub is_success: bool,
    pub is_end: bool,
}

channel! {
    /// Every payload kind accepted on the gTrace channel.
    GtracePayload = "gtrace" {
        PingPong: 10,
        Heartbeat: 11,
        KvWrite: 20,
        KvRead: 21,
        KvStream: 22,
        KvSubscribe: 23,
        KvUnsubscribe: 24,
        TsRead: 31,
        TsStream: 32,
        TsSubscribe: 33,
        TsUnsubscribe: 34,
        SqlRead: 41,
        SqlStream: 42,
        SqlSubscribe: 45,
        SqlUnsubscribe: 46,
        AgentCreateContext: 100,
        AgentDestroyContext: 101,
        AgentCreateTask: 110,
        AgentDestroyTask: 111,
        AgentCreateContent: 120,
        AgentStream: 121,
    }
}

/// Envelope on the gTrace channel.
pub type GtraceEnvelope = crate::Envelope<GtracePayload>;
