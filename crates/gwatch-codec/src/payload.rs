//! Payload kinds shared by every channel: utility, KV, time-series and SQL.
//!
//! Every field carries a serde default so a peer may omit any key, the same
//! way it may omit optional keys in any JSON body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Empty request/reply used for liveness checks. The reply echoes the request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPong {}

/// Keep-alive notice. Never answered.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvWrite {
    pub uri: String,
    pub write_payload: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvRead {
    pub uri: String,
    pub read_payload: Value,
    pub success: bool,
}

/// Pushed to a KV subscriber: the new value at `uri`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvStream {
    pub uri: String,
    pub read_payload: Value,
    pub success: bool,
}

macro_rules! subscription_payloads {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
            #[serde(default)]
            pub struct $name {
                pub uri: String,
                pub success: bool,
            }

            impl $name {
                #[must_use]
                pub fn new(uri: impl Into<String>) -> Self {
                    Self {
                        uri: uri.into(),
                        success: false,
                    }
                }
            }
        )*
    };
}

// Subscribe requests double as their own reply with `success` filled in.
// The request's ref_id becomes the subscription id.
subscription_payloads! {
    /// Subscribe to KV keys containing `uri`.
    KvSubscribe,
    KvUnsubscribe,
    /// Subscribe to the time-series at exactly `uri`.
    TsSubscribe,
    TsUnsubscribe,
    /// Subscribe to inserts into table `uri`.
    SqlSubscribe,
    SqlUnsubscribe,
}

/// Timestamped write into the time-series store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsWrite {
    pub uri: String,
    pub index: u64,
    pub timestamp: u64,
    pub end_timestamp: u64,
    pub payload: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsRead {
    pub uri: String,
    pub index: u64,
    pub timestamp: u64,
    pub read_payload: Value,
    pub success: bool,
}

/// One time-series sample pushed to a subscriber.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsStream {
    pub uri: String,
    pub index: u64,
    pub timestamp: u64,
    pub read_payload: Value,
    pub success: bool,
}

/// Insert one row; values are keyed by column name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlWrite {
    pub table_name: String,
    pub insert_data: BTreeMap<String, Value>,
}

/// Tabular query result. Every cell is rendered as text; NULL is "".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlQueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SqlQueryResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlRead {
    pub query: String,
    pub query_result: SqlQueryResult,
    pub success: bool,
}

/// Pushed to a SQL subscriber. `query` holds the subscribed table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlStream {
    pub query: String,
    pub query_result: SqlQueryResult,
    pub success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlCreateTable {
    pub table_name: String,
    pub schema: String,
    pub success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlDropTable {
    pub table_name: String,
    pub success: bool,
}
