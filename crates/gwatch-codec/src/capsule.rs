//! Capsule channel (`/capsule/main`): traffic between an in-process capsule
//! agent and the scheduler.

use crate::payload::{KvWrite, PingPong, SqlCreateTable, SqlDropTable, SqlWrite, TsWrite};
use serde::{Deserialize, Serialize};

pub use crate::payload::Heartbeat;

/// Identity and host environment of one capsule process.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleInfo {
    pub global_id: String,
    pub cpu_global_id: String,
    pub start_time: String,
    pub start_tsc: u64,
    pub end_time: String,
    pub state: String,
    pub kernel_version: String,
    pub os_distribution: String,
    pub pid: u32,
    pub ip_addr: String,
}

/// Host CPU the capsule runs on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuInfo {
    pub global_id: String,
    pub cpu_name: String,
    pub ip_addr: String,
    pub tsc_freq: f64,
    pub num_cpu_cores: u64,
    pub num_numa_nodes: u8,
    pub dram_size: u64,
}

/// One GPU visible to the capsule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuInfo {
    pub global_id: String,
    pub cpu_global_id: String,
    pub local_id: i32,
    pub pcie_bus_id: String,
    pub chip_name: String,
    pub macro_arch: u16,
    pub micro_arch: u16,
    #[serde(rename = "num_SMs")]
    pub num_sms: u64,
    pub hbm_size: u64,
}

/// Sent by the scheduler with an empty body right after a capsule connects;
/// the capsule answers with the same `ref_id` and its topology filled in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleRegister {
    pub success: bool,
    pub capsule_info: CapsuleInfo,
    pub cpu_info: CpuInfo,
    pub list_gpu_info: Vec<GpuInfo>,
}

channel! {
    /// Every payload kind accepted on the capsule channel.
    CapsulePayload = "capsule" {
        PingPong: 10,
        KvWrite: 20,
        TsWrite: 30,
        SqlWrite: 40,
        SqlCreateTable: 43,
        SqlDropTable: 44,
        Heartbeat: 100,
        CapsuleRegister: 101,
    }
}

/// Envelope on the capsule channel.
pub type CapsuleEnvelope = crate::Envelope<CapsulePayload>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelPayload, CodecError};
    use serde_json::json;

    #[test]
    fn register_wire_keys() {
        let register = CapsuleRegister {
            success: true,
            list_gpu_info: vec![GpuInfo {
                global_id: "gpu-0".into(),
                num_sms: 132,
                ..GpuInfo::default()
            }],
            ..CapsuleRegister::default()
        };
        let text = CapsuleEnvelope::new("r1", register).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type_id"], json!(101));
        assert_eq!(value["payload"]["list_gpu_info"][0]["num_SMs"], json!(132));
        assert!(value["payload"]["capsule_info"].is_object());
    }

    #[test]
    fn gtrace_kinds_are_rejected() {
        let text = r#"{"type_id": 41, "ref_id": "x", "payload": {}}"#;
        assert!(matches!(
            CapsuleEnvelope::decode(text),
            Err(CodecError::UnknownTypeId {
                channel: "capsule",
                type_id: 41
            })
        ));
    }

    #[test]
    fn registry_is_closed() {
        assert_eq!(
            CapsulePayload::type_ids(),
            &[10, 20, 30, 40, 43, 44, 100, 101]
        );
    }
}
