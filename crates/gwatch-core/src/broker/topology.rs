//! Topology tables: capsules, CPUs, GPUs and trace results.

use crate::Result;
use crate::store::SqlStore;
use gwatch_codec::capsule::CapsuleRegister;
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub const TABLE_CAPSULE: &str = "mgnt_capsule";
pub const TABLE_CPU: &str = "mgnt_cpu";
pub const TABLE_GPU: &str = "mgnt_gpu";
pub const TABLE_CAPSULE_GPU: &str = "mgnt_capsule_gpu";
pub const TABLE_CPU_GPU: &str = "mgnt_cpu_gpu";
pub const TABLE_TRACE: &str = "mgnt_trace";

const SCHEMA: &[(&str, &str)] = &[
    (
        TABLE_CAPSULE,
        "(global_id TEXT PRIMARY KEY, cpu_global_id TEXT NOT NULL, start_time TEXT NOT NULL, \
         start_tsc DOUBLE NOT NULL, end_time TEXT, state TEXT NOT NULL, \
         kernel_version TEXT NOT NULL, os_distribution TEXT NOT NULL, \
         pid INTEGER NOT NULL, ip_addr TEXT NOT NULL)",
    ),
    (
        TABLE_CPU,
        "(global_id TEXT PRIMARY KEY, cpu_name TEXT NOT NULL, ip_addr TEXT NOT NULL, \
         tsc_freq DOUBLE NOT NULL, num_cpu_cores INTEGER NOT NULL, \
         num_numa_nodes INTEGER NOT NULL, dram_size INTEGER NOT NULL)",
    ),
    (
        TABLE_GPU,
        "(global_id TEXT PRIMARY KEY, cpu_global_id TEXT NOT NULL, pcie_bus_id TEXT NOT NULL, \
         chip_name TEXT NOT NULL, macro_arch INTEGER NOT NULL, micro_arch INTEGER NOT NULL, \
         num_SMs INTEGER NOT NULL, hbm_size INTEGER NOT NULL)",
    ),
    (
        TABLE_CAPSULE_GPU,
        "(capsule_global_id TEXT NOT NULL, gpu_global_id TEXT NOT NULL, \
         gpu_local_id INTEGER NOT NULL, \
         UNIQUE(capsule_global_id, gpu_global_id, gpu_local_id) ON CONFLICT IGNORE)",
    ),
    (
        TABLE_CPU_GPU,
        "(cpu_global_id TEXT NOT NULL, gpu_global_id TEXT NOT NULL, \
         UNIQUE(cpu_global_id, gpu_global_id) ON CONFLICT IGNORE)",
    ),
    (
        TABLE_TRACE,
        "(global_id TEXT PRIMARY KEY, target TEXT NOT NULL, type TEXT NOT NULL)",
    ),
];

/// Create every topology table that does not exist yet.
pub fn bootstrap(sql: &SqlStore) -> Result<()> {
    for (table, schema) in SCHEMA {
        sql.create_table(table, schema)?;
    }
    tracing::debug!(tables = SCHEMA.len(), "topology tables ready");
    Ok(())
}

fn row<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Record a capsule's REGISTER reply. Rows that already exist are kept.
pub fn record(sql: &SqlStore, register: &CapsuleRegister) -> Result<()> {
    let capsule = &register.capsule_info;
    let cpu = &register.cpu_info;
    let cpu_global_id = &capsule.cpu_global_id;

    sql.insert_row_if_absent(
        TABLE_CAPSULE,
        &row([
            ("global_id", json!(capsule.global_id)),
            ("cpu_global_id", json!(cpu_global_id)),
            ("start_time", json!(capsule.start_time)),
            ("start_tsc", json!(capsule.start_tsc)),
            ("end_time", json!(capsule.end_time)),
            ("state", json!(capsule.state)),
            ("kernel_version", json!(capsule.kernel_version)),
            ("os_distribution", json!(capsule.os_distribution)),
            ("pid", json!(capsule.pid)),
            ("ip_addr", json!(capsule.ip_addr)),
        ]),
    )?;
    sql.insert_row_if_absent(
        TABLE_CPU,
        &row([
            ("global_id", json!(cpu_global_id)),
            ("cpu_name", json!(cpu.cpu_name)),
            ("ip_addr", json!(cpu.ip_addr)),
            ("tsc_freq", json!(cpu.tsc_freq)),
            ("num_cpu_cores", json!(cpu.num_cpu_cores)),
            ("num_numa_nodes", json!(cpu.num_numa_nodes)),
            ("dram_size", json!(cpu.dram_size)),
        ]),
    )?;
    for gpu in &register.list_gpu_info {
        sql.insert_row_if_absent(
            TABLE_GPU,
            &row([
                ("global_id", json!(gpu.global_id)),
                ("cpu_global_id", json!(cpu_global_id)),
                ("pcie_bus_id", json!(gpu.pcie_bus_id)),
                ("chip_name", json!(gpu.chip_name)),
                ("macro_arch", json!(gpu.macro_arch)),
                ("micro_arch", json!(gpu.micro_arch)),
                ("num_SMs", json!(gpu.num_sms)),
                ("hbm_size", json!(gpu.hbm_size)),
            ]),
        )?;
        sql.insert_row_if_absent(
            TABLE_CAPSULE_GPU,
            &row([
                ("capsule_global_id", json!(capsule.global_id)),
                ("gpu_global_id", json!(gpu.global_id)),
                ("gpu_local_id", json!(gpu.local_id)),
            ]),
        )?;
        sql.insert_row_if_absent(
            TABLE_CPU_GPU,
            &row([
                ("cpu_global_id", json!(cpu_global_id)),
                ("gpu_global_id", json!(gpu.global_id)),
            ]),
        )?;
    }
    tracing::info!(
        capsule = %capsule.global_id,
        cpu = %cpu_global_id,
        gpus = register.list_gpu_info.len(),
        "capsule topology recorded"
    );
    Ok(())
}
