//! Profiler channel (`/profiler/main`): the scheduler driving a per-host
//! profiling worker.

use crate::payload::{Heartbeat, PingPong};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies a profiled image (kernel binary).
pub type ImageSign = u64;

pub const DEFAULT_MAX_LAUNCHES_PER_PASS: i32 = 512;
pub const DEFAULT_MAX_RANGES_PER_PASS: i32 = 64;
pub const DEFAULT_MIN_NESTING_LEVEL: i32 = 1;
pub const DEFAULT_NUM_NESTING_LEVELS: i32 = 1;
pub const DEFAULT_TARGET_NESTING_LEVELS: i32 = 1;

/// How profiled ranges are delimited.
pub const RANGE_MODE_AUTO: u8 = 0;
pub const RANGE_MODE_USER: u8 = 1;

/// How counter passes are replayed.
pub const REPLAY_MODE_KERNEL: u8 = 0;
pub const REPLAY_MODE_USER: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerSetMetrics {
    pub metric_names: Vec<String>,
    pub sign: ImageSign,
    pub success: bool,
}

/// Opens a profiling session on one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerBegin {
    pub device_id: i32,
    pub sign: ImageSign,
    pub max_launches_per_pass: i32,
    pub max_ranges_per_pass: i32,
    pub cupti_profile_range_mode: u8,
    pub cupti_profile_reply_mode: u8,
    pub cupti_profile_min_nesting_level: i32,
    pub cupti_profile_num_nesting_levels: i32,
    pub cupti_profile_target_nesting_levels: i32,
    pub success: bool,
}

impl Default for ProfilerBegin {
    fn default() -> Self {
        Self {
            device_id: -1,
            sign: 0,
            max_launches_per_pass: DEFAULT_MAX_LAUNCHES_PER_PASS,
            max_ranges_per_pass: DEFAULT_MAX_RANGES_PER_PASS,
            cupti_profile_range_mode: RANGE_MODE_USER,
            cupti_profile_reply_mode: REPLAY_MODE_USER,
            cupti_profile_min_nesting_level: DEFAULT_MIN_NESTING_LEVEL,
            cupti_profile_num_nesting_levels: DEFAULT_NUM_NESTING_LEVELS,
            cupti_profile_target_nesting_levels: DEFAULT_TARGET_NESTING_LEVELS,
            success: false,
        }
    }
}

/// Closes a session; the reply carries the collected metric values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerEnd {
    pub device_id: i32,
    pub map_metric_results: BTreeMap<String, f64>,
    pub success: bool,
}

impl Default for ProfilerEnd {
    fn default() -> Self {
        Self {
            device_id: -1,
            map_metric_results: BTreeMap::new(),
            success: false,
        }
    }
}

channel! {
    /// Every payload kind accepted on the profiler channel.
    ProfilerPayload = "profiler" {
        PingPong: 10,
        Heartbeat: 11,
        ProfilerSetMetrics: 100,
        ProfilerBegin: 101,
        ProfilerEnd: 102,
    }
}

/// Envelope on the profiler channel.
pub type ProfilerEnvelope = crate::Envelope<ProfilerPayload>;
