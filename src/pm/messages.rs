//! Wire messages exchanged between deputies and the sheriff.
//!
//! Every message carries `utime` (microseconds since the epoch) so receivers
//! can discard stale traffic.

use serde::{Deserialize, Serialize};

pub const DISCOVERY_CHANNEL: &str = "PM_DISCOVER";
pub const INFO_CHANNEL: &str = "PM_INFO";
pub const ORDERS_CHANNEL: &str = "PM_ORDERS";
pub const OUTPUT_CHANNEL: &str = "PM_OUTPUT";

pub const DEFAULT_STOP_SIGNAL: i32 = 2;
pub const DEFAULT_STOP_TIME_ALLOWED: f32 = 7.0;

/// Broadcast while a deputy probes for peers with the same id. The nonce is
/// the sender's pid, so a deputy can tell its own pings apart from a
/// conflicting twin's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub utime: i64,
    pub transmitter_id: String,
    pub nonce: i32,
}

/// Static description of one command, shared by orders and status reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdSpec {
    pub exec_str: String,
    pub command_id: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub auto_respawn: bool,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: i32,
    #[serde(default = "default_stop_time_allowed")]
    pub stop_time_allowed: f32,
}

fn default_stop_signal() -> i32 {
    DEFAULT_STOP_SIGNAL
}

fn default_stop_time_allowed() -> f32 {
    DEFAULT_STOP_TIME_ALLOWED
}

/// One command entry inside an orders message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdDesired {
    pub cmd: CmdSpec,
    pub desired_runid: i32,
    #[serde(default)]
    pub force_quit: bool,
}

/// Sheriff -> deputy: the full set of commands this deputy should manage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orders {
    pub utime: i64,
    pub deputy_id: String,
    #[serde(default)]
    pub cmds: Vec<CmdDesired>,
}

/// Runtime status of one command inside a deputy info message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdStatus {
    pub cmd: CmdSpec,
    pub actual_runid: i32,
    pub pid: i32,
    pub exit_code: i32,
    pub cpu_usage: f32,
    pub mem_vsize_bytes: u64,
    pub mem_rss_bytes: u64,
}

/// Deputy -> sheriff: periodic status report. Also observed by freshly
/// started peers for conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeputyInfo {
    pub utime: i64,
    pub deputy_id: String,
    pub cpu_load: f32,
    pub phys_mem_total_bytes: u64,
    pub phys_mem_free_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
    #[serde(default)]
    pub cmds: Vec<CmdStatus>,
}

/// Deputy -> sheriff: batched child output, parallel arrays keyed by
/// command id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    pub utime: i64,
    pub deputy_id: String,
    pub num_commands: i32,
    #[serde(default)]
    pub command_ids: Vec<String>,
    #[serde(default)]
    pub text: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_tolerate_missing_optional_fields() {
        let raw = r#"{
            "utime": 1000,
            "deputy_id": "host1",
            "cmds": [
                {"cmd": {"exec_str": "sleep 10", "command_id": "c1"}, "desired_runid": 1}
            ]
        }"#;
        let orders: Orders = serde_json::from_str(raw).unwrap();
        assert_eq!(orders.cmds.len(), 1);
        let entry = &orders.cmds[0];
        assert!(!entry.force_quit);
        assert_eq!(entry.cmd.stop_signal, DEFAULT_STOP_SIGNAL);
        assert_eq!(entry.cmd.stop_time_allowed, DEFAULT_STOP_TIME_ALLOWED);
        assert!(entry.cmd.group.is_empty());
    }

    #[test]
    fn deputy_info_round_trips() {
        let msg = DeputyInfo {
            utime: 42,
            deputy_id: "host1".to_string(),
            cpu_load: 0.25,
            phys_mem_total_bytes: 1 << 30,
            phys_mem_free_bytes: 1 << 29,
            swap_total_bytes: 0,
            swap_free_bytes: 0,
            cmds: vec![CmdStatus {
                cmd: CmdSpec {
                    exec_str: "sleep 10".to_string(),
                    command_id: "c1".to_string(),
                    group: "g".to_string(),
                    auto_respawn: true,
                    stop_signal: 15,
                    stop_time_allowed: 0.5,
                },
                actual_runid: 3,
                pid: 1234,
                exit_code: 0,
                cpu_usage: 0.1,
                mem_vsize_bytes: 1024,
                mem_rss_bytes: 512,
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: DeputyInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.deputy_id, "host1");
        assert_eq!(back.cmds[0].cmd.command_id, "c1");
        assert_eq!(back.cmds[0].actual_runid, 3);
    }
}
