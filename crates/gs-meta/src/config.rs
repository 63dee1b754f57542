//! Process-level configuration: TOML file plus serde defaults, no
//! environment-variable layer beyond `RUST_LOG` (handled by `gs-log`).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:7700".parse().unwrap()
}
fn default_agent_port() -> u16 {
    7800
}
fn default_protection_interval_ms() -> u64 {
    3_000
}
fn default_fix_action_retry_ms() -> u64 {
    1_000
}
fn default_change_out_retry_attempts() -> u32 {
    3
}
fn default_change_out_retry_ms() -> u64 {
    500
}
fn default_dashboard_min_period_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Every machine's agent is assumed reachable at `http://<node
    /// host>:<agent_port>` — the node's own address names its TCP data
    /// port, not its control-plane port, so the two are kept separate and
    /// every agent in a deployment listens on the same fixed port
    /// (see DESIGN.md for the reasoning).
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default = "default_protection_interval_ms")]
    pub protection_interval_ms: u64,
    #[serde(default = "default_fix_action_retry_ms")]
    pub fix_action_retry_ms: u64,
    #[serde(default = "default_change_out_retry_attempts")]
    pub change_out_retry_attempts: u32,
    #[serde(default = "default_change_out_retry_ms")]
    pub change_out_retry_ms: u64,
    /// Floor applied to a `send_dashboard` caller's requested
    /// `send_period`, so a misconfigured client can't busy-loop the
    /// websocket handler.
    #[serde(default = "default_dashboard_min_period_ms")]
    pub dashboard_min_period_ms: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        toml::from_str("").expect("every field has a default")
    }
}

impl MetaConfig {
    pub fn protection_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.protection_interval_ms)
    }
    pub fn fix_action_retry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fix_action_retry_ms)
    }
    pub fn change_out_retry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.change_out_retry_ms)
    }
    pub fn dashboard_min_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dashboard_min_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config = MetaConfig::default();
        assert_eq!(config.agent_port, 7800);
    }
}
